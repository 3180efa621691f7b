use std::collections::HashMap;

use candle_core::{Device, Tensor};

use crate::batch::ScheduledRequests;
use crate::decoder::DeviceTensors;
use crate::error::Result;
use crate::executor::ModelExecutor;
use crate::request::{LlmRequest, RequestId, RequestPool};

type Script = Box<dyn Fn(RequestId, usize) -> u32 + Send>;

/// Row-ordered score matrix whose row `i` peaks at `peaks[i]`.
pub fn one_hot_scores(peaks: &[u32], vocab_size: usize) -> Tensor {
    let mut data = vec![0.0f32; peaks.len() * vocab_size];
    for (row, &p) in peaks.iter().enumerate() {
        data[row * vocab_size + p as usize] = 10.0;
    }
    Tensor::from_vec(data, (peaks.len(), vocab_size), &Device::Cpu)
        .expect("one-hot scores have a valid shape")
}

/// A model whose argmax follows `script(request_id, generated_index)`.
///
/// Generated indices are counted per request by the model itself, so they
/// stay correct when steps are overlapped. Extend rows instead read the
/// committed length and therefore assume the previous step was committed.
pub struct ScriptedModel {
    vocab_size: usize,
    script: Script,
    rows_per_beam: bool,
    emitted: HashMap<RequestId, usize>,
    calls: usize,
}

impl ScriptedModel {
    pub fn new<F>(vocab_size: usize, script: F) -> Self
    where
        F: Fn(RequestId, usize) -> u32 + Send + 'static,
    {
        Self {
            vocab_size,
            script: Box::new(script),
            rows_per_beam: false,
            emitted: HashMap::new(),
            calls: 0,
        }
    }

    /// Emit `beam_width` rows per request, as the native decoder expects.
    pub fn with_rows_per_beam(mut self) -> Self {
        self.rows_per_beam = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls
    }

    fn push_rows(&self, peaks: &mut Vec<u32>, request: &LlmRequest, token: u32) {
        let copies = if self.rows_per_beam { request.beam_width() } else { 1 };
        peaks.extend(std::iter::repeat(token % self.vocab_size as u32).take(copies));
    }

    fn next_index(&mut self, id: RequestId) -> usize {
        let counter = self.emitted.entry(id).or_insert(0);
        let index = *counter;
        *counter += 1;
        index
    }
}

impl ModelExecutor for ScriptedModel {
    fn forward(
        &mut self,
        scheduled: &ScheduledRequests,
        requests: &RequestPool,
        _previous: Option<&DeviceTensors>,
    ) -> Result<Tensor> {
        self.calls += 1;
        let mut peaks = Vec::new();
        for &id in &scheduled.context_requests {
            let request = requests.get(id)?;
            let last_chunk = request.context_chunk_size >= request.context_remaining_length();
            let token = if last_chunk {
                let index = self.next_index(id);
                (self.script)(id, index)
            } else {
                0
            };
            self.push_rows(&mut peaks, request, token);
        }
        for &id in &scheduled.extend_requests {
            let request = requests.get(id)?;
            let base = request.generated_tokens(0).len();
            for j in 0..=request.num_draft_tokens() {
                self.push_rows(&mut peaks, request, (self.script)(id, base + j));
            }
            self.emitted.insert(id, base + 1);
        }
        for &id in &scheduled.generation_requests {
            let index = self.next_index(id);
            let token = (self.script)(id, index);
            self.push_rows(&mut peaks, requests.get(id)?, token);
        }
        Ok(one_hot_scores(&peaks, self.vocab_size))
    }
}
