use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokstep_core::batch::{RowLayout, ScheduledRequests};
use tokstep_core::decoder::DeviceTensors;
use tokstep_core::executor::ModelExecutor;
use tokstep_core::request::RequestPool;
use tokstep_core::Result;

/// Stand-in for a forward pass: uniform random scores in `[-4, 4)`.
pub struct SyntheticModel {
    vocab_size: usize,
    rng: StdRng,
    rows_per_beam: bool,
    device: Device,
}

impl SyntheticModel {
    pub fn new(vocab_size: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            vocab_size,
            rng,
            rows_per_beam: false,
            device: Device::Cpu,
        }
    }

    /// One row per beam, as the native decoder consumes them.
    pub fn with_rows_per_beam(mut self, rows_per_beam: bool) -> Self {
        self.rows_per_beam = rows_per_beam;
        self
    }

    fn num_rows(&self, scheduled: &ScheduledRequests, requests: &RequestPool) -> Result<usize> {
        if !self.rows_per_beam {
            return Ok(RowLayout::compute(scheduled, requests)?.total_rows());
        }
        let mut rows = 0;
        for id in scheduled.in_row_order() {
            let request = requests.get(id)?;
            rows += (1 + request.num_draft_tokens()) * request.beam_width();
        }
        Ok(rows)
    }
}

impl ModelExecutor for SyntheticModel {
    fn forward(
        &mut self,
        scheduled: &ScheduledRequests,
        requests: &RequestPool,
        previous: Option<&DeviceTensors>,
    ) -> Result<Tensor> {
        let rows = self.num_rows(scheduled, requests)?;
        tracing::trace!(rows, overlapped = previous.is_some(), "synthetic forward");
        let data: Vec<f32> = (0..rows * self.vocab_size)
            .map(|_| self.rng.gen_range(-4.0..4.0))
            .collect();
        Ok(Tensor::from_vec(data, (rows, self.vocab_size), &self.device)?)
    }
}
