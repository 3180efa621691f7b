use candle_core::{DType, Tensor, D};
use tracing::{debug, warn};

use super::commit::{commit_step, StepView};
use super::state::{DecodeState, DeviceTensors, HostTensors};
use super::Decoder;
use crate::batch::{RowLayout, ScheduledRequests};
use crate::config::DecoderConfig;
use crate::error::{DecoderError, Result};
use crate::request::RequestPool;
use crate::sampling::{
    decode_single_request, greedy_search_sampling_batch, SamplerState, SamplingPolicy,
};
use crate::stop_criteria::StopCriteria;
use crate::stream::CopyStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimpleMode {
    /// Argmax over the whole score tensor at once.
    Batched,
    /// Each request's own sampling policy, one row at a time.
    Mixed,
}

/// Host-side sampling decoder, including draft verification for extend
/// requests in batched mode.
pub struct SimpleDecoder {
    mode: SimpleMode,
    stop: StopCriteria,
    sampler: SamplerState,
    stream: CopyStream,
}

impl SimpleDecoder {
    pub fn new(mode: SimpleMode, config: &DecoderConfig) -> Result<Self> {
        Ok(Self {
            mode,
            stop: StopCriteria::new(config.max_seq_len),
            sampler: SamplerState::new(config.seed),
            stream: CopyStream::new("tokstep-copy")?,
        })
    }

    pub fn mode(&self) -> SimpleMode {
        self.mode
    }

    fn mixed_decode(
        &mut self,
        scheduled: &ScheduledRequests,
        requests: &RequestPool,
        scores: &Tensor,
    ) -> Result<DecodeState> {
        if !scheduled.extend_requests.is_empty() {
            return Err(DecoderError::Unsupported(
                "draft tokens are not supported in mixed mode".into(),
            ));
        }
        let mut tokens = Vec::with_capacity(scheduled.batch_size());
        let mut log_probs = Vec::with_capacity(scheduled.batch_size());
        let mut row = 0;
        for &id in &scheduled.context_requests {
            let request = requests.get(id)?;
            if request.return_context_logits {
                return Err(DecoderError::Unsupported(
                    "context logits are not returned in mixed mode".into(),
                ));
            }
            let selection =
                decode_single_request(&request.sampling_config, &scores.narrow(0, row, 1)?, &mut self.sampler)?;
            log_probs.push(if request.return_log_probs {
                selection.log_prob_values()?.first().copied()
            } else {
                None
            });
            tokens.push(selection.tokens);
            row += 1;
        }
        for &id in &scheduled.generation_requests {
            let request = requests.get(id)?;
            let row_scores = scores.narrow(0, row, 1)?;
            // Finished rows still get a token so the buffer stays row-aligned;
            // the commit skips them.
            let selection = if request.is_finished() {
                greedy_search_sampling_batch(&row_scores)?
            } else {
                decode_single_request(&request.sampling_config, &row_scores, &mut self.sampler)?
            };
            log_probs.push(if request.return_log_probs && !request.is_finished() {
                selection.log_prob_values()?.first().copied()
            } else {
                None
            });
            tokens.push(selection.tokens);
            row += 1;
        }
        let new_tokens = if tokens.is_empty() {
            Tensor::zeros(0, DType::U32, scores.device())?
        } else {
            Tensor::cat(&tokens, 0)?
        };
        Ok(self
            .issue_copy(scheduled, requests, scores, new_tokens)?
            .with_log_probs(log_probs))
    }

    fn issue_copy(
        &self,
        scheduled: &ScheduledRequests,
        requests: &RequestPool,
        scores: &Tensor,
        new_tokens: Tensor,
    ) -> Result<DecodeState> {
        let host = issue_token_copy(&self.stream, new_tokens.clone());
        DecodeState::new(
            scheduled.clone(),
            requests,
            scores.clone(),
            DeviceTensors {
                new_tokens: Some(new_tokens),
            },
            host,
        )
    }
}

/// Unfinished requests whose sampling policy batched argmax does not apply.
fn non_greedy_requests(scheduled: &ScheduledRequests, requests: &RequestPool) -> Result<usize> {
    let mut count = 0;
    for id in scheduled.in_row_order() {
        let request = requests.get(id)?;
        let policy = SamplingPolicy::from_config(&request.sampling_config);
        if !request.is_finished() && !matches!(policy, SamplingPolicy::Greedy) {
            count += 1;
        }
    }
    Ok(count)
}

/// Argmax per score row.
pub(crate) fn batched_argmax(scores: &Tensor) -> Result<Tensor> {
    if scores.rank() != 2 {
        return Err(DecoderError::InvalidShape {
            expected: "[rows, vocab]".to_string(),
            found: format!("{:?}", scores.dims()),
        });
    }
    if scores.dim(0)? == 0 {
        return Ok(Tensor::zeros(0, DType::U32, scores.device())?);
    }
    Ok(scores.argmax(D::Minus1)?.to_dtype(DType::U32)?)
}

pub(crate) fn issue_token_copy(
    stream: &CopyStream,
    new_tokens: Tensor,
) -> crate::stream::StepEvent<HostTensors> {
    stream.enqueue(move || {
        Ok(HostTensors::Tokens {
            new_tokens: new_tokens.to_vec1()?,
        })
    })
}

pub(crate) fn host_tokens(host: HostTensors) -> Result<Vec<u32>> {
    match host {
        HostTensors::Tokens { new_tokens } => Ok(new_tokens),
        HostTensors::Empty => Ok(Vec::new()),
        HostTensors::Native(_) => Err(DecoderError::Invariant(
            "native buffers handed to a host-side decoder".into(),
        )),
    }
}

impl Decoder for SimpleDecoder {
    fn decode_async(
        &mut self,
        scheduled: &ScheduledRequests,
        requests: &RequestPool,
        scores: &Tensor,
    ) -> Result<DecodeState> {
        let _span = tracing::debug_span!("decode_async", decoder = self.name()).entered();
        let layout = RowLayout::compute(scheduled, requests)?;
        layout.check_rows(scores.dim(0)?)?;
        debug!(
            context = layout.context_rows,
            extend = layout.extend_rows,
            generation = layout.generation_rows,
            "decoding step"
        );
        match self.mode {
            SimpleMode::Batched => {
                let ignored = non_greedy_requests(scheduled, requests)?;
                if ignored > 0 {
                    warn!(ignored, "batched mode decodes top-k/top-p requests greedily");
                }
                let new_tokens = batched_argmax(scores)?;
                self.issue_copy(scheduled, requests, scores, new_tokens)
            }
            SimpleMode::Mixed => self.mixed_decode(scheduled, requests, scores),
        }
    }

    fn update_requests(&mut self, state: DecodeState, requests: &mut RequestPool) -> Result<()> {
        let _span = tracing::debug_span!("update_requests", decoder = self.name()).entered();
        let new_tokens = host_tokens(state.host.wait()?)?;
        let view = StepView {
            stop: &self.stop,
            new_tokens: &new_tokens,
            logits: &state.logits,
            log_probs: &state.log_probs,
            prefill_done: &state.prefill_done,
        };
        commit_step(&view, &state.scheduled, requests)
    }

    fn name(&self) -> &str {
        match self.mode {
            SimpleMode::Batched => "batched",
            SimpleMode::Mixed => "mixed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    use crate::request::{LlmRequest, RequestId, RequestState, SamplingConfig};

    fn config() -> DecoderConfig {
        DecoderConfig {
            max_seq_len: 64,
            seed: Some(0),
            ..Default::default()
        }
    }

    fn generating(id: RequestId, sampling: SamplingConfig) -> LlmRequest {
        let mut req = LlmRequest::new(id, vec![1, 2], 8, sampling);
        req.state = RequestState::GenerationInProgress;
        req.context_position = 2;
        req
    }

    /// One-hot scores: row i peaks at `peaks[i]`.
    fn one_hot(peaks: &[u32], vocab: usize) -> Tensor {
        let mut data = vec![0.0f32; peaks.len() * vocab];
        for (row, &p) in peaks.iter().enumerate() {
            data[row * vocab + p as usize] = 10.0;
        }
        Tensor::from_vec(data, (peaks.len(), vocab), &Device::Cpu).unwrap()
    }

    #[test]
    fn batched_mode_commits_argmax_per_row() {
        let mut pool = RequestPool::new();
        pool.insert(generating(1, SamplingConfig::greedy()));
        pool.insert(generating(2, SamplingConfig::greedy()));
        let scheduled = ScheduledRequests {
            generation_requests: vec![1, 2],
            ..Default::default()
        };
        let mut decoder = SimpleDecoder::new(SimpleMode::Batched, &config()).unwrap();
        let state = decoder.decode_async(&scheduled, &pool, &one_hot(&[3, 5], 8)).unwrap();
        decoder.update_requests(state, &mut pool).unwrap();
        assert_eq!(pool.get(1).unwrap().generated_tokens(0), &[3]);
        assert_eq!(pool.get(2).unwrap().generated_tokens(0), &[5]);
    }

    #[test]
    fn batched_mode_takes_argmax_for_top_k_requests() {
        let mut pool = RequestPool::new();
        pool.insert(generating(1, SamplingConfig::greedy()));
        pool.insert(generating(2, SamplingConfig::top_k(3)));
        let mut done = generating(3, SamplingConfig::top_p(0.5));
        done.state = RequestState::GenerationComplete;
        pool.insert(done);
        let scheduled = ScheduledRequests {
            generation_requests: vec![1, 2, 3],
            ..Default::default()
        };
        assert_eq!(non_greedy_requests(&scheduled, &pool).unwrap(), 1);

        let mut decoder = SimpleDecoder::new(SimpleMode::Batched, &config()).unwrap();
        let state = decoder.decode_async(&scheduled, &pool, &one_hot(&[3, 5, 1], 8)).unwrap();
        decoder.update_requests(state, &mut pool).unwrap();
        assert_eq!(pool.get(2).unwrap().generated_tokens(0), &[5]);
    }

    #[test]
    fn row_mismatch_fails_before_any_work() {
        let mut pool = RequestPool::new();
        pool.insert(generating(1, SamplingConfig::greedy()));
        let scheduled = ScheduledRequests {
            generation_requests: vec![1],
            ..Default::default()
        };
        let mut decoder = SimpleDecoder::new(SimpleMode::Batched, &config()).unwrap();
        assert!(matches!(
            decoder.decode_async(&scheduled, &pool, &one_hot(&[1, 2], 4)),
            Err(DecoderError::InvalidShape { .. })
        ));
    }

    #[test]
    fn mixed_mode_honors_per_request_policy() {
        let mut pool = RequestPool::new();
        pool.insert(generating(1, SamplingConfig::greedy()));
        pool.insert(generating(2, SamplingConfig::top_k(1)));
        pool.insert(generating(3, SamplingConfig::top_p(0.5)));
        let scheduled = ScheduledRequests {
            generation_requests: vec![1, 2, 3],
            ..Default::default()
        };
        let mut decoder = SimpleDecoder::new(SimpleMode::Mixed, &config()).unwrap();
        let state = decoder
            .decode_async(&scheduled, &pool, &one_hot(&[0, 6, 2], 8))
            .unwrap();
        decoder.update_requests(state, &mut pool).unwrap();
        assert_eq!(pool.get(1).unwrap().generated_tokens(0), &[0]);
        assert_eq!(pool.get(2).unwrap().generated_tokens(0), &[6]);
        assert_eq!(pool.get(3).unwrap().generated_tokens(0), &[2]);
    }

    #[test]
    fn mixed_mode_precomputes_log_probs() {
        let mut pool = RequestPool::new();
        let mut req = generating(1, SamplingConfig::top_k(1));
        req.return_log_probs = true;
        pool.insert(req);
        let scheduled = ScheduledRequests {
            generation_requests: vec![1],
            ..Default::default()
        };
        let mut decoder = SimpleDecoder::new(SimpleMode::Mixed, &config()).unwrap();
        let state = decoder.decode_async(&scheduled, &pool, &one_hot(&[4], 8)).unwrap();
        assert_eq!(state.log_probs.len(), 1);
        assert!(state.log_probs[0].is_some());
        decoder.update_requests(state, &mut pool).unwrap();
        let lp = &pool.get(1).unwrap().result.log_probs;
        assert_eq!(lp.len(), 1);
        assert!(lp[0][0][0] < 0.0);
    }

    #[test]
    fn mixed_mode_keeps_rows_aligned_past_finished_requests() {
        let mut pool = RequestPool::new();
        let mut done = generating(1, SamplingConfig::greedy());
        done.state = RequestState::GenerationComplete;
        pool.insert(done);
        pool.insert(generating(2, SamplingConfig::greedy()));
        let scheduled = ScheduledRequests {
            generation_requests: vec![1, 2],
            ..Default::default()
        };
        let mut decoder = SimpleDecoder::new(SimpleMode::Mixed, &config()).unwrap();
        let state = decoder.decode_async(&scheduled, &pool, &one_hot(&[1, 7], 8)).unwrap();
        decoder.update_requests(state, &mut pool).unwrap();
        assert!(pool.get(1).unwrap().generated_tokens(0).is_empty());
        assert_eq!(pool.get(2).unwrap().generated_tokens(0), &[7]);
    }

    #[test]
    fn mixed_mode_rejects_drafts_and_context_logits() {
        let mut pool = RequestPool::new();
        pool.insert(generating(1, SamplingConfig::greedy()).with_draft_tokens(vec![1]));
        let scheduled = ScheduledRequests::partition(vec![], vec![1], &pool).unwrap();
        let mut decoder = SimpleDecoder::new(SimpleMode::Mixed, &config()).unwrap();
        assert!(matches!(
            decoder.decode_async(&scheduled, &pool, &one_hot(&[0, 0], 4)),
            Err(DecoderError::Unsupported(_))
        ));

        let mut pool = RequestPool::new();
        let mut req = LlmRequest::new(2, vec![1], 4, SamplingConfig::greedy());
        req.return_context_logits = true;
        pool.insert(req);
        let scheduled = ScheduledRequests {
            context_requests: vec![2],
            ..Default::default()
        };
        assert!(matches!(
            decoder.decode_async(&scheduled, &pool, &one_hot(&[0], 4)),
            Err(DecoderError::Unsupported(_))
        ));
    }

    #[test]
    fn batched_mode_verifies_drafts() {
        let mut pool = RequestPool::new();
        pool.insert(generating(1, SamplingConfig::greedy()).with_draft_tokens(vec![4, 5, 6]));
        let scheduled = ScheduledRequests::partition(vec![], vec![1], &pool).unwrap();
        let mut decoder = SimpleDecoder::new(SimpleMode::Batched, &config()).unwrap();
        let state = decoder
            .decode_async(&scheduled, &pool, &one_hot(&[4, 5, 1, 2], 8))
            .unwrap();
        decoder.update_requests(state, &mut pool).unwrap();
        let req = pool.get(1).unwrap();
        assert_eq!(req.generated_tokens(0), &[4, 5, 1]);
        assert_eq!(req.num_accepted_draft_tokens, 2);
    }

    #[test]
    fn empty_batch_is_tolerated() {
        let mut pool = RequestPool::new();
        let scheduled = ScheduledRequests::default();
        let scores = Tensor::zeros((0, 8), DType::F32, &Device::Cpu).unwrap();
        for mode in [SimpleMode::Batched, SimpleMode::Mixed] {
            let mut decoder = SimpleDecoder::new(mode, &config()).unwrap();
            let state = decoder.decode_async(&scheduled, &pool, &scores).unwrap();
            decoder.update_requests(state, &mut pool).unwrap();
        }
    }
}
