use candle_core::Tensor;
use tracing::trace;

use super::simple::{batched_argmax, host_tokens, issue_token_copy};
use super::state::{DecodeState, DeviceTensors};
use super::Decoder;
use crate::batch::ScheduledRequests;
use crate::config::DecoderConfig;
use crate::error::{DecoderError, Result};
use crate::request::{LlmRequest, RequestPool};
use crate::sampling::greedy_search_sampling_batch;
use crate::stop_criteria::StopCriteria;
use crate::stream::CopyStream;

/// Argmax decoder for star attention, where each request's next token sits
/// at its own `output_token_idx` row rather than in category order.
pub struct StarAttentionDecoder {
    stop: StopCriteria,
    stream: CopyStream,
}

impl StarAttentionDecoder {
    pub fn new(config: &DecoderConfig) -> Result<Self> {
        Ok(Self {
            stop: StopCriteria::new(config.max_seq_len),
            stream: CopyStream::new("tokstep-copy")?,
        })
    }

    /// Commit the token selected for the request at `position` of the
    /// step's row order.
    fn update_one(
        &self,
        request: &mut LlmRequest,
        position: usize,
        new_tokens: &[u32],
        logits: &Tensor,
    ) -> Result<()> {
        let token = *new_tokens.get(position).ok_or_else(|| {
            DecoderError::Invariant(format!(
                "no token for request {} at position {position}",
                request.id
            ))
        })?;
        let num_tokens = request.add_new_token(token, 0);

        let row_logits = logits.narrow(0, position, 1)?;
        if request.return_log_probs {
            let values = greedy_search_sampling_batch(&row_logits)?.log_prob_values()?;
            request.result.append_log_probs(vec![values]);
        }
        request.result.append_generation_logits(row_logits);

        self.stop.handle(request, token, num_tokens, 0);
        if !request.is_finished() {
            request.decoding_iter += 1;
        }
        trace!(request_id = request.id, position, token, "committed token");
        Ok(())
    }
}

impl Decoder for StarAttentionDecoder {
    fn decode_async(
        &mut self,
        scheduled: &ScheduledRequests,
        requests: &RequestPool,
        scores: &Tensor,
    ) -> Result<DecodeState> {
        if !scheduled.extend_requests.is_empty() {
            return Err(DecoderError::Unsupported(
                "draft tokens are not supported with star attention".into(),
            ));
        }
        let rows = scores.dim(0)?;
        let mut output_rows = Vec::with_capacity(scheduled.batch_size());
        for id in scheduled.in_row_order() {
            let idx = requests.get(id)?.output_token_idx;
            if idx >= rows {
                return Err(DecoderError::InvalidShape {
                    expected: format!("more than {idx} score rows for request {id}"),
                    found: format!("{rows} rows"),
                });
            }
            output_rows.push(idx as u32);
        }
        // Gathered now: the scheduler may reassign output rows before commit.
        let index = Tensor::new(output_rows.as_slice(), scores.device())?;
        let logits = scores.index_select(&index, 0)?;
        let new_tokens = batched_argmax(&logits)?;
        let host = issue_token_copy(&self.stream, new_tokens.clone());
        DecodeState::new(
            scheduled.clone(),
            requests,
            logits,
            DeviceTensors {
                new_tokens: Some(new_tokens),
            },
            host,
        )
    }

    fn update_requests(&mut self, state: DecodeState, requests: &mut RequestPool) -> Result<()> {
        let new_tokens = host_tokens(state.host.wait()?)?;
        let num_context = state.scheduled.context_requests.len();
        for (position, &id) in state.scheduled.context_requests.iter().enumerate() {
            let request = requests.get_mut(id)?;
            if state.prefill_done.get(position).copied().unwrap_or(false) && !request.is_finished() {
                self.update_one(request, position, &new_tokens, &state.logits)?;
            }
        }
        for (i, &id) in state.scheduled.generation_requests.iter().enumerate() {
            let request = requests.get_mut(id)?;
            if !request.is_finished() {
                self.update_one(request, num_context + i, &new_tokens, &state.logits)?;
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "star_attention"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    use crate::request::{FinishReason, RequestState, SamplingConfig};

    fn scores(peaks: &[u32]) -> Tensor {
        let vocab = 8;
        let mut data = vec![0.0f32; peaks.len() * vocab];
        for (row, &p) in peaks.iter().enumerate() {
            data[row * vocab + p as usize] = 5.0;
        }
        Tensor::from_vec(data, (peaks.len(), vocab), &Device::Cpu).unwrap()
    }

    fn request(id: u64, state: RequestState, output_token_idx: usize) -> LlmRequest {
        let mut req = LlmRequest::new(id, vec![1, 2], 2, SamplingConfig::greedy());
        req.state = state;
        req.output_token_idx = output_token_idx;
        req
    }

    #[test]
    fn reads_tokens_at_output_rows() {
        let mut pool = RequestPool::new();
        pool.insert(request(1, RequestState::GenerationInProgress, 2));
        pool.insert(request(2, RequestState::GenerationInProgress, 0));
        let scheduled = ScheduledRequests {
            generation_requests: vec![1, 2],
            ..Default::default()
        };
        let mut decoder = StarAttentionDecoder::new(&DecoderConfig::default()).unwrap();
        let state = decoder.decode_async(&scheduled, &pool, &scores(&[3, 4, 6])).unwrap();
        decoder.update_requests(state, &mut pool).unwrap();

        let first = pool.get(1).unwrap();
        assert_eq!(first.generated_tokens(0), &[6]);
        assert_eq!(first.result.generation_logits.len(), 1);
        assert_eq!(first.decoding_iter, 1);
        assert_eq!(pool.get(2).unwrap().generated_tokens(0), &[3]);
    }

    #[test]
    fn context_requests_commit_only_in_generation() {
        let mut pool = RequestPool::new();
        pool.insert(request(1, RequestState::ContextInit, 0));
        pool.insert(request(2, RequestState::GenerationInProgress, 1));
        let scheduled = ScheduledRequests {
            context_requests: vec![1, 2],
            ..Default::default()
        };
        let mut decoder = StarAttentionDecoder::new(&DecoderConfig::default()).unwrap();
        let state = decoder.decode_async(&scheduled, &pool, &scores(&[1, 2])).unwrap();
        decoder.update_requests(state, &mut pool).unwrap();
        assert!(pool.get(1).unwrap().generated_tokens(0).is_empty());
        assert_eq!(pool.get(2).unwrap().generated_tokens(0), &[2]);
    }

    #[test]
    fn finishing_commit_does_not_bump_iteration() {
        let mut pool = RequestPool::new();
        let mut req = request(1, RequestState::GenerationInProgress, 0);
        req.max_new_tokens = 1;
        req.return_log_probs = true;
        pool.insert(req);
        let scheduled = ScheduledRequests {
            generation_requests: vec![1],
            ..Default::default()
        };
        let mut decoder = StarAttentionDecoder::new(&DecoderConfig::default()).unwrap();
        let state = decoder.decode_async(&scheduled, &pool, &scores(&[5])).unwrap();
        decoder.update_requests(state, &mut pool).unwrap();
        let req = pool.get(1).unwrap();
        assert_eq!(req.finished_reason(0), FinishReason::Length);
        assert_eq!(req.decoding_iter, 0);
        assert_eq!(req.result.log_probs.len(), 1);
    }

    #[test]
    fn rows_are_fixed_at_decode_time() {
        let mut pool = RequestPool::new();
        pool.insert(request(1, RequestState::GenerationInProgress, 1));
        let scheduled = ScheduledRequests {
            generation_requests: vec![1],
            ..Default::default()
        };
        let mut decoder = StarAttentionDecoder::new(&DecoderConfig::default()).unwrap();
        let state = decoder.decode_async(&scheduled, &pool, &scores(&[2, 7])).unwrap();
        pool.get_mut(1).unwrap().output_token_idx = 0;
        decoder.update_requests(state, &mut pool).unwrap();
        assert_eq!(pool.get(1).unwrap().generated_tokens(0), &[7]);
    }

    #[test]
    fn output_row_out_of_range_is_rejected() {
        let mut pool = RequestPool::new();
        pool.insert(request(1, RequestState::GenerationInProgress, 4));
        let scheduled = ScheduledRequests {
            generation_requests: vec![1],
            ..Default::default()
        };
        let mut decoder = StarAttentionDecoder::new(&DecoderConfig::default()).unwrap();
        assert!(decoder.decode_async(&scheduled, &pool, &scores(&[1])).is_err());
    }
}
