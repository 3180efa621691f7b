use std::collections::HashSet;

use candle_core::Tensor;
use tracing::{debug, trace, warn};

use super::state::{DecodeState, DeviceTensors, HostTensors};
use super::Decoder;
use crate::batch::{RowLayout, ScheduledRequests};
use crate::config::DecoderConfig;
use crate::error::{DecoderError, Result};
use crate::native::{NativeDecodingEngine, NativeHostBuffers, NativeSequence, NativeStepInput};
use crate::request::{FinishReason, RequestId, RequestPool, RequestState};
use crate::stream::{CopyStream, StepEvent};

/// Decoder that delegates token selection to a [`NativeDecodingEngine`].
///
/// Host read-backs land in a ring of `scratch_depth` buffer sets. A set is
/// moved into the copy job of the step that uses it and only returns to the
/// ring when that step is committed, so an uncommitted step's buffers are
/// never overwritten. A step issued with every set in flight fails with
/// [`DecoderError::ScratchExhausted`].
pub struct NativeDecoder<E> {
    engine: E,
    stream: CopyStream,
    free: Vec<NativeHostBuffers>,
    scratch_depth: usize,
    registered: HashSet<RequestId>,
}

impl<E: NativeDecodingEngine> NativeDecoder<E> {
    pub fn new(engine: E, config: &DecoderConfig) -> Result<Self> {
        config.validate()?;
        let (steps, slots, beams) = (
            engine.max_tokens_per_step(),
            engine.max_num_slots(),
            engine.max_beam_width(),
        );
        let free = (0..config.scratch_depth)
            .map(|_| NativeHostBuffers::with_capacity(steps, slots, beams))
            .collect();
        Ok(Self {
            engine,
            stream: CopyStream::new("tokstep-native-copy")?,
            free,
            scratch_depth: config.scratch_depth,
            registered: HashSet::new(),
        })
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Buffer sets not tied to an uncommitted step.
    pub fn free_scratch(&self) -> usize {
        self.free.len()
    }

    fn fresh_buffers(&self) -> NativeHostBuffers {
        NativeHostBuffers::with_capacity(
            self.engine.max_tokens_per_step(),
            self.engine.max_num_slots(),
            self.engine.max_beam_width(),
        )
    }

    fn commit(
        &mut self,
        scheduled: &ScheduledRequests,
        prefill_done: &[bool],
        host: &NativeHostBuffers,
        requests: &mut RequestPool,
    ) -> Result<()> {
        for (position, id) in scheduled.in_row_order().enumerate() {
            let request = requests.get_mut(id)?;
            // The engine skipped requests still prefilling at decode time, so
            // their slot holds another request's data in this snapshot.
            let prefilled = prefill_done.get(position).copied().unwrap_or(false);
            if !prefilled || request.is_finished() {
                continue;
            }
            let slot = request.seq_slot;
            let beam_width = request.beam_width();
            if beam_width > host.beam_width() {
                return Err(DecoderError::Native(format!(
                    "request {id} has {beam_width} beams but the engine state holds {}",
                    host.beam_width()
                )));
            }
            let num_generated = (request.num_draft_tokens() + 1).min(host.steps());
            let current = request.max_beam_num_tokens();

            for beam in 0..beam_width {
                let seq_len = host.sequence_length(slot, beam)?;
                // Positions past the engine's sequence length were dropped on its side
                let num_new = num_generated.min(seq_len.saturating_sub(request.num_tokens(beam)));
                for step in 0..num_new {
                    request.add_new_token(host.new_token(step, slot, beam)?, beam);
                }
                let reason = FinishReason::from_native(host.finish_reason(slot, beam)?)?;
                request.set_finished_reason(reason, beam);
            }

            let delta = request.max_beam_num_tokens() - current;
            request.update_num_tokens_per_iteration(delta);
            if !request.is_finished() {
                request.decoding_iter += 1;
            }
            if host.finished_sum(slot)? == beam_width {
                request.state = RequestState::GenerationComplete;
                self.registered.remove(&id);
            }
            trace!(request_id = id, slot, delta, "committed native step");
        }
        Ok(())
    }
}

impl<E: NativeDecodingEngine> Decoder for NativeDecoder<E> {
    /// Register context requests whose prefill completed this step.
    fn setup_decoder_step(
        &mut self,
        scheduled: &ScheduledRequests,
        requests: &mut RequestPool,
    ) -> Result<()> {
        for &id in &scheduled.context_requests {
            let request = requests.get(id)?;
            if request.is_context_init_state() || self.registered.contains(&id) {
                continue;
            }
            self.engine
                .add_sequence(request.seq_slot, NativeSequence::from_request(request))?;
            self.registered.insert(id);
            debug!(request_id = id, slot = request.seq_slot, "registered native sequence");
        }
        Ok(())
    }

    fn decode_async(
        &mut self,
        scheduled: &ScheduledRequests,
        requests: &RequestPool,
        scores: &Tensor,
    ) -> Result<DecodeState> {
        let _span = tracing::debug_span!("decode_async", decoder = "native").entered();
        if !scheduled.extend_requests.is_empty() {
            return Err(DecoderError::Unsupported(
                "draft tokens are not supported by the native decoder".into(),
            ));
        }
        let batch = scheduled.batch_size();
        if batch == 0 {
            return DecodeState::new(
                scheduled.clone(),
                requests,
                scores.clone(),
                DeviceTensors::default(),
                StepEvent::ready(HostTensors::Empty),
            );
        }

        let mut beam_width = None;
        for id in scheduled.in_row_order() {
            let width = requests.get(id)?.beam_width();
            match beam_width {
                None => beam_width = Some(width),
                Some(w) if w != width => {
                    return Err(DecoderError::Unsupported(format!(
                        "mixed beam widths {w} and {width} in one native step"
                    )))
                }
                Some(_) => {}
            }
        }
        let beam_width = beam_width.unwrap_or(1);
        if beam_width > self.engine.max_beam_width() {
            return Err(DecoderError::Unsupported(format!(
                "beam width {beam_width} exceeds the engine's {}",
                self.engine.max_beam_width()
            )));
        }
        let layout = RowLayout::compute(scheduled, requests)?;
        let rows = scores.dim(0)?;
        if rows != layout.total_rows() * beam_width {
            return Err(DecoderError::InvalidShape {
                expected: format!(
                    "{} rows ({batch} requests x {beam_width} beams)",
                    layout.total_rows() * beam_width
                ),
                found: format!("{rows} rows"),
            });
        }
        if self.free.is_empty() {
            warn!(depth = self.scratch_depth, "no free native scratch buffer");
            return Err(DecoderError::ScratchExhausted {
                depth: self.scratch_depth,
            });
        }

        let logits = scores.reshape((batch, beam_width, ()))?;

        // Only sequences the engine is still decoding take part in the step
        let mut entries = Vec::with_capacity(batch);
        let mut batch_slots = Vec::with_capacity(batch);
        let mut num_context_logits = 0;
        for (entry, id) in scheduled.in_row_order().enumerate() {
            let request = requests.get(id)?;
            if request.is_context_init_state() || request.is_finished() {
                continue;
            }
            if entry < scheduled.context_requests.len() {
                num_context_logits += 1;
            }
            entries.push(entry as u32);
            batch_slots.push(request.seq_slot);
        }
        debug!(batch, active = entries.len(), num_context_logits, beam_width, "native step");
        if !entries.is_empty() {
            let index = Tensor::new(entries.as_slice(), logits.device())?;
            self.engine.forward_async(NativeStepInput {
                logits: logits.index_select(&index, 0)?.contiguous()?,
                batch_slots,
                num_context_logits,
            })?;
        }

        let engine_state = self.engine.state()?;
        let slots: Vec<u32> = scheduled
            .in_row_order()
            .map(|id| requests.get(id).map(|r| r.seq_slot as u32))
            .collect::<Result<_>>()?;
        let slot_index = Tensor::new(slots.as_slice(), scores.device())?;
        let new_tokens_device = engine_state
            .all_new_tokens
            .get(0)?
            .index_select(&slot_index, 0)?
            .narrow(1, 0, beam_width)?
            .flatten_all()?;

        let mut buffers = match self.free.pop() {
            Some(buffers) => buffers,
            None => {
                return Err(DecoderError::ScratchExhausted {
                    depth: self.scratch_depth,
                })
            }
        };
        let host = self.stream.enqueue(move || {
            buffers.copy_from(&engine_state)?;
            Ok(HostTensors::Native(buffers))
        });
        DecodeState::new(
            scheduled.clone(),
            requests,
            logits,
            DeviceTensors {
                new_tokens: Some(new_tokens_device),
            },
            host,
        )
    }

    fn update_requests(&mut self, state: DecodeState, requests: &mut RequestPool) -> Result<()> {
        let _span = tracing::debug_span!("update_requests", decoder = "native").entered();
        let buffers = match state.host.wait() {
            Ok(HostTensors::Native(buffers)) => buffers,
            Ok(HostTensors::Empty) => return Ok(()),
            Ok(HostTensors::Tokens { .. }) => {
                return Err(DecoderError::Invariant(
                    "token buffers handed to the native decoder".into(),
                ))
            }
            Err(e) => {
                // The in-flight set went down with the copy; keep the ring full
                let replacement = self.fresh_buffers();
                self.free.push(replacement);
                return Err(e);
            }
        };
        let result = self.commit(&state.scheduled, &state.prefill_done, &buffers, requests);
        self.free.push(buffers);
        result
    }

    fn name(&self) -> &str {
        "native"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    use crate::native::ReferenceNativeEngine;
    use crate::request::{LlmRequest, SamplingConfig};

    fn config(scratch_depth: usize) -> DecoderConfig {
        DecoderConfig {
            kind: crate::config::DecoderKind::Native,
            max_seq_len: 64,
            scratch_depth,
            ..Default::default()
        }
    }

    fn decoder(scratch_depth: usize, beams: usize) -> NativeDecoder<ReferenceNativeEngine> {
        NativeDecoder::new(ReferenceNativeEngine::new(4, beams, 64), &config(scratch_depth)).unwrap()
    }

    /// A request whose prompt was fully prefilled this step.
    fn prefilled(id: RequestId, slot: usize, max_new_tokens: usize, beams: usize) -> LlmRequest {
        let sampling = SamplingConfig::greedy().with_beam_width(beams);
        let mut req = LlmRequest::new(id, vec![1, 2], max_new_tokens, sampling)
            .with_seq_slot(slot)
            .with_end_id(0);
        req.state = RequestState::GenerationInProgress;
        req.context_position = 2;
        req
    }

    fn one_hot(peaks: &[u32]) -> Tensor {
        let vocab = 8;
        let mut data = vec![0.0f32; peaks.len() * vocab];
        for (row, &p) in peaks.iter().enumerate() {
            data[row * vocab + p as usize] = 3.0;
        }
        Tensor::from_vec(data, (peaks.len(), vocab), &Device::Cpu).unwrap()
    }

    fn context(ids: &[RequestId]) -> ScheduledRequests {
        ScheduledRequests {
            context_requests: ids.to_vec(),
            ..Default::default()
        }
    }

    fn generation(ids: &[RequestId]) -> ScheduledRequests {
        ScheduledRequests {
            generation_requests: ids.to_vec(),
            ..Default::default()
        }
    }

    fn step(
        decoder: &mut NativeDecoder<ReferenceNativeEngine>,
        scheduled: &ScheduledRequests,
        pool: &mut RequestPool,
        peaks: &[u32],
    ) {
        decoder.setup_decoder_step(scheduled, pool).unwrap();
        let state = decoder.decode_async(scheduled, pool, &one_hot(peaks)).unwrap();
        decoder.update_requests(state, pool).unwrap();
    }

    #[test]
    fn generates_until_length() {
        let mut pool = RequestPool::new();
        pool.insert(prefilled(1, 2, 3, 1));
        let mut decoder = decoder(2, 1);

        step(&mut decoder, &context(&[1]), &mut pool, &[4]);
        step(&mut decoder, &generation(&[1]), &mut pool, &[5]);
        assert_eq!(pool.get(1).unwrap().generated_tokens(0), &[4, 5]);
        assert_eq!(pool.get(1).unwrap().decoding_iter, 2);

        step(&mut decoder, &generation(&[1]), &mut pool, &[6]);
        let req = pool.get(1).unwrap();
        assert_eq!(req.generated_tokens(0), &[4, 5, 6]);
        assert_eq!(req.state, RequestState::GenerationComplete);
        assert_eq!(req.finished_reason(0), FinishReason::Length);
        assert_eq!(req.num_tokens_per_iteration, 1);
        assert_eq!(decoder.free_scratch(), 2);
    }

    #[test]
    fn overlapped_steps_commit_from_their_own_buffers() {
        let mut pool = RequestPool::new();
        pool.insert(prefilled(1, 0, 8, 1));
        let mut decoder = decoder(2, 1);

        decoder.setup_decoder_step(&context(&[1]), &mut pool).unwrap();
        let first = decoder.decode_async(&context(&[1]), &pool, &one_hot(&[4])).unwrap();
        let second = decoder.decode_async(&generation(&[1]), &pool, &one_hot(&[5])).unwrap();
        assert_eq!(decoder.free_scratch(), 0);

        decoder.update_requests(first, &mut pool).unwrap();
        assert_eq!(pool.get(1).unwrap().generated_tokens(0), &[4]);
        decoder.update_requests(second, &mut pool).unwrap();
        assert_eq!(pool.get(1).unwrap().generated_tokens(0), &[4, 5]);
    }

    #[test]
    fn single_buffer_refuses_a_second_uncommitted_step() {
        let mut pool = RequestPool::new();
        pool.insert(prefilled(1, 0, 8, 1));
        let mut decoder = decoder(1, 1);

        decoder.setup_decoder_step(&context(&[1]), &mut pool).unwrap();
        let first = decoder.decode_async(&context(&[1]), &pool, &one_hot(&[4])).unwrap();
        assert!(matches!(
            decoder.decode_async(&generation(&[1]), &pool, &one_hot(&[5])),
            Err(DecoderError::ScratchExhausted { depth: 1 })
        ));
        decoder.update_requests(first, &mut pool).unwrap();
        let second = decoder.decode_async(&generation(&[1]), &pool, &one_hot(&[5])).unwrap();
        decoder.update_requests(second, &mut pool).unwrap();
        assert_eq!(pool.get(1).unwrap().generated_tokens(0), &[4, 5]);
    }

    #[test]
    fn request_completes_only_when_every_beam_finished() {
        let mut pool = RequestPool::new();
        pool.insert(prefilled(1, 1, 8, 2));
        let mut decoder = decoder(2, 2);

        // Beam 0 emits the end id, beam 1 continues
        step(&mut decoder, &context(&[1]), &mut pool, &[0, 3]);
        let req = pool.get(1).unwrap();
        assert_eq!(req.finished_reason(0), FinishReason::EndId);
        assert_eq!(req.finished_reason(1), FinishReason::NotFinished);
        assert_eq!(req.state, RequestState::GenerationInProgress);

        step(&mut decoder, &generation(&[1]), &mut pool, &[5, 0]);
        let req = pool.get(1).unwrap();
        assert_eq!(req.generated_tokens(0), &[0]);
        assert_eq!(req.generated_tokens(1), &[3, 0]);
        assert_eq!(req.state, RequestState::GenerationComplete);
    }

    #[test]
    fn mid_prefill_context_rows_are_skipped() {
        let mut pool = RequestPool::new();
        let mut chunking =
            LlmRequest::new(1, vec![1, 2, 3, 4], 4, SamplingConfig::greedy()).with_seq_slot(0);
        chunking.state = RequestState::ContextInit;
        chunking.context_position = 2;
        pool.insert(chunking);
        pool.insert(prefilled(2, 1, 4, 1));
        let mut decoder = decoder(2, 1);

        step(&mut decoder, &context(&[1, 2]), &mut pool, &[6, 7]);
        assert!(pool.get(1).unwrap().generated_tokens(0).is_empty());
        assert_eq!(pool.get(2).unwrap().generated_tokens(0), &[7]);
    }

    #[test]
    fn completed_requests_get_nothing_further() {
        let mut pool = RequestPool::new();
        pool.insert(prefilled(1, 0, 1, 1));
        let mut decoder = decoder(2, 1);
        step(&mut decoder, &context(&[1]), &mut pool, &[4]);
        let req = pool.get(1).unwrap();
        assert!(req.is_finished());
        let iterations = req.decoding_iter;
        step(&mut decoder, &generation(&[1]), &mut pool, &[5]);
        let req = pool.get(1).unwrap();
        assert_eq!(req.generated_tokens(0), &[4]);
        assert_eq!(req.decoding_iter, iterations);
    }

    #[test]
    fn rejects_drafts_and_mixed_beam_widths() {
        let mut pool = RequestPool::new();
        pool.insert(prefilled(1, 0, 4, 1).with_draft_tokens(vec![1]));
        let mut decoder = decoder(2, 2);
        let scheduled = ScheduledRequests::partition(vec![], vec![1], &pool).unwrap();
        assert!(matches!(
            decoder.decode_async(&scheduled, &pool, &one_hot(&[1, 1])),
            Err(DecoderError::Unsupported(_))
        ));

        let mut pool = RequestPool::new();
        pool.insert(prefilled(1, 0, 4, 1));
        pool.insert(prefilled(2, 1, 4, 2));
        assert!(matches!(
            decoder.decode_async(&generation(&[1, 2]), &pool, &one_hot(&[1, 1, 1])),
            Err(DecoderError::Unsupported(_))
        ));
    }

    #[test]
    fn beams_beyond_the_engine_are_errors() {
        let mut pool = RequestPool::new();
        pool.insert(prefilled(1, 0, 4, 2));
        let mut decoder = decoder(2, 1);
        assert!(matches!(
            decoder.decode_async(&generation(&[1]), &pool, &one_hot(&[1, 1])),
            Err(DecoderError::Unsupported(_))
        ));

        let mut host = NativeHostBuffers::default();
        host.copy_from(&decoder.engine().state().unwrap()).unwrap();
        assert!(matches!(
            decoder.commit(&generation(&[1]), &[true], &host, &mut pool),
            Err(DecoderError::Native(_))
        ));
        let req = pool.get(1).unwrap();
        assert!(req.generated_tokens(0).is_empty());
        assert!(req.generated_tokens(1).is_empty());
    }

    #[test]
    fn device_tokens_keep_only_the_request_beams() {
        let mut pool = RequestPool::new();
        pool.insert(prefilled(1, 2, 4, 1));
        pool.insert(prefilled(2, 0, 4, 1));
        // Engine sized for 2 beams, requests using 1
        let mut decoder = decoder(2, 2);
        decoder.setup_decoder_step(&context(&[1, 2]), &mut pool).unwrap();
        let state = decoder.decode_async(&context(&[1, 2]), &pool, &one_hot(&[3, 5])).unwrap();
        let device: Vec<u32> = state.device.new_tokens.as_ref().unwrap().to_vec1().unwrap();
        assert_eq!(device, vec![3, 5]);
        decoder.update_requests(state, &mut pool).unwrap();
    }

    #[test]
    fn stale_prefill_flag_wins_over_live_state() {
        // Slot 0 first serves request 1 to completion, ending at 5 tokens.
        let mut pool = RequestPool::new();
        pool.insert(prefilled(1, 0, 3, 1));
        let mut decoder = decoder(2, 1);
        step(&mut decoder, &context(&[1]), &mut pool, &[6]);
        step(&mut decoder, &generation(&[1]), &mut pool, &[6]);
        step(&mut decoder, &generation(&[1]), &mut pool, &[6]);
        assert!(pool.get(1).unwrap().is_finished());
        pool.remove(1);

        // Request 2 reuses the slot and runs its first of two chunks.
        let mut chunked =
            LlmRequest::new(2, vec![1, 2, 3, 4], 3, SamplingConfig::greedy()).with_seq_slot(0);
        chunked.state = RequestState::ContextInit;
        chunked.context_chunk_size = 2;
        chunked.move_to_next_context_chunk();
        pool.insert(chunked);
        decoder.setup_decoder_step(&context(&[2]), &mut pool).unwrap();
        let first_chunk = decoder.decode_async(&context(&[2]), &pool, &one_hot(&[7])).unwrap();

        // Overlapped: the second chunk is launched before the first commits.
        pool.get_mut(2).unwrap().move_to_next_context_chunk();
        assert!(!pool.get(2).unwrap().is_context_init_state());
        decoder.setup_decoder_step(&context(&[2]), &mut pool).unwrap();
        let last_chunk = decoder.decode_async(&context(&[2]), &pool, &one_hot(&[4])).unwrap();

        decoder.update_requests(first_chunk, &mut pool).unwrap();
        assert!(pool.get(2).unwrap().generated_tokens(0).is_empty());
        decoder.update_requests(last_chunk, &mut pool).unwrap();
        assert_eq!(pool.get(2).unwrap().generated_tokens(0), &[4]);
    }

    #[test]
    fn device_tokens_follow_row_order() {
        let mut pool = RequestPool::new();
        pool.insert(prefilled(1, 3, 4, 1));
        pool.insert(prefilled(2, 0, 4, 1));
        let mut decoder = decoder(2, 1);
        decoder.setup_decoder_step(&context(&[1, 2]), &mut pool).unwrap();
        let state = decoder.decode_async(&context(&[1, 2]), &pool, &one_hot(&[6, 2])).unwrap();
        let device: Vec<u32> = state.device.new_tokens.as_ref().unwrap().to_vec1().unwrap();
        assert_eq!(device, vec![6, 2]);
        decoder.update_requests(state, &mut pool).unwrap();
    }
}
