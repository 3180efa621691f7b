//! Greedy CPU implementation of the native engine contract.

use candle_core::{DType, Device, Tensor, D};
use tracing::trace;

use super::{NativeDecoderState, NativeDecodingEngine, NativeSequence, NativeStepInput};
use crate::error::{DecoderError, Result};
use crate::request::{FinishReason, StopWords};

#[derive(Debug)]
struct SlotState {
    beams: Vec<Vec<u32>>,
    prompt_len: usize,
    end_id: Option<u32>,
    max_new_tokens: usize,
    stop_words: StopWords,
    finish: Vec<FinishReason>,
}

impl SlotState {
    fn evaluate(&self, beam: usize, token: u32, max_seq_len: usize) -> FinishReason {
        let tokens = &self.beams[beam];
        if self.end_id == Some(token) {
            FinishReason::EndId
        } else if tokens.len() - self.prompt_len >= self.max_new_tokens || tokens.len() >= max_seq_len {
            FinishReason::Length
        } else if self.stop_words.matches_suffix(tokens) {
            FinishReason::StopWords
        } else {
            FinishReason::NotFinished
        }
    }
}

/// Argmax per beam, one token per step, with end-id, length and stop-word
/// termination tracked per beam.
#[derive(Debug)]
pub struct ReferenceNativeEngine {
    max_slots: usize,
    max_beam_width: usize,
    max_seq_len: usize,
    slots: Vec<Option<SlotState>>,
    new_tokens: Vec<u32>,
    device: Device,
}

impl ReferenceNativeEngine {
    pub fn new(max_slots: usize, max_beam_width: usize, max_seq_len: usize) -> Self {
        Self {
            max_slots,
            max_beam_width,
            max_seq_len,
            slots: (0..max_slots).map(|_| None).collect(),
            new_tokens: vec![0; max_slots * max_beam_width],
            device: Device::Cpu,
        }
    }

    fn slot_mut(&mut self, slot: usize) -> Result<&mut SlotState> {
        self.slots
            .get_mut(slot)
            .and_then(Option::as_mut)
            .ok_or_else(|| DecoderError::Native(format!("slot {slot} has no sequence")))
    }
}

impl NativeDecodingEngine for ReferenceNativeEngine {
    fn max_tokens_per_step(&self) -> usize {
        1
    }

    fn max_num_slots(&self) -> usize {
        self.max_slots
    }

    fn max_beam_width(&self) -> usize {
        self.max_beam_width
    }

    fn add_sequence(&mut self, slot: usize, sequence: NativeSequence) -> Result<()> {
        let beam_width = sequence.sampling_config.beam_width.max(1);
        if slot >= self.max_slots || beam_width > self.max_beam_width {
            return Err(DecoderError::Native(format!(
                "cannot place {beam_width} beams in slot {slot} (limits {} slots x {} beams)",
                self.max_slots, self.max_beam_width
            )));
        }
        trace!(slot, request_id = sequence.request_id, "registered sequence");
        let width = self.max_beam_width;
        self.new_tokens[slot * width..(slot + 1) * width].fill(0);
        self.slots[slot] = Some(SlotState {
            beams: vec![sequence.tokens; beam_width],
            prompt_len: sequence.prompt_len,
            end_id: sequence.end_id,
            max_new_tokens: sequence.max_new_tokens,
            stop_words: sequence.stop_words,
            finish: vec![FinishReason::NotFinished; beam_width],
        });
        Ok(())
    }

    fn forward_async(&mut self, input: NativeStepInput) -> Result<()> {
        let (batch, beams, _vocab) = input.logits.dims3()?;
        if batch != input.batch_slots.len() || input.num_context_logits > batch {
            return Err(DecoderError::Native(format!(
                "{batch} logit entries for {} slots ({} context)",
                input.batch_slots.len(),
                input.num_context_logits
            )));
        }
        let chosen: Vec<Vec<u32>> = input
            .logits
            .argmax(D::Minus1)?
            .to_dtype(DType::U32)?
            .to_vec2()?;
        let max_seq_len = self.max_seq_len;
        let width = self.max_beam_width;
        for (entry, &slot) in input.batch_slots.iter().enumerate() {
            let state = self.slot_mut(slot)?;
            if state.beams.len() != beams {
                return Err(DecoderError::Native(format!(
                    "slot {slot} has {} beams, step supplied {beams}",
                    state.beams.len()
                )));
            }
            let mut emitted = Vec::with_capacity(beams);
            for beam in 0..beams {
                if state.finish[beam].is_finished() {
                    emitted.push(None);
                    continue;
                }
                let token = chosen[entry][beam];
                state.beams[beam].push(token);
                state.finish[beam] = state.evaluate(beam, token, max_seq_len);
                emitted.push(Some(token));
            }
            for (beam, token) in emitted.into_iter().enumerate() {
                if let Some(token) = token {
                    self.new_tokens[slot * width + beam] = token;
                }
            }
        }
        Ok(())
    }

    fn state(&self) -> Result<NativeDecoderState> {
        let width = self.max_beam_width;
        let mut sequence_lengths = vec![0u32; self.max_slots * width];
        let mut finish_reasons = vec![0u32; self.max_slots * width];
        let mut finished_sum = vec![0u32; self.max_slots];
        for (slot, state) in self.slots.iter().enumerate() {
            let Some(state) = state else { continue };
            for (beam, tokens) in state.beams.iter().enumerate() {
                sequence_lengths[slot * width + beam] = tokens.len() as u32;
                finish_reasons[slot * width + beam] = state.finish[beam].as_native();
            }
            finished_sum[slot] = state.finish.iter().filter(|r| r.is_finished()).count() as u32;
        }
        Ok(NativeDecoderState {
            all_new_tokens: Tensor::from_vec(
                self.new_tokens.clone(),
                (1, self.max_slots, width),
                &self.device,
            )?,
            sequence_lengths: Tensor::from_vec(sequence_lengths, self.max_slots * width, &self.device)?,
            finish_reasons: Tensor::from_vec(finish_reasons, self.max_slots * width, &self.device)?,
            finished_sum: Tensor::from_vec(finished_sum, self.max_slots, &self.device)?,
        })
    }
}
