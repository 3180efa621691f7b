//! Contract with an accelerator-native batched decoding engine.
//!
//! The engine keeps persistent per-slot sequence state and performs token
//! selection itself. This layer only registers sequences, feeds it each
//! step's scores and reads back the state buffers listed in
//! [`NativeDecoderState`].

pub mod reference;

use candle_core::Tensor;

use crate::error::{DecoderError, Result};
use crate::request::{LlmRequest, RequestId, SamplingConfig, StopWords};

pub use reference::ReferenceNativeEngine;

/// Sequence registration for one batch slot.
#[derive(Debug, Clone)]
pub struct NativeSequence {
    pub request_id: RequestId,
    /// Tokens already in the sequence (prompt plus anything generated).
    pub tokens: Vec<u32>,
    pub prompt_len: usize,
    pub sampling_config: SamplingConfig,
    pub end_id: Option<u32>,
    pub max_new_tokens: usize,
    pub stop_words: StopWords,
}

impl NativeSequence {
    pub fn from_request(request: &LlmRequest) -> Self {
        Self {
            request_id: request.id,
            tokens: request.tokens(0).to_vec(),
            prompt_len: request.orig_prompt_len,
            sampling_config: request.sampling_config.clone(),
            end_id: request.end_id,
            max_new_tokens: request.max_new_tokens,
            stop_words: request.stop_words.clone(),
        }
    }
}

/// One native decoding step.
#[derive(Debug, Clone)]
pub struct NativeStepInput {
    /// F32 `[batch, beam, vocab]`.
    pub logits: Tensor,
    /// Slot of each batch entry.
    pub batch_slots: Vec<usize>,
    /// Leading batch entries that come from context requests.
    pub num_context_logits: usize,
}

/// Device-resident engine state after the latest step.
#[derive(Debug, Clone)]
pub struct NativeDecoderState {
    /// U32 `[steps, slots, beams]`.
    pub all_new_tokens: Tensor,
    /// U32 `[slots * beams]`.
    pub sequence_lengths: Tensor,
    /// U32 `[slots * beams]`: [`FinishReason`](crate::request::FinishReason) codes.
    pub finish_reasons: Tensor,
    /// U32 `[slots]`: finished beams per slot.
    pub finished_sum: Tensor,
}

pub trait NativeDecodingEngine: Send {
    /// Positions the engine can emit per sequence in one step.
    fn max_tokens_per_step(&self) -> usize;

    fn max_num_slots(&self) -> usize;

    fn max_beam_width(&self) -> usize;

    /// (Re)initialize `slot` for a new sequence.
    fn add_sequence(&mut self, slot: usize, sequence: NativeSequence) -> Result<()>;

    /// Enqueue one decoding step. Results are visible through [`state`](Self::state).
    fn forward_async(&mut self, input: NativeStepInput) -> Result<()>;

    fn state(&self) -> Result<NativeDecoderState>;
}

/// Host copy of a [`NativeDecoderState`], reused across steps.
#[derive(Debug, Clone, Default)]
pub struct NativeHostBuffers {
    steps: usize,
    slots: usize,
    beams: usize,
    new_tokens: Vec<u32>,
    sequence_lengths: Vec<u32>,
    finish_reasons: Vec<u32>,
    finished_sum: Vec<u32>,
}

impl NativeHostBuffers {
    pub fn with_capacity(steps: usize, slots: usize, beams: usize) -> Self {
        Self {
            steps: 0,
            slots: 0,
            beams: 0,
            new_tokens: Vec::with_capacity(steps * slots * beams),
            sequence_lengths: Vec::with_capacity(slots * beams),
            finish_reasons: Vec::with_capacity(slots * beams),
            finished_sum: Vec::with_capacity(slots),
        }
    }

    /// Overwrite the buffers with `state`, blocking on the device read.
    pub fn copy_from(&mut self, state: &NativeDecoderState) -> Result<()> {
        let (steps, slots, beams) = state.all_new_tokens.dims3()?;
        fill(&mut self.new_tokens, &state.all_new_tokens.flatten_all()?)?;
        fill(&mut self.sequence_lengths, &state.sequence_lengths)?;
        fill(&mut self.finish_reasons, &state.finish_reasons)?;
        fill(&mut self.finished_sum, &state.finished_sum)?;
        if self.sequence_lengths.len() != slots * beams
            || self.finish_reasons.len() != slots * beams
            || self.finished_sum.len() != slots
        {
            return Err(DecoderError::Native(format!(
                "state buffers disagree with {slots} slots x {beams} beams"
            )));
        }
        self.steps = steps;
        self.slots = slots;
        self.beams = beams;
        Ok(())
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn beam_width(&self) -> usize {
        self.beams
    }

    pub fn new_token(&self, step: usize, slot: usize, beam: usize) -> Result<u32> {
        if step >= self.steps {
            return Err(DecoderError::Native(format!(
                "step {step} beyond {} emitted steps",
                self.steps
            )));
        }
        let idx = (step * self.slots + self.check_slot(slot)?) * self.beams + self.check_beam(beam)?;
        Ok(self.new_tokens[idx])
    }

    pub fn sequence_length(&self, slot: usize, beam: usize) -> Result<usize> {
        let idx = self.check_slot(slot)? * self.beams + self.check_beam(beam)?;
        Ok(self.sequence_lengths[idx] as usize)
    }

    pub fn finish_reason(&self, slot: usize, beam: usize) -> Result<u32> {
        let idx = self.check_slot(slot)? * self.beams + self.check_beam(beam)?;
        Ok(self.finish_reasons[idx])
    }

    pub fn finished_sum(&self, slot: usize) -> Result<usize> {
        Ok(self.finished_sum[self.check_slot(slot)?] as usize)
    }

    fn check_slot(&self, slot: usize) -> Result<usize> {
        if slot >= self.slots {
            return Err(DecoderError::Invariant(format!(
                "slot {slot} out of range for {} slots",
                self.slots
            )));
        }
        Ok(slot)
    }

    fn check_beam(&self, beam: usize) -> Result<usize> {
        if beam >= self.beams {
            return Err(DecoderError::Invariant(format!(
                "beam {beam} out of range for width {}",
                self.beams
            )));
        }
        Ok(beam)
    }
}

fn fill(dst: &mut Vec<u32>, src: &Tensor) -> Result<()> {
    dst.clear();
    dst.extend_from_slice(&src.to_vec1::<u32>()?);
    Ok(())
}
