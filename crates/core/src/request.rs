use std::collections::HashMap;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{DecoderError, Result};

pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Admitted but not yet scheduled.
    Init,
    /// Prefill in progress; more context chunks remain.
    ContextInit,
    GenerationInProgress,
    GenerationComplete,
}

impl RequestState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::GenerationComplete)
    }

    pub fn is_running(self) -> bool {
        matches!(self, Self::ContextInit | Self::GenerationInProgress)
    }
}

/// Why a beam stopped generating.
///
/// The discriminants match the codes written by the native decoding engine
/// into its finish-reason buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    #[default]
    NotFinished = 0,
    EndId = 1,
    StopWords = 2,
    Length = 3,
}

impl FinishReason {
    pub fn from_native(code: u32) -> Result<Self> {
        match code {
            0 => Ok(Self::NotFinished),
            1 => Ok(Self::EndId),
            2 => Ok(Self::StopWords),
            3 => Ok(Self::Length),
            other => Err(DecoderError::Native(format!(
                "unknown finish reason code {other}"
            ))),
        }
    }

    pub fn as_native(self) -> u32 {
        self as u32
    }

    pub fn is_finished(self) -> bool {
        self != Self::NotFinished
    }
}

/// Per-request sampling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Number of beams. 1 = no beam search.
    pub beam_width: usize,
    /// Top-K restriction. `None` or `Some(0)` = disabled.
    pub top_k: Option<usize>,
    /// Nucleus threshold. `None` = disabled.
    pub top_p: Option<f32>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            beam_width: 1,
            top_k: None,
            top_p: None,
        }
    }
}

impl SamplingConfig {
    pub fn greedy() -> Self {
        Self::default()
    }

    pub fn top_k(k: usize) -> Self {
        Self {
            top_k: Some(k),
            ..Default::default()
        }
    }

    pub fn top_p(p: f32) -> Self {
        Self {
            top_p: Some(p),
            ..Default::default()
        }
    }

    pub fn with_beam_width(mut self, beam_width: usize) -> Self {
        self.beam_width = beam_width;
        self
    }
}

/// Stop phrases stored as one flat token sequence plus prefix-sum phrase ends.
///
/// Phrase `i` spans `tokens[prefix_sum[i - 1]..prefix_sum[i]]` (with an
/// implicit leading zero). Every phrase holds at least one token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopWords {
    tokens: Vec<u32>,
    prefix_sum: Vec<usize>,
}

impl StopWords {
    pub fn new(tokens: Vec<u32>, prefix_sum: Vec<usize>) -> Result<Self> {
        let mut prev = 0;
        for &end in &prefix_sum {
            if end <= prev || end > tokens.len() {
                return Err(DecoderError::Invariant(format!(
                    "stop word prefix sums must be strictly increasing and within {} tokens, got {prefix_sum:?}",
                    tokens.len()
                )));
            }
            prev = end;
        }
        Ok(Self { tokens, prefix_sum })
    }

    /// Empty phrases are dropped.
    pub fn from_phrases<I, P>(phrases: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u32]>,
    {
        let mut tokens = Vec::new();
        let mut prefix_sum = Vec::new();
        let mut dropped = 0;
        for phrase in phrases {
            if phrase.as_ref().is_empty() {
                dropped += 1;
                continue;
            }
            tokens.extend_from_slice(phrase.as_ref());
            prefix_sum.push(tokens.len());
        }
        if dropped > 0 {
            tracing::warn!(dropped, "ignoring empty stop phrases");
        }
        Self { tokens, prefix_sum }
    }

    pub fn is_empty(&self) -> bool {
        self.prefix_sum.is_empty()
    }

    pub fn phrases(&self) -> impl Iterator<Item = &[u32]> + '_ {
        let starts = std::iter::once(0).chain(self.prefix_sum.iter().copied());
        starts
            .zip(self.prefix_sum.iter().copied())
            .map(move |(start, end)| &self.tokens[start..end])
    }

    /// Whether `tokens` ends with any configured phrase.
    ///
    /// Phrases longer than `tokens` never match.
    pub fn matches_suffix(&self, tokens: &[u32]) -> bool {
        self.phrases().any(|phrase| {
            !phrase.is_empty() && phrase.len() <= tokens.len() && tokens.ends_with(phrase)
        })
    }
}

/// Outputs captured for response assembly.
#[derive(Debug, Default)]
pub struct RequestResult {
    pub context_logits: Vec<Tensor>,
    pub generation_logits: Vec<Tensor>,
    /// One entry per capture, holding log-probs per beam.
    pub log_probs: Vec<Vec<Vec<f32>>>,
}

impl RequestResult {
    pub fn append_context_logits(&mut self, logits: Tensor) {
        self.context_logits.push(logits);
    }

    pub fn append_generation_logits(&mut self, logits: Tensor) {
        self.generation_logits.push(logits);
    }

    pub fn append_log_probs(&mut self, log_probs: Vec<Vec<f32>>) {
        self.log_probs.push(log_probs);
    }
}

/// Generation state of one in-flight request.
///
/// Owned by the executor through a [`RequestPool`]; decoders only see it
/// during `decode_async` (shared) and `update_requests` (exclusive).
#[derive(Debug)]
pub struct LlmRequest {
    pub id: RequestId,
    pub state: RequestState,
    pub sampling_config: SamplingConfig,
    beams: Vec<Vec<u32>>,
    finish_reasons: Vec<FinishReason>,
    pub orig_prompt_len: usize,
    pub end_id: Option<u32>,
    pub max_new_tokens: usize,
    pub stop_words: StopWords,
    /// Speculative tokens proposed for this step (extend requests only).
    pub draft_tokens: Option<Vec<u32>>,
    pub draft_pages_allocated: usize,
    pub decoding_iter: usize,
    pub num_accepted_draft_tokens: usize,
    pub rewind_len: usize,
    pub num_tokens_per_iteration: usize,
    pub return_context_logits: bool,
    pub return_generation_logits: bool,
    pub return_log_probs: bool,
    pub result: RequestResult,
    /// Row of this request in the shared per-slot step buffers.
    pub seq_slot: usize,
    /// Row holding this request's token in star-attention step outputs.
    pub output_token_idx: usize,
    /// Prompt tokens already prefilled.
    pub context_position: usize,
    pub context_chunk_size: usize,
}

impl LlmRequest {
    pub fn new(
        id: RequestId,
        prompt: Vec<u32>,
        max_new_tokens: usize,
        sampling_config: SamplingConfig,
    ) -> Self {
        let beam_width = sampling_config.beam_width.max(1);
        let prompt_len = prompt.len();
        Self {
            id,
            state: RequestState::Init,
            sampling_config,
            beams: vec![prompt; beam_width],
            finish_reasons: vec![FinishReason::NotFinished; beam_width],
            orig_prompt_len: prompt_len,
            end_id: None,
            max_new_tokens,
            stop_words: StopWords::default(),
            draft_tokens: None,
            draft_pages_allocated: 0,
            decoding_iter: 0,
            num_accepted_draft_tokens: 0,
            rewind_len: 0,
            num_tokens_per_iteration: 1,
            return_context_logits: false,
            return_generation_logits: false,
            return_log_probs: false,
            result: RequestResult::default(),
            seq_slot: 0,
            output_token_idx: 0,
            context_position: 0,
            context_chunk_size: prompt_len,
        }
    }

    pub fn with_end_id(mut self, end_id: u32) -> Self {
        self.end_id = Some(end_id);
        self
    }

    pub fn with_stop_words(mut self, stop_words: StopWords) -> Self {
        self.stop_words = stop_words;
        self
    }

    pub fn with_seq_slot(mut self, seq_slot: usize) -> Self {
        self.seq_slot = seq_slot;
        self
    }

    pub fn with_draft_tokens(mut self, draft_tokens: Vec<u32>) -> Self {
        self.draft_pages_allocated = self.draft_pages_allocated.max(draft_tokens.len());
        self.draft_tokens = Some(draft_tokens);
        self
    }

    pub fn beam_width(&self) -> usize {
        self.beams.len()
    }

    /// Append `token` to `beam`, returning the beam's new token count.
    pub fn add_new_token(&mut self, token: u32, beam: usize) -> usize {
        let tokens = &mut self.beams[beam];
        tokens.push(token);
        tokens.len()
    }

    pub fn tokens(&self, beam: usize) -> &[u32] {
        &self.beams[beam]
    }

    pub fn num_tokens(&self, beam: usize) -> usize {
        self.beams[beam].len()
    }

    pub fn max_beam_num_tokens(&self) -> usize {
        self.beams.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Generated tokens (beyond the prompt) on `beam`.
    pub fn generated_tokens(&self, beam: usize) -> &[u32] {
        &self.beams[beam][self.orig_prompt_len.min(self.beams[beam].len())..]
    }

    pub fn set_finished_reason(&mut self, reason: FinishReason, beam: usize) {
        self.finish_reasons[beam] = reason;
    }

    pub fn finished_reason(&self, beam: usize) -> FinishReason {
        self.finish_reasons[beam]
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    pub fn context_remaining_length(&self) -> usize {
        self.orig_prompt_len.saturating_sub(self.context_position)
    }

    pub fn is_context_init_state(&self) -> bool {
        self.state == RequestState::ContextInit
    }

    /// Record that the current prefill chunk has run.
    ///
    /// Moves the request into generation once the whole prompt is prefilled.
    pub fn move_to_next_context_chunk(&mut self) {
        self.context_position = (self.context_position + self.context_chunk_size)
            .min(self.orig_prompt_len);
        if self.state == RequestState::ContextInit && self.context_remaining_length() == 0 {
            self.state = RequestState::GenerationInProgress;
        }
    }

    pub fn num_draft_tokens(&self) -> usize {
        self.draft_tokens.as_ref().map_or(0, Vec::len)
    }

    pub fn update_num_tokens_per_iteration(&mut self, num_tokens: usize) {
        self.num_tokens_per_iteration = num_tokens.max(1);
    }
}

/// Executor-owned table of in-flight requests.
#[derive(Debug, Default)]
pub struct RequestPool {
    requests: HashMap<RequestId, LlmRequest>,
}

impl RequestPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, request: LlmRequest) -> Option<LlmRequest> {
        self.requests.insert(request.id, request)
    }

    pub fn remove(&mut self, id: RequestId) -> Option<LlmRequest> {
        self.requests.remove(&id)
    }

    pub fn get(&self, id: RequestId) -> Result<&LlmRequest> {
        self.requests
            .get(&id)
            .ok_or(DecoderError::UnknownRequest(id))
    }

    pub fn get_mut(&mut self, id: RequestId) -> Result<&mut LlmRequest> {
        self.requests
            .get_mut(&id)
            .ok_or(DecoderError::UnknownRequest(id))
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.requests.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LlmRequest> {
        self.requests.values()
    }
}
