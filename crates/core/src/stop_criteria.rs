//! Termination checks run after every committed token.

use crate::request::{FinishReason, LlmRequest, RequestState};

#[derive(Debug, Clone, Copy)]
pub struct StopCriteria {
    /// Global sequence-length cap shared by every request.
    pub max_seq_len: usize,
}

impl StopCriteria {
    pub fn new(max_seq_len: usize) -> Self {
        Self { max_seq_len }
    }

    /// First matching rule wins: end id, then length, then stop words.
    ///
    /// `num_tokens` is the beam's total length after `new_token` was appended.
    /// Stop words are matched against beam 0.
    pub fn evaluate(
        &self,
        request: &LlmRequest,
        new_token: u32,
        num_tokens: usize,
    ) -> Option<FinishReason> {
        if request.end_id == Some(new_token) {
            return Some(FinishReason::EndId);
        }
        let generated = num_tokens.saturating_sub(request.orig_prompt_len);
        if generated >= request.max_new_tokens || num_tokens >= self.max_seq_len {
            return Some(FinishReason::Length);
        }
        if !request.stop_words.is_empty() && request.stop_words.matches_suffix(request.tokens(0))
        {
            return Some(FinishReason::StopWords);
        }
        None
    }

    /// Evaluate and apply the transition. Returns whether the request stopped.
    pub fn handle(
        &self,
        request: &mut LlmRequest,
        new_token: u32,
        num_tokens: usize,
        beam: usize,
    ) -> bool {
        match self.evaluate(request, new_token, num_tokens) {
            Some(reason) => {
                request.state = RequestState::GenerationComplete;
                request.set_finished_reason(reason, beam);
                tracing::trace!(request_id = request.id, ?reason, num_tokens, "request finished");
                true
            }
            None => false,
        }
    }
}
