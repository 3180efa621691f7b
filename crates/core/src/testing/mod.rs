//! Shared test utilities for tokstep-core.
//!
//! Scripted score producers and request builders for exercising decoders
//! and the executor without a model.

mod scripted_model;

pub use scripted_model::{one_hot_scores, ScriptedModel};

use crate::request::{LlmRequest, RequestId, RequestState, SamplingConfig};

/// A greedy request with prompt `0..prompt_len`.
pub fn request(id: RequestId, prompt_len: usize, max_new_tokens: usize) -> LlmRequest {
    LlmRequest::new(
        id,
        (0..prompt_len as u32).collect(),
        max_new_tokens,
        SamplingConfig::greedy(),
    )
}

/// A request whose prompt is fully prefilled and which is generating.
pub fn generating_request(id: RequestId, prompt_len: usize, max_new_tokens: usize) -> LlmRequest {
    let mut req = request(id, prompt_len, max_new_tokens);
    req.state = RequestState::GenerationInProgress;
    req.context_position = prompt_len;
    req
}
