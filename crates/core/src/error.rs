use thiserror::Error;

use crate::request::RequestId;

/// Errors surfaced by the decoding layer.
///
/// Every variant except `Candle` signals a breach of the scheduler/engine
/// contract. None of them are retried; callers treat them as fatal for the
/// step.
#[derive(Error, Debug)]
pub enum DecoderError {
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("invalid shape: expected {expected}, found {found}")]
    InvalidShape { expected: String, found: String },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("request {0} is not in the pool")]
    UnknownRequest(RequestId),

    #[error("no free scratch buffers: {depth} steps already in flight")]
    ScratchExhausted { depth: usize },

    #[error("copy stream closed before the step completed")]
    StreamClosed,

    #[error("native engine error: {0}")]
    Native(String),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DecoderError>;
