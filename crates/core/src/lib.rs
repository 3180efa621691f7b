pub mod batch;
pub mod config;
pub mod decoder;
pub mod error;
pub mod executor;
pub mod native;
pub mod request;
pub mod sampling;
pub mod scheduler;
pub mod stop_criteria;
pub mod stream;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use error::{DecoderError, Result};
