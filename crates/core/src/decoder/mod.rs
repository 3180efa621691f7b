//! Decoder trait and its variants.
//!
//! A decoder turns one step's score tensor into committed tokens in two
//! phases:
//! - `decode_async` issues selection work and the host copy, then returns
//!   without waiting for either
//! - `update_requests` waits on the step event and mutates requests
//!
//! Requests live in the executor's [`RequestPool`]. The shared borrow taken
//! by `decode_async` and the exclusive one taken by `update_requests` keep
//! commits serialized without locks.

mod commit;
mod early_stop;
mod native;
mod simple;
mod star_attention;
mod state;

pub use early_stop::EarlyStopDecoder;
pub use native::NativeDecoder;
pub use simple::{SimpleDecoder, SimpleMode};
pub use star_attention::StarAttentionDecoder;
pub use state::{DecodeState, DeviceTensors, HostTensors};

use candle_core::Tensor;

use crate::batch::ScheduledRequests;
use crate::config::{DecoderConfig, DecoderKind};
use crate::error::{DecoderError, Result};
use crate::request::RequestPool;

pub trait Decoder: Send {
    /// Prepare per-request decoding state before `decode_async`.
    fn setup_decoder_step(
        &mut self,
        scheduled: &ScheduledRequests,
        requests: &mut RequestPool,
    ) -> Result<()> {
        // Default: nothing to prepare.
        let _ = (scheduled, requests);
        Ok(())
    }

    /// Issue token selection for `scores` and return without blocking on
    /// host availability.
    fn decode_async(
        &mut self,
        scheduled: &ScheduledRequests,
        requests: &RequestPool,
        scores: &Tensor,
    ) -> Result<DecodeState>;

    /// Wait for `state`'s outputs and commit them into `requests`.
    fn update_requests(&mut self, state: DecodeState, requests: &mut RequestPool) -> Result<()>;

    fn name(&self) -> &str;
}

impl<D: Decoder + ?Sized> Decoder for Box<D> {
    fn setup_decoder_step(
        &mut self,
        scheduled: &ScheduledRequests,
        requests: &mut RequestPool,
    ) -> Result<()> {
        (**self).setup_decoder_step(scheduled, requests)
    }

    fn decode_async(
        &mut self,
        scheduled: &ScheduledRequests,
        requests: &RequestPool,
        scores: &Tensor,
    ) -> Result<DecodeState> {
        (**self).decode_async(scheduled, requests, scores)
    }

    fn update_requests(&mut self, state: DecodeState, requests: &mut RequestPool) -> Result<()> {
        (**self).update_requests(state, requests)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Build the decoder selected by `config`.
///
/// The native decoder needs an engine and is built with
/// [`NativeDecoder::new`] instead.
pub fn build_decoder(config: &DecoderConfig) -> Result<Box<dyn Decoder>> {
    config.validate()?;
    let decoder: Box<dyn Decoder> = match config.kind {
        DecoderKind::EarlyStop => Box::new(EarlyStopDecoder::new()),
        DecoderKind::Batched => Box::new(SimpleDecoder::new(SimpleMode::Batched, config)?),
        DecoderKind::Mixed => Box::new(SimpleDecoder::new(SimpleMode::Mixed, config)?),
        DecoderKind::StarAttention => Box::new(StarAttentionDecoder::new(config)?),
        DecoderKind::Native => {
            return Err(DecoderError::Unsupported(
                "the native decoder must be built with its engine".into(),
            ))
        }
    };
    tracing::debug!(decoder = decoder.name(), "built decoder");
    Ok(decoder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_decoder_covers_every_host_kind() {
        for (kind, name) in [
            (DecoderKind::EarlyStop, "early_stop"),
            (DecoderKind::Batched, "batched"),
            (DecoderKind::Mixed, "mixed"),
            (DecoderKind::StarAttention, "star_attention"),
        ] {
            let config = DecoderConfig {
                kind,
                ..Default::default()
            };
            assert_eq!(build_decoder(&config).unwrap().name(), name);
        }
    }

    #[test]
    fn build_decoder_refuses_native() {
        let config = DecoderConfig {
            kind: DecoderKind::Native,
            ..Default::default()
        };
        assert!(matches!(build_decoder(&config), Err(DecoderError::Unsupported(_))));
    }
}
