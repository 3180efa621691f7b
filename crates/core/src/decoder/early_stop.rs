use candle_core::{Tensor, D};

use super::state::{DecodeState, DeviceTensors, HostTensors};
use super::Decoder;
use crate::batch::ScheduledRequests;
use crate::error::{DecoderError, Result};
use crate::request::{FinishReason, RequestPool, RequestState};
use crate::stream::StepEvent;

/// Decoder for score-only models (encoders, reward models) that finish
/// after their context phase.
#[derive(Debug, Default)]
pub struct EarlyStopDecoder;

impl EarlyStopDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for EarlyStopDecoder {
    fn decode_async(
        &mut self,
        scheduled: &ScheduledRequests,
        requests: &RequestPool,
        scores: &Tensor,
    ) -> Result<DecodeState> {
        DecodeState::new(
            scheduled.clone(),
            requests,
            scores.clone(),
            DeviceTensors::default(),
            StepEvent::ready(HostTensors::Empty),
        )
    }

    fn update_requests(&mut self, state: DecodeState, requests: &mut RequestPool) -> Result<()> {
        if state.scheduled.has_generation() {
            return Err(DecoderError::Invariant(
                "early-stop decoder scheduled with generation requests".into(),
            ));
        }
        for (row, &id) in state.scheduled.context_requests.iter().enumerate() {
            let request = requests.get_mut(id)?;
            request.state = RequestState::GenerationComplete;
            request.set_finished_reason(FinishReason::Length, 0);
            let scores = state.logits.get(row)?;
            // Per-token scalar scores get a trailing vocab axis
            let scores = match scores.rank() {
                0 => scores.reshape((1, 1))?,
                1 => scores.unsqueeze(D::Minus1)?,
                _ => scores,
            };
            request.result.append_context_logits(scores);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "early_stop"
    }
}
