use candle_core::Tensor;

use crate::batch::ScheduledRequests;
use crate::error::Result;
use crate::native::NativeHostBuffers;
use crate::request::{RequestPool, RequestState};
use crate::stream::StepEvent;

/// Step outputs left on the device for the next forward pass.
#[derive(Debug, Clone, Default)]
pub struct DeviceTensors {
    /// U32, one entry per score row (per beam for the native decoder).
    pub new_tokens: Option<Tensor>,
}

/// Host copies of the step outputs, readable once the step event fires.
#[derive(Debug)]
pub enum HostTensors {
    /// Nothing was copied (early stop, empty batch).
    Empty,
    /// One selected token per score row.
    Tokens { new_tokens: Vec<u32> },
    /// Per-slot buffers read back from the native engine.
    Native(NativeHostBuffers),
}

/// Per request in `scheduled` row order: whether its whole prompt has been
/// prefilled.
pub(crate) fn prefill_status(
    scheduled: &ScheduledRequests,
    requests: &RequestPool,
) -> Result<Vec<bool>> {
    scheduled
        .in_row_order()
        .map(|id| {
            requests.get(id).map(|r| {
                matches!(
                    r.state,
                    RequestState::GenerationInProgress | RequestState::GenerationComplete
                )
            })
        })
        .collect()
}

/// Everything one `decode_async` produced, consumed by the matching
/// `update_requests`.
///
/// Host data sits behind `host` and is only reachable through
/// [`StepEvent::wait`].
#[derive(Debug)]
pub struct DecodeState {
    pub scheduled: ScheduledRequests,
    /// Per request in row order: whether its prefill was complete when the
    /// step was decoded. Under overlap the live request may already have run
    /// its next chunk by commit time.
    pub prefill_done: Vec<bool>,
    pub logits: Tensor,
    /// Log-prob of the selected token per score row, when computed up front.
    /// Empty when the commit should derive them from `logits`.
    pub log_probs: Vec<Option<f32>>,
    pub device: DeviceTensors,
    pub host: StepEvent<HostTensors>,
}

impl DecodeState {
    pub fn new(
        scheduled: ScheduledRequests,
        requests: &RequestPool,
        logits: Tensor,
        device: DeviceTensors,
        host: StepEvent<HostTensors>,
    ) -> Result<Self> {
        let prefill_done = prefill_status(&scheduled, requests)?;
        Ok(Self {
            scheduled,
            prefill_done,
            logits,
            log_probs: Vec::new(),
            device,
            host,
        })
    }

    /// Whether the request at `position` in row order had left prefill when
    /// this step was decoded.
    pub fn prefill_done(&self, position: usize) -> bool {
        self.prefill_done.get(position).copied().unwrap_or(false)
    }

    pub fn with_log_probs(mut self, log_probs: Vec<Option<f32>>) -> Self {
        self.log_probs = log_probs;
        self
    }
}
