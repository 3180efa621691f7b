//! Step loop tying scheduler, model and decoder together.
//!
//! With overlap enabled, step n+1 is scheduled, forwarded and handed to
//! `decode_async` before step n is committed. At most one uncommitted
//! [`DecodeState`] is held, and every commit goes through `&mut RequestPool`,
//! so request mutation stays serialized.

use std::collections::HashSet;

use candle_core::Tensor;
use serde::Serialize;
use tracing::{debug, info};

use crate::batch::ScheduledRequests;
use crate::decoder::{DecodeState, Decoder, DeviceTensors};
use crate::error::{DecoderError, Result};
use crate::request::{LlmRequest, RequestId, RequestPool};
use crate::scheduler::FcfsScheduler;

/// Produces one step's score tensor, rows in scheduled-batch order.
pub trait ModelExecutor {
    /// `previous` holds the device outputs of the step still awaiting commit,
    /// when running overlapped.
    fn forward(
        &mut self,
        scheduled: &ScheduledRequests,
        requests: &RequestPool,
        previous: Option<&DeviceTensors>,
    ) -> Result<Tensor>;
}

/// What one call to [`Executor::run_step`] launched and committed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StepStats {
    pub step: usize,
    /// Step whose outputs were committed this iteration; lags `step` by one
    /// when overlapped.
    pub committed_step: Option<usize>,
    /// Score rows of the step launched this iteration.
    pub rows: usize,
    pub context_requests: usize,
    pub extend_requests: usize,
    pub generation_requests: usize,
    /// Tokens appended by the commit made this iteration.
    pub committed_tokens: usize,
    pub accepted_draft_tokens: usize,
    pub finished: Vec<RequestId>,
    /// Requests handed back to the caller after this iteration.
    pub released: usize,
}

pub struct Executor<D, M> {
    decoder: D,
    model: M,
    scheduler: FcfsScheduler,
    requests: RequestPool,
    overlap: bool,
    pending: Option<(usize, DecodeState)>,
    step: usize,
    finished: Vec<LlmRequest>,
}

impl<D: Decoder, M: ModelExecutor> Executor<D, M> {
    pub fn new(decoder: D, model: M, scheduler: FcfsScheduler, overlap: bool) -> Self {
        Self {
            decoder,
            model,
            scheduler,
            requests: RequestPool::new(),
            overlap,
            pending: None,
            step: 0,
            finished: Vec::new(),
        }
    }

    pub fn add_request(&mut self, request: LlmRequest) {
        self.scheduler.add_request(request.id);
        self.requests.insert(request);
    }

    pub fn requests(&self) -> &RequestPool {
        &self.requests
    }

    /// Mutable access between steps, e.g. for a drafter proposing tokens.
    pub fn requests_mut(&mut self) -> &mut RequestPool {
        &mut self.requests
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    /// Requests released since the last call.
    pub fn take_finished(&mut self) -> Vec<LlmRequest> {
        std::mem::take(&mut self.finished)
    }

    pub fn is_idle(&self) -> bool {
        self.scheduler.is_idle() && self.pending.is_none()
    }

    pub fn run_step(&mut self) -> Result<StepStats> {
        self.step += 1;
        let scheduled = self.scheduler.schedule(&mut self.requests)?;
        let mut stats = StepStats {
            step: self.step,
            context_requests: scheduled.context_requests.len(),
            extend_requests: scheduled.extend_requests.len(),
            generation_requests: scheduled.generation_requests.len(),
            ..Default::default()
        };

        if self.overlap {
            let previous = self.pending.as_ref().map(|(_, s)| s.device.clone());
            let next = self.launch(&scheduled, previous.as_ref(), &mut stats)?;
            if let Some((step, prev)) = self.pending.take() {
                self.commit(prev, &mut stats)?;
                stats.committed_step = Some(step);
            }
            self.pending = next.map(|state| (self.step, state));
        } else if let Some(state) = self.launch(&scheduled, None, &mut stats)? {
            self.commit(state, &mut stats)?;
            stats.committed_step = Some(self.step);
        }

        let in_flight = self.pending.as_ref().map(|(_, s)| &s.scheduled);
        let released = release_finished(&mut self.scheduler, &mut self.requests, in_flight);
        stats.released = released.len();
        self.finished.extend(released);
        debug!(
            step = stats.step,
            rows = stats.rows,
            committed = stats.committed_tokens,
            finished = stats.finished.len(),
            "step done"
        );
        Ok(stats)
    }

    /// Run until every request is released or `max_steps` is reached.
    pub fn run_until_idle(&mut self, max_steps: usize) -> Result<Vec<StepStats>> {
        let mut all = Vec::new();
        while !self.is_idle() && all.len() < max_steps {
            let stats = self.run_step()?;
            let progressed = stats.rows > 0 || stats.committed_step.is_some() || stats.released > 0;
            if !progressed {
                return Err(DecoderError::Invariant(format!(
                    "no schedulable work with {} requests waiting",
                    self.scheduler.num_waiting()
                )));
            }
            all.push(stats);
        }
        info!(
            decoder = self.decoder.name(),
            steps = all.len(),
            tokens = all.iter().map(|s| s.committed_tokens).sum::<usize>(),
            "run finished"
        );
        Ok(all)
    }

    fn launch(
        &mut self,
        scheduled: &ScheduledRequests,
        previous: Option<&DeviceTensors>,
        stats: &mut StepStats,
    ) -> Result<Option<DecodeState>> {
        if scheduled.is_empty() {
            return Ok(None);
        }
        let scores = self.model.forward(scheduled, &self.requests, previous)?;
        stats.rows = scores.dim(0)?;
        for &id in scheduled.context_requests.iter().chain(&scheduled.chunked_requests) {
            self.requests.get_mut(id)?.move_to_next_context_chunk();
        }
        self.decoder.setup_decoder_step(scheduled, &mut self.requests)?;
        let state = self.decoder.decode_async(scheduled, &self.requests, &scores)?;
        Ok(Some(state))
    }

    fn commit(&mut self, state: DecodeState, stats: &mut StepStats) -> Result<()> {
        let ids: Vec<RequestId> = state.scheduled.in_row_order().collect();
        let mut before = Vec::with_capacity(ids.len());
        for &id in &ids {
            let request = self.requests.get(id)?;
            before.push((total_tokens(request), request.is_finished()));
        }
        let extend: Vec<RequestId> = state.scheduled.extend_requests.clone();

        self.decoder.update_requests(state, &mut self.requests)?;

        for (&id, (tokens, was_finished)) in ids.iter().zip(before) {
            let request = self.requests.get(id)?;
            stats.committed_tokens += total_tokens(request) - tokens;
            if request.is_finished() && !was_finished {
                stats.finished.push(id);
            }
        }
        for id in extend {
            stats.accepted_draft_tokens += self.requests.get(id)?.num_accepted_draft_tokens;
        }
        Ok(())
    }
}

fn total_tokens(request: &LlmRequest) -> usize {
    (0..request.beam_width()).map(|b| request.num_tokens(b)).sum()
}

/// Release finished requests that no uncommitted step still refers to.
fn release_finished(
    scheduler: &mut FcfsScheduler,
    requests: &mut RequestPool,
    in_flight: Option<&ScheduledRequests>,
) -> Vec<LlmRequest> {
    let busy: HashSet<RequestId> = in_flight
        .map(|s| {
            s.in_row_order()
                .chain(s.chunked_requests.iter().copied())
                .collect()
        })
        .unwrap_or_default();
    let done: Vec<RequestId> = scheduler
        .running()
        .iter()
        .copied()
        .filter(|id| !busy.contains(id))
        .filter(|&id| requests.get(id).map(|r| r.is_finished()).unwrap_or(true))
        .collect();
    let mut released = Vec::with_capacity(done.len());
    for id in done {
        scheduler.release(id);
        if let Some(request) = requests.remove(id) {
            released.push(request);
        }
    }
    released
}
