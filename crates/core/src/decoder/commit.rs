//! Row-ordered commit walk shared by the host-side decoders.
//!
//! Every helper takes the current row and returns the row where the next
//! request starts, so the running offset is threaded explicitly.

use candle_core::Tensor;
use tracing::trace;

use crate::batch::ScheduledRequests;
use crate::error::{DecoderError, Result};
use crate::request::{LlmRequest, RequestId, RequestPool};
use crate::sampling::greedy_search_sampling_batch;
use crate::stop_criteria::StopCriteria;

/// Host view of one completed step.
pub(crate) struct StepView<'a> {
    pub stop: &'a StopCriteria,
    pub new_tokens: &'a [u32],
    pub logits: &'a Tensor,
    pub log_probs: &'a [Option<f32>],
    /// Prefill status per request in row order, captured at decode time.
    pub prefill_done: &'a [bool],
}

impl StepView<'_> {
    fn token(&self, row: usize) -> Result<u32> {
        self.new_tokens.get(row).copied().ok_or_else(|| {
            DecoderError::Invariant(format!(
                "token row {row} out of range for {} rows",
                self.new_tokens.len()
            ))
        })
    }

    /// Record logits and log-probs for `count` rows starting at `row`.
    fn capture(&self, request: &mut LlmRequest, row: usize, count: usize) -> Result<()> {
        if !request.return_generation_logits && !request.return_log_probs {
            return Ok(());
        }
        let span = self.logits.narrow(0, row, count)?;
        if request.return_generation_logits {
            request.result.append_generation_logits(span.clone());
        }
        if request.return_log_probs {
            let values = match self.log_probs.get(row) {
                Some(Some(lp)) if count == 1 => vec![*lp],
                _ => greedy_search_sampling_batch(&span)?.log_prob_values()?,
            };
            request.result.append_log_probs(vec![values]);
        }
        Ok(())
    }
}

/// Walk context, extend, then generation rows and commit each request.
pub(crate) fn commit_step(
    view: &StepView<'_>,
    scheduled: &ScheduledRequests,
    requests: &mut RequestPool,
) -> Result<()> {
    let mut row = 0;
    for (position, &id) in scheduled.context_requests.iter().enumerate() {
        let prefill_done = view.prefill_done.get(position).copied().unwrap_or(false);
        row = commit_context(view, id, prefill_done, row, requests)?;
    }
    for &id in &scheduled.extend_requests {
        row = commit_extend(view, id, row, requests)?;
    }
    for &id in &scheduled.generation_requests {
        row = commit_single(view, requests.get_mut(id)?, row)?;
    }
    if row != view.new_tokens.len() {
        return Err(DecoderError::Invariant(format!(
            "commit consumed {row} rows but the step produced {}",
            view.new_tokens.len()
        )));
    }
    Ok(())
}

fn commit_context(
    view: &StepView<'_>,
    id: RequestId,
    prefill_done: bool,
    row: usize,
    requests: &mut RequestPool,
) -> Result<usize> {
    if !prefill_done {
        // Mid-prefill: the row belongs to an intermediate chunk.
        return Ok(row + 1);
    }
    commit_single(view, requests.get_mut(id)?, row)
}

fn commit_single(view: &StepView<'_>, request: &mut LlmRequest, row: usize) -> Result<usize> {
    if request.is_finished() {
        return Ok(row + 1);
    }
    let token = view.token(row)?;
    let num_tokens = request.add_new_token(token, 0);
    view.stop.handle(request, token, num_tokens, 0);
    view.capture(request, row, 1)?;
    request.decoding_iter += 1;
    trace!(request_id = request.id, row, token, "committed token");
    Ok(row + 1)
}

/// Commit the verified token and every leading draft that matches what the
/// model produced; rows past the first mismatch are discarded.
fn commit_extend(
    view: &StepView<'_>,
    id: RequestId,
    row: usize,
    requests: &mut RequestPool,
) -> Result<usize> {
    let request = requests.get_mut(id)?;
    let drafts = request.draft_tokens.clone().ok_or_else(|| {
        DecoderError::Invariant(format!("extend request {id} has no draft tokens"))
    })?;
    let width = 1 + drafts.len();
    if request.is_finished() {
        return Ok(row + width);
    }

    let mut new_token = view.token(row)?;
    let mut num_tokens = request.add_new_token(new_token, 0);
    let mut stopped = view.stop.handle(request, new_token, num_tokens, 0);
    let mut accepted = 0;
    if !stopped {
        for &draft in &drafts {
            if draft != new_token {
                break;
            }
            accepted += 1;
            new_token = view.token(row + accepted)?;
            num_tokens = request.add_new_token(new_token, 0);
            stopped = view.stop.handle(request, new_token, num_tokens, 0);
            if stopped {
                break;
            }
        }
    }

    view.capture(request, row, 1 + accepted)?;
    request.decoding_iter += 1;
    request.num_accepted_draft_tokens = accepted;
    request.rewind_len = request.draft_pages_allocated.saturating_sub(accepted);
    request.update_num_tokens_per_iteration(1 + accepted);
    trace!(
        request_id = id,
        row,
        accepted,
        proposed = drafts.len(),
        stopped,
        "verified draft tokens"
    );
    Ok(row + width)
}
