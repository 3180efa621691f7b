//! The scheduled batch for one decode step and its flat row layout.
//!
//! Rows inside the step's score tensor (and every derived token buffer) are
//! laid out as: context rows, extend rows (`1 + draft_len` each), then plain
//! generation rows. Chunked-context requests run a prefill chunk this step
//! but produce no score row.

use crate::error::{DecoderError, Result};
use crate::request::{RequestId, RequestPool};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduledRequests {
    pub context_requests: Vec<RequestId>,
    pub chunked_requests: Vec<RequestId>,
    /// Generation requests carrying draft tokens.
    pub extend_requests: Vec<RequestId>,
    pub generation_requests: Vec<RequestId>,
}

impl ScheduledRequests {
    /// Build a batch, splitting `generation` into extend and plain requests
    /// by draft presence. Relative order inside each category is kept.
    pub fn partition(
        context: Vec<RequestId>,
        generation: Vec<RequestId>,
        pool: &RequestPool,
    ) -> Result<Self> {
        let mut batch = Self {
            context_requests: context,
            ..Default::default()
        };
        for id in generation {
            if pool.get(id)?.draft_tokens.is_some() {
                batch.extend_requests.push(id);
            } else {
                batch.generation_requests.push(id);
            }
        }
        Ok(batch)
    }

    /// Number of score-producing requests.
    pub fn batch_size(&self) -> usize {
        self.context_requests.len() + self.extend_requests.len() + self.generation_requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch_size() == 0 && self.chunked_requests.is_empty()
    }

    /// Extend then plain generation requests, in row order.
    pub fn all_generation(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.extend_requests
            .iter()
            .chain(self.generation_requests.iter())
            .copied()
    }

    /// Every score-producing request in row order.
    pub fn in_row_order(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.context_requests.iter().copied().chain(self.all_generation())
    }

    pub fn has_generation(&self) -> bool {
        !self.extend_requests.is_empty() || !self.generation_requests.is_empty()
    }
}

/// Row counts consumed by each request category in one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowLayout {
    pub context_rows: usize,
    pub chunked_rows: usize,
    pub extend_rows: usize,
    pub generation_rows: usize,
}

impl RowLayout {
    pub fn compute(batch: &ScheduledRequests, pool: &RequestPool) -> Result<Self> {
        let mut extend_rows = 0;
        for &id in &batch.extend_requests {
            let request = pool.get(id)?;
            if request.draft_tokens.is_none() {
                return Err(DecoderError::Invariant(format!(
                    "extend request {id} has no draft tokens"
                )));
            }
            extend_rows += 1 + request.num_draft_tokens();
        }
        Ok(Self {
            context_rows: batch.context_requests.len(),
            chunked_rows: 0,
            extend_rows,
            generation_rows: batch.generation_requests.len(),
        })
    }

    pub fn total_rows(&self) -> usize {
        self.context_rows + self.chunked_rows + self.extend_rows + self.generation_rows
    }

    /// Fail unless the step's score tensor has exactly this many rows.
    pub fn check_rows(&self, rows: usize) -> Result<()> {
        if rows != self.total_rows() {
            return Err(DecoderError::InvalidShape {
                expected: format!("{} score rows ({self:?})", self.total_rows()),
                found: format!("{rows} rows"),
            });
        }
        Ok(())
    }
}
