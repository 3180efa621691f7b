//! First-come-first-served step scheduler.
//!
//! Stands in for the serving layer's scheduler: enough to feed the overlap
//! driver with realistic batches (chunked prefill, slot reuse, draft
//! requests), without cache accounting or preemption.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::batch::ScheduledRequests;
use crate::error::Result;
use crate::request::{RequestId, RequestPool, RequestState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Requests holding a slot at once.
    pub max_batch_size: usize,
    /// Prompt plus generated tokens processed per step.
    pub max_num_tokens: usize,
    /// Split long prompts into chunks across steps.
    pub enable_chunked_prefill: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 64,
            max_num_tokens: 2048,
            enable_chunked_prefill: false,
        }
    }
}

pub struct FcfsScheduler {
    config: SchedulerConfig,
    waiting: VecDeque<RequestId>,
    /// Arrival order.
    running: Vec<RequestId>,
    free_slots: Vec<usize>,
    slots: HashMap<RequestId, usize>,
}

impl FcfsScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            waiting: VecDeque::new(),
            running: Vec::new(),
            // Reversed so the lowest slot is handed out first
            free_slots: (0..config.max_batch_size).rev().collect(),
            slots: HashMap::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn add_request(&mut self, id: RequestId) {
        self.waiting.push_back(id);
    }

    /// Drop `id` and free its slot.
    pub fn release(&mut self, id: RequestId) {
        self.running.retain(|&x| x != id);
        self.waiting.retain(|&x| x != id);
        if let Some(slot) = self.slots.remove(&id) {
            self.free_slots.push(slot);
        }
    }

    pub fn is_idle(&self) -> bool {
        self.waiting.is_empty() && self.running.is_empty()
    }

    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    pub fn running(&self) -> &[RequestId] {
        &self.running
    }

    /// Build the next step's batch. Called once per executor iteration.
    ///
    /// Finished requests are left out but keep their slot until released.
    pub fn schedule(&mut self, pool: &mut RequestPool) -> Result<ScheduledRequests> {
        let mut budget = self.config.max_num_tokens;
        let mut context = Vec::new();
        let mut generation = Vec::new();

        // Step 1: running requests continue prefill or decode
        for &id in &self.running {
            let request = pool.get_mut(id)?;
            if request.is_finished() {
                continue;
            }
            if request.is_context_init_state() {
                let remaining = request.context_remaining_length();
                let chunk = if self.config.enable_chunked_prefill {
                    remaining.min(budget)
                } else {
                    remaining
                };
                if chunk == 0 || chunk > budget {
                    continue;
                }
                request.context_chunk_size = chunk;
                budget -= chunk;
                context.push(id);
            } else {
                let step_tokens = 1 + request.num_draft_tokens();
                if step_tokens > budget {
                    continue;
                }
                budget -= step_tokens;
                generation.push(id);
            }
        }

        // Step 2: admit waiting requests into free slots
        while let Some(&id) = self.waiting.front() {
            if self.running.len() >= self.config.max_batch_size {
                break;
            }
            let Some(&slot) = self.free_slots.last() else {
                break;
            };
            let request = pool.get_mut(id)?;
            let remaining = request.context_remaining_length();
            let chunk = if self.config.enable_chunked_prefill {
                remaining.min(budget)
            } else {
                remaining
            };
            if chunk == 0 || chunk > budget {
                break;
            }
            self.waiting.pop_front();
            self.free_slots.pop();
            self.slots.insert(id, slot);
            request.seq_slot = slot;
            request.state = RequestState::ContextInit;
            request.context_chunk_size = chunk;
            budget -= chunk;
            self.running.push(id);
            context.push(id);
        }

        let batch = ScheduledRequests::partition(context, generation, pool)?;
        let mut row = 0;
        for id in batch.in_row_order() {
            let request = pool.get_mut(id)?;
            request.output_token_idx = row;
            row += 1 + request.num_draft_tokens();
        }
        tracing::debug!(
            context = batch.context_requests.len(),
            extend = batch.extend_requests.len(),
            generation = batch.generation_requests.len(),
            waiting = self.waiting.len(),
            "scheduled step"
        );
        Ok(batch)
    }
}
