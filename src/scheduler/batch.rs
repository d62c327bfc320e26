//! Continuous batching scheduler.
//!
//! The scheduler decides, every iteration, which requests run and makes sure
//! each of them owns the KV blocks its next step writes into.
//!
//! ## Scheduling Flow
//!
//! ```text
//!   enqueue                         schedule()
//!      │                                │
//!      ▼                                ▼
//!  ┌─────────┐   admit (fits)     ┌─────────┐   swap out (pressure)   ┌─────────┐
//!  │ Waiting │ ─────────────────► │ Running │ ──────────────────────► │ Swapped │
//!  │  Queue  │                    │   Set   │ ◄────────────────────── │   Set   │
//!  └─────────┘                    └─────────┘   swap in (FIFO)        └─────────┘
//!                                      │
//!                                      ▼ eos / max tokens / cancel
//!                                  Finished
//! ```
//!
//! One iteration runs these passes in order:
//!
//! 1. **Reap**: cancelled running and swapped requests finish.
//! 2. **Preempt**: while running requests need more blocks than are free,
//!    swap out a victim. When no running request can advance at all (swap
//!    disabled or host pool full), a victim drops its blocks and goes back
//!    to the waiting queue to be recomputed.
//! 3. **Grow**: running requests allocate the blocks of their next step.
//! 4. **Swap in**: when nothing was preempted, bring swapped requests back.
//! 5. **Admit**: when nothing is swapped, admit waiting requests until the
//!    first one that does not fit.
//! 6. **Assemble**: split the running set into context-decode and decode
//!    sub-batches.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{AdmissionOrder, SchedulerConfig};
use crate::core::block_manager::BlockManager;
use crate::core::request::{FinishReason, Request, RequestId, Stage};
use crate::engine::sampler::SampleOutput;
use crate::error::{Error, Result};
use crate::scheduler::policy::{lowest_priority_below, select_victim};
use crate::scheduler::queue::WaitingQueue;

/// Output of one scheduling iteration.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SchedulerOutputs {
    /// Requests forwarding their whole prompt this iteration.
    pub context_decode: Vec<RequestId>,
    /// Requests forwarding one token this iteration.
    pub decode: Vec<RequestId>,
    /// Requests admitted from the waiting queue this iteration.
    pub admitted: Vec<RequestId>,
    /// Requests swapped out this iteration.
    pub preempted: Vec<RequestId>,
    /// Requests sent back to the waiting queue for recompute.
    pub recomputed: Vec<RequestId>,
    /// Requests swapped back in this iteration.
    pub swapped_in: Vec<RequestId>,
    /// Requests finished as cancelled this iteration.
    pub cancelled: Vec<RequestId>,
    /// Running requests left out for lack of blocks.
    pub stalled: Vec<RequestId>,
    /// Prompt tokens forwarded this iteration.
    pub num_context_tokens: usize,
    /// Decode tokens forwarded this iteration.
    pub num_decode_tokens: usize,
}

impl SchedulerOutputs {
    /// Whether there is nothing to forward.
    pub fn is_empty(&self) -> bool {
        self.context_decode.is_empty() && self.decode.is_empty()
    }

    pub fn num_requests(&self) -> usize {
        self.context_decode.len() + self.decode.len()
    }

    pub fn num_tokens(&self) -> usize {
        self.num_context_tokens + self.num_decode_tokens
    }
}

/// Borrowed view of the requests in one iteration's batch.
#[derive(Debug, Default)]
pub struct ScheduledBatch<'a> {
    pub context_decode: Vec<&'a Request>,
    pub decode: Vec<&'a Request>,
}

/// Continuous batching scheduler.
///
/// Owns the running and swapped sets; the waiting queue is shared with the
/// client side, which may push to it and remove from it concurrently.
#[derive(Debug)]
pub struct Scheduler {
    config: SchedulerConfig,
    enable_prefix_caching: bool,
    block_manager: Arc<BlockManager>,
    waiting: Arc<WaitingQueue>,
    /// Device-resident requests in admission order.
    running: Vec<Request>,
    /// Host-resident requests in preemption order.
    swapped: VecDeque<Request>,
}

impl Scheduler {
    /// Create a scheduler over a shared block manager and waiting queue.
    pub fn new(
        config: SchedulerConfig,
        enable_prefix_caching: bool,
        block_manager: Arc<BlockManager>,
        waiting: Arc<WaitingQueue>,
    ) -> Self {
        Self {
            config,
            enable_prefix_caching,
            block_manager,
            waiting,
            running: Vec::new(),
            swapped: VecDeque::new(),
        }
    }

    /// Run one scheduling iteration.
    ///
    /// An empty batch is not an error.
    ///
    /// # Errors
    ///
    /// Memory pressure is handled internally; only invalid state and device
    /// failures are returned.
    pub fn schedule(&mut self) -> Result<SchedulerOutputs> {
        let mut outputs = SchedulerOutputs::default();

        self.reap_cancelled(&mut outputs)?;
        let mut stalled = self.preempt(&mut outputs)?;
        self.grow(&mut stalled)?;
        if outputs.preempted.is_empty() && outputs.recomputed.is_empty() {
            self.swap_in(&mut outputs)?;
        }
        if self.swapped.is_empty() {
            self.admit(&mut outputs, &stalled)?;
        }
        self.assemble(&mut outputs, &stalled);

        if !outputs.is_empty() || !outputs.preempted.is_empty() || !outputs.recomputed.is_empty() {
            debug!(
                context = outputs.context_decode.len(),
                decode = outputs.decode.len(),
                admitted = outputs.admitted.len(),
                preempted = outputs.preempted.len(),
                recomputed = outputs.recomputed.len(),
                swapped_in = outputs.swapped_in.len(),
                waiting = self.waiting.len(),
                free_blocks = self.block_manager.min_free_blocks(),
                "scheduled iteration"
            );
        }
        Ok(outputs)
    }

    fn reap_cancelled(&mut self, outputs: &mut SchedulerOutputs) -> Result<()> {
        let mut reaped = Vec::new();
        let mut i = 0;
        while i < self.running.len() {
            if self.running[i].is_cancelled() {
                reaped.push(self.running.remove(i));
            } else {
                i += 1;
            }
        }
        let mut kept = VecDeque::with_capacity(self.swapped.len());
        for request in self.swapped.drain(..) {
            if request.is_cancelled() {
                reaped.push(request);
            } else {
                kept.push_back(request);
            }
        }
        self.swapped = kept;

        for mut request in reaped {
            outputs.cancelled.push(request.id());
            request.finish(FinishReason::Cancelled)?;
        }
        Ok(())
    }

    /// Uncommitted demand of the running set.
    fn running_demand(&self) -> usize {
        self.running.iter().map(Request::pending_block_count).sum()
    }

    /// Swap out victims until the running set's growth fits.
    ///
    /// Returns the requests that cannot grow this iteration. With more than
    /// one running request, at least one is left able to advance.
    fn preempt(&mut self, outputs: &mut SchedulerOutputs) -> Result<HashSet<RequestId>> {
        loop {
            let free = self.block_manager.min_free_blocks();
            if self.running_demand() <= free {
                break;
            }
            if !self.config.enable_preemption || self.running.len() <= 1 {
                break;
            }
            let Some(index) = select_victim(self.config.preemption_policy, &self.running) else {
                break;
            };
            if !self.swap_out(index, outputs)? {
                // Host pool full: whoever cannot grow waits for this iteration.
                break;
            }
        }

        loop {
            let stalled = self.stalled_requests();
            if stalled.len() < self.running.len() || self.running.len() <= 1 {
                return Ok(stalled);
            }
            // Nobody can advance: blocks come back only by recomputing a victim.
            let Some(index) = select_victim(self.config.preemption_policy, &self.running) else {
                return Ok(stalled);
            };
            self.recompute(index, outputs)?;
        }
    }

    /// Running requests whose growth does not fit, in admission order.
    fn stalled_requests(&self) -> HashSet<RequestId> {
        let mut stalled = HashSet::new();
        let mut free = self.block_manager.min_free_blocks();
        for request in &self.running {
            let pending = request.pending_block_count();
            if pending <= free {
                free -= pending;
            } else {
                stalled.insert(request.id());
            }
        }
        stalled
    }

    /// Release `running[index]`'s blocks and send it back to the waiting queue.
    fn recompute(&mut self, index: usize, outputs: &mut SchedulerOutputs) -> Result<()> {
        let mut victim = self.running.remove(index);
        victim.reset_for_recompute()?;
        info!(
            request_id = victim.id(),
            priority = victim.priority(),
            generated = victim.num_generated(),
            "preempted request for recompute"
        );
        outputs.recomputed.push(victim.id());
        self.waiting.requeue(victim);
        Ok(())
    }

    /// Swap out `running[index]`; `false` when the host pool cannot take it.
    fn swap_out(&mut self, index: usize, outputs: &mut SchedulerOutputs) -> Result<bool> {
        let mut victim = self.running.remove(index);
        match victim.swap_out_async() {
            Ok(()) => {
                info!(
                    request_id = victim.id(),
                    priority = victim.priority(),
                    blocks = victim.current_block_count(),
                    "preempted request"
                );
                outputs.preempted.push(victim.id());
                self.swapped.push_back(victim);
                Ok(true)
            }
            Err(e) if e.is_resource_exhausted() => {
                debug!(request_id = victim.id(), error = %e, "host pool full, cannot preempt");
                self.running.insert(index, victim);
                Ok(false)
            }
            Err(e) => {
                self.running.insert(index, victim);
                Err(e)
            }
        }
    }

    fn grow(&mut self, stalled: &mut HashSet<RequestId>) -> Result<()> {
        for request in &mut self.running {
            if stalled.contains(&request.id()) || request.pending_block_count() == 0 {
                continue;
            }
            match request.allocate_step_blocks() {
                Ok(()) => {}
                Err(e) if e.is_resource_exhausted() => {
                    stalled.insert(request.id());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn swap_in(&mut self, outputs: &mut SchedulerOutputs) -> Result<()> {
        while let Some(request) = self.swapped.front() {
            if self.running.len() >= self.config.max_batch_size {
                break;
            }
            if request.total_block_count() > self.block_manager.min_free_blocks() {
                break;
            }
            let Some(mut request) = self.swapped.pop_front() else {
                break;
            };
            if let Err(e) = request.swap_in_async() {
                self.swapped.push_front(request);
                if e.is_resource_exhausted() {
                    break;
                }
                return Err(e);
            }
            request.allocate_step_blocks()?;
            debug!(request_id = request.id(), "swapped in request");
            outputs.swapped_in.push(request.id());
            self.running.push(request);
        }
        Ok(())
    }

    /// Tokens the batch already forwards, stalled requests excluded.
    fn batch_tokens(&self, stalled: &HashSet<RequestId>) -> usize {
        self.running
            .iter()
            .filter(|r| !stalled.contains(&r.id()))
            .map(forwarded_tokens)
            .sum()
    }

    fn admit(&mut self, outputs: &mut SchedulerOutputs, stalled: &HashSet<RequestId>) -> Result<()> {
        let order = self.config.admission_order;
        let mut batch_tokens = self.batch_tokens(stalled);

        while self.running.len() < self.config.max_batch_size {
            let Some((arrival, mut candidate)) = self.waiting.pop_next(order) else {
                break;
            };
            if candidate.is_cancelled() {
                outputs.cancelled.push(candidate.id());
                candidate.finish(FinishReason::Cancelled)?;
                continue;
            }

            let tokens = candidate.input_tokens().len();
            if batch_tokens > 0 && batch_tokens + tokens > self.config.max_step_tokens {
                self.waiting.restore(arrival, candidate);
                break;
            }

            if self.enable_prefix_caching {
                candidate.reuse_cached_prefix()?;
            }
            if !self.make_room(&candidate, outputs)? {
                candidate.release_cached_prefix()?;
                self.waiting.restore(arrival, candidate);
                break;
            }

            if let Err(e) = candidate.allocate_step_blocks() {
                candidate.release_cached_prefix()?;
                self.waiting.restore(arrival, candidate);
                if e.is_resource_exhausted() {
                    break;
                }
                return Err(e);
            }
            candidate.enter_context_decode()?;

            debug!(
                request_id = candidate.id(),
                prompt_tokens = tokens,
                cached_tokens = candidate.prefix_cached_tokens(),
                blocks = candidate.current_block_count(),
                "admitted request"
            );
            batch_tokens += tokens;
            outputs.admitted.push(candidate.id());
            self.running.push(candidate);
        }
        Ok(())
    }

    /// Whether `candidate`'s demand fits, preempting lower-priority running
    /// requests under priority admission.
    fn make_room(&mut self, candidate: &Request, outputs: &mut SchedulerOutputs) -> Result<bool> {
        let demand = candidate.pending_block_count();
        loop {
            if demand <= self.block_manager.min_free_blocks() {
                return Ok(true);
            }
            if self.config.admission_order != AdmissionOrder::Priority
                || !self.config.enable_preemption
            {
                return Ok(false);
            }
            let Some(index) = lowest_priority_below(&self.running, candidate.priority()) else {
                return Ok(false);
            };
            if !self.swap_out(index, outputs)? {
                return Ok(false);
            }
        }
    }

    fn assemble(&self, outputs: &mut SchedulerOutputs, stalled: &HashSet<RequestId>) {
        for request in &self.running {
            if stalled.contains(&request.id()) {
                outputs.stalled.push(request.id());
                continue;
            }
            match request.stage() {
                Stage::ContextDecode => {
                    outputs.context_decode.push(request.id());
                    outputs.num_context_tokens += forwarded_tokens(request);
                }
                Stage::Decode => {
                    outputs.decode.push(request.id());
                    outputs.num_decode_tokens += 1;
                }
                Stage::Waiting | Stage::Finished => {}
            }
        }
    }

    /// Requests of `outputs` in batch order.
    pub fn batch(&self, outputs: &SchedulerOutputs) -> ScheduledBatch<'_> {
        let find = |id: &RequestId| self.running.iter().find(|r| r.id() == *id);
        ScheduledBatch {
            context_decode: outputs.context_decode.iter().filter_map(find).collect(),
            decode: outputs.decode.iter().filter_map(find).collect(),
        }
    }

    /// Record the token sampled for a running request.
    ///
    /// Publishes prefix blocks after the context step, advances the stage and
    /// either finishes the request or wakes its step waiter. Returns the
    /// finish reason when the request completed.
    pub fn complete_step(
        &mut self,
        id: RequestId,
        sample: &SampleOutput,
    ) -> Result<Option<FinishReason>> {
        let index = self
            .running
            .iter()
            .position(|r| r.id() == id)
            .ok_or(Error::RequestNotFound(id))?;

        let request = &mut self.running[index];
        let was_context = request.stage() == Stage::ContextDecode;
        request.append_token(sample.token_id);
        if was_context && self.enable_prefix_caching {
            request.register_prefix_blocks()?;
        }
        request.reset_stage();

        let reason = if sample.is_eos {
            Some(FinishReason::EndOfSequence)
        } else if request.num_generated() >= request.sampling_config().max_new_tokens {
            Some(FinishReason::MaxTokens)
        } else {
            None
        };

        match reason {
            Some(reason) => {
                let mut request = self.running.remove(index);
                request.finish(reason)?;
            }
            None => request.notify_step(),
        }
        Ok(reason)
    }

    /// Finish every tracked request as cancelled. Returns how many there were.
    pub fn abort_all(&mut self) -> Result<usize> {
        let mut requests = self.waiting.drain();
        requests.extend(self.running.drain(..));
        requests.extend(self.swapped.drain(..));
        let count = requests.len();
        for mut request in requests {
            request.finish(FinishReason::Cancelled)?;
        }
        if count > 0 {
            info!(count, "aborted requests");
        }
        Ok(count)
    }

    // ========== Getters ==========

    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    pub fn num_swapped(&self) -> usize {
        self.swapped.len()
    }

    pub fn running(&self) -> &[Request] {
        &self.running
    }

    pub fn swapped(&self) -> impl Iterator<Item = &Request> {
        self.swapped.iter()
    }

    /// A running or swapped request.
    pub fn request(&self, id: RequestId) -> Option<&Request> {
        self.running
            .iter()
            .chain(self.swapped.iter())
            .find(|r| r.id() == id)
    }

    pub fn has_unfinished_requests(&self) -> bool {
        !self.waiting.is_empty() || !self.running.is_empty() || !self.swapped.is_empty()
    }

    pub fn waiting_queue(&self) -> &Arc<WaitingQueue> {
        &self.waiting
    }

    pub fn block_manager(&self) -> &Arc<BlockManager> {
        &self.block_manager
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }
}

/// Tokens a request forwards in its next step.
fn forwarded_tokens(request: &Request) -> usize {
    if request.stage().is_prompt_step() {
        request.input_tokens().len()
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, SamplingConfig};

    fn scheduler(blocks: usize, config: SchedulerConfig) -> Scheduler {
        let cache = CacheConfig {
            block_size: 4,
            num_device_blocks: blocks,
            num_host_blocks: blocks,
            num_layers: 1,
            num_kv_heads: 1,
            head_dim: 2,
            ..CacheConfig::default()
        };
        let manager = Arc::new(BlockManager::new(&cache, 1).unwrap());
        Scheduler::new(config, false, manager, Arc::new(WaitingQueue::new()))
    }

    fn push(s: &Scheduler, id: RequestId, prompt_len: usize) {
        let request = Request::new(
            id,
            (0..prompt_len as u32).collect(),
            SamplingConfig::default(),
            Arc::clone(s.block_manager()),
        );
        s.waiting_queue().push(request);
    }

    #[test]
    fn test_empty_schedule() {
        let mut s = scheduler(4, SchedulerConfig::default());
        let outputs = s.schedule().unwrap();
        assert!(outputs.is_empty());
        assert!(!s.has_unfinished_requests());
    }

    #[test]
    fn test_step_token_budget_stops_admission() {
        let config = SchedulerConfig {
            max_step_tokens: 10,
            ..SchedulerConfig::default()
        };
        let mut s = scheduler(16, config);
        push(&s, 1, 8);
        push(&s, 2, 8);

        let outputs = s.schedule().unwrap();
        assert_eq!(outputs.context_decode, vec![1]);
        assert_eq!(s.num_waiting(), 1);
    }

    #[test]
    fn test_batch_size_limit() {
        let config = SchedulerConfig {
            max_batch_size: 1,
            ..SchedulerConfig::default()
        };
        let mut s = scheduler(16, config);
        push(&s, 1, 2);
        push(&s, 2, 2);
        let outputs = s.schedule().unwrap();
        assert_eq!(outputs.num_requests(), 1);
        assert_eq!(s.num_waiting(), 1);
    }

    #[test]
    fn test_complete_step_unknown_request() {
        let mut s = scheduler(4, SchedulerConfig::default());
        let sample = SampleOutput {
            token_id: 1,
            is_eos: false,
        };
        assert!(matches!(
            s.complete_step(42, &sample),
            Err(Error::RequestNotFound(42))
        ));
    }
}
