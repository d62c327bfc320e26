//! Request lifecycle.
//!
//! A [`Request`] is one generation job as the scheduler sees it: its tokens,
//! its stage, and the KV blocks it owns on every device.
//!
//! ## Stages
//!
//! ```text
//!   Waiting ──admit──► ContextDecode ──first token──► Decode ──► Finished
//!                           │                           │
//!                           └───── swap out / in ───────┘  (stage kept)
//! ```
//!
//! ## Block demand
//!
//! `output_tokens` starts as a copy of the prompt and grows by one token per
//! step. With `cap` tokens per block:
//!
//! ```text
//!   step_token_count  = 1 + prompt_len    (prompt step)   | 1 (decode)
//!   total_token_count = len(output_tokens) + 1
//!   total_block_count = ceil(total / cap)
//!   step_block_count  = total_block_count - ceil((total - step) / cap)
//! ```
//!
//! The `total - step` term saturates at zero, so an inconsistent request asks
//! for its whole footprint rather than wrapping around.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::SamplingConfig;
use crate::core::block::{compute_num_blocks, hash_full_blocks, BlockTable};
use crate::core::block_manager::BlockManager;
use crate::core::waiter::Waiter;
use crate::error::{Error, Result};

/// Unique identifier for a request.
pub type RequestId = u64;

/// Scheduling priority. Higher values mean higher priority.
pub type Priority = i32;

/// Default priority for new requests.
pub const DEFAULT_PRIORITY: Priority = 0;

/// Position of a request in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    /// Queued, holding no blocks.
    Waiting,
    /// First step: the whole prompt is forwarded.
    ContextDecode,
    /// One token per step.
    Decode,
    /// Done; blocks released.
    Finished,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::ContextDecode => "ContextDecode",
            Self::Decode => "Decode",
            Self::Finished => "Finished",
        }
    }

    /// Whether the next forward pass processes the prompt.
    pub fn is_prompt_step(&self) -> bool {
        matches!(self, Self::Waiting | Self::ContextDecode)
    }
}

/// Reason for request completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FinishReason {
    /// A stop token was sampled.
    EndOfSequence,
    /// `max_new_tokens` were generated.
    MaxTokens,
    /// Cancelled by the client or by engine shutdown.
    Cancelled,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EndOfSequence => "eos",
            Self::MaxTokens => "max_tokens",
            Self::Cancelled => "cancelled",
        }
    }
}

/// State shared between a request and the client handles observing it.
#[derive(Debug, Default)]
pub struct RequestState {
    generated: Mutex<Vec<u32>>,
    finish_reason: Mutex<Option<FinishReason>>,
    finished: AtomicBool,
    cancelled: AtomicBool,
}

impl RequestState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tokens generated so far, prompt excluded.
    pub fn generated_tokens(&self) -> Vec<u32> {
        self.generated.lock().clone()
    }

    /// Generated tokens from index `start` on.
    pub fn tokens_since(&self, start: usize) -> Vec<u32> {
        self.generated.lock().get(start..).map(<[u32]>::to_vec).unwrap_or_default()
    }

    pub fn num_generated(&self) -> usize {
        self.generated.lock().len()
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        *self.finish_reason.lock()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Ask the scheduler to stop this request at its next iteration.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn publish_token(&self, token: u32) {
        self.generated.lock().push(token);
    }

    fn publish_finish(&self, reason: FinishReason) {
        let mut slot = self.finish_reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
        self.finished.store(true, Ordering::Release);
    }
}

/// A generation request tracked by the scheduler.
///
/// Owns one [`BlockTable`] per device; all tables have the same length. While
/// `swapped` is set the tables hold host block ids.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use nano_serve::config::{CacheConfig, SamplingConfig};
/// use nano_serve::core::block_manager::BlockManager;
/// use nano_serve::core::request::{Request, Stage};
///
/// let cache = CacheConfig { block_size: 16, num_device_blocks: 8, ..CacheConfig::default() };
/// let manager = Arc::new(BlockManager::new(&cache, 1).unwrap());
///
/// let mut request = Request::new(1, (0..10).collect(), SamplingConfig::default(), manager);
/// request.enter_context_decode().unwrap();
/// assert_eq!(request.stage(), Stage::ContextDecode);
/// assert_eq!(request.total_token_count(), 11);
/// assert_eq!(request.step_block_count(), 1);
/// ```
#[derive(Debug)]
pub struct Request {
    id: RequestId,
    priority: Priority,
    /// Tokens forwarded by the context step: the prompt, plus earlier
    /// output after a recompute.
    input_tokens: Vec<u32>,
    /// Length of the client's prompt.
    prompt_len: usize,
    /// Position in the waiting queue's arrival order.
    arrival: u64,
    /// Prompt followed by generated tokens.
    output_tokens: Vec<u32>,
    sampling: SamplingConfig,
    stage: Stage,
    kv_cache_blocks: Vec<BlockTable>,
    swapped: bool,
    /// Leading prompt tokens whose KV came from the prefix cache.
    prefix_cached_tokens: usize,
    state: Arc<RequestState>,
    waiter: Option<Arc<Waiter>>,
    step_waiter: Option<Arc<Waiter>>,
    created_at: Instant,
    block_manager: Arc<BlockManager>,
}

impl Request {
    /// Create a waiting request with no waiters.
    pub fn new(
        id: RequestId,
        input_tokens: Vec<u32>,
        sampling: SamplingConfig,
        block_manager: Arc<BlockManager>,
    ) -> Self {
        let block_size = block_manager.block_token_capacity();
        let kv_cache_blocks = (0..block_manager.num_devices())
            .map(|_| BlockTable::new(block_size))
            .collect();
        Self {
            id,
            priority: DEFAULT_PRIORITY,
            output_tokens: input_tokens.clone(),
            prompt_len: input_tokens.len(),
            arrival: 0,
            input_tokens,
            sampling,
            stage: Stage::Waiting,
            kv_cache_blocks,
            swapped: false,
            prefix_cached_tokens: 0,
            state: Arc::new(RequestState::new()),
            waiter: None,
            step_waiter: None,
            created_at: Instant::now(),
            block_manager,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Waiter woken on completion.
    pub fn with_waiter(mut self, waiter: Arc<Waiter>) -> Self {
        self.waiter = Some(waiter);
        self
    }

    /// Waiter woken after every step and on completion.
    pub fn with_step_waiter(mut self, waiter: Arc<Waiter>) -> Self {
        self.step_waiter = Some(waiter);
        self
    }

    pub fn with_state(mut self, state: Arc<RequestState>) -> Self {
        self.state = state;
        self
    }

    // ========== Getters ==========

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn input_tokens(&self) -> &[u32] {
        &self.input_tokens
    }

    pub fn output_tokens(&self) -> &[u32] {
        &self.output_tokens
    }

    /// Tokens generated so far, prompt excluded.
    pub fn generated_tokens(&self) -> &[u32] {
        self.output_tokens
            .get(self.prompt_len..)
            .unwrap_or_default()
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_len
    }

    pub fn arrival(&self) -> u64 {
        self.arrival
    }

    pub(crate) fn set_arrival(&mut self, arrival: u64) {
        self.arrival = arrival;
    }

    pub fn num_generated(&self) -> usize {
        self.generated_tokens().len()
    }

    pub fn last_token(&self) -> Option<u32> {
        self.output_tokens.last().copied()
    }

    pub fn sampling_config(&self) -> &SamplingConfig {
        &self.sampling
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn is_swapped(&self) -> bool {
        self.swapped
    }

    pub fn is_finished(&self) -> bool {
        self.stage == Stage::Finished
    }

    pub fn prefix_cached_tokens(&self) -> usize {
        self.prefix_cached_tokens
    }

    /// Blocks owned on `device`, `None` for an unknown device.
    pub fn block_table(&self, device: usize) -> Option<&BlockTable> {
        self.kv_cache_blocks.get(device)
    }

    pub fn block_tables(&self) -> &[BlockTable] {
        &self.kv_cache_blocks
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn state(&self) -> &Arc<RequestState> {
        &self.state
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    // ========== Block demand ==========

    /// Tokens forwarded by the next step.
    pub fn step_token_count(&self) -> usize {
        if self.stage.is_prompt_step() {
            1 + self.input_tokens.len()
        } else {
            1
        }
    }

    /// Tokens whose KV must be resident after the next step.
    pub fn total_token_count(&self) -> usize {
        self.output_tokens.len() + 1
    }

    /// Blocks needed to hold `total_token_count` tokens.
    pub fn total_block_count(&self) -> usize {
        compute_num_blocks(self.total_token_count(), self.block_size())
    }

    /// New blocks the next step crosses into.
    pub fn step_block_count(&self) -> usize {
        let before = self
            .total_token_count()
            .saturating_sub(self.step_token_count());
        self.total_block_count() - compute_num_blocks(before, self.block_size())
    }

    /// Blocks held per device.
    pub fn current_block_count(&self) -> usize {
        self.kv_cache_blocks.first().map_or(0, BlockTable::len)
    }

    /// Blocks still to allocate on each device before the next step.
    pub fn pending_block_count(&self) -> usize {
        self.total_block_count()
            .saturating_sub(self.current_block_count())
    }

    fn block_size(&self) -> usize {
        self.block_manager.block_token_capacity()
    }

    // ========== Stage transitions ==========

    /// Waiting → ContextDecode on admission.
    pub fn enter_context_decode(&mut self) -> Result<()> {
        if self.stage != Stage::Waiting {
            return Err(Error::InvalidStageTransition {
                from: self.stage.as_str(),
                to: Stage::ContextDecode.as_str(),
            });
        }
        self.stage = Stage::ContextDecode;
        Ok(())
    }

    /// ContextDecode → Decode once output has grown past the prompt.
    pub fn reset_stage(&mut self) {
        if self.stage == Stage::ContextDecode && self.output_tokens.len() > self.input_tokens.len() {
            self.stage = Stage::Decode;
        }
    }

    /// Running → Waiting after giving up every block.
    ///
    /// Output generated so far joins the context, so the next admission
    /// recomputes its KV in one context step and keeps decoding where it
    /// stopped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStageTransition`] for a waiting or finished
    /// request.
    pub fn reset_for_recompute(&mut self) -> Result<()> {
        if !matches!(self.stage, Stage::ContextDecode | Stage::Decode) {
            return Err(Error::InvalidStageTransition {
                from: self.stage.as_str(),
                to: Stage::Waiting.as_str(),
            });
        }
        let released = self.free_blocks();
        self.input_tokens = self.output_tokens.clone();
        self.prefix_cached_tokens = 0;
        self.stage = Stage::Waiting;
        debug!(
            request_id = self.id,
            context_tokens = self.input_tokens.len(),
            "request reset for recompute"
        );
        released
    }

    /// Append a sampled token and publish it to observers.
    pub fn append_token(&mut self, token: u32) {
        self.output_tokens.push(token);
        self.state.publish_token(token);
    }

    /// Enter Finished, release every block, publish `reason` and wake both
    /// waiters.
    pub fn finish(&mut self, reason: FinishReason) -> Result<()> {
        if self.stage == Stage::Finished {
            return Ok(());
        }
        self.stage = Stage::Finished;
        let released = self.free_blocks();
        self.state.publish_finish(reason);
        self.notify();
        debug!(
            request_id = self.id,
            reason = reason.as_str(),
            generated = self.num_generated(),
            "request finished"
        );
        released
    }

    // ========== Notification ==========

    /// Wake the completion waiter and the step waiter.
    pub fn notify(&self) {
        if let Some(waiter) = &self.waiter {
            waiter.notify();
        }
        self.notify_step();
    }

    /// Wake only the step waiter.
    pub fn notify_step(&self) {
        if let Some(waiter) = &self.step_waiter {
            waiter.notify();
        }
    }

    // ========== Blocks ==========

    /// Allocate `pending_block_count` blocks on every device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] if any device is short; blocks
    /// taken on earlier devices by this call are released again.
    pub fn allocate_step_blocks(&mut self) -> Result<()> {
        if self.swapped {
            return Err(Error::InvalidArgument(format!(
                "request {} is swapped out",
                self.id
            )));
        }
        let total = self.total_block_count();
        for device in 0..self.kv_cache_blocks.len() {
            let pending = total.saturating_sub(self.kv_cache_blocks[device].len());
            if pending == 0 {
                continue;
            }
            match self.block_manager.allocate_blocks(pending, device) {
                Ok(ids) => self.kv_cache_blocks[device].extend(ids),
                Err(e) => {
                    self.rollback_allocation(device, total);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Undo this call's growth on devices before `failed`.
    fn rollback_allocation(&mut self, failed: usize, total: usize) {
        let target = total.min(self.kv_cache_blocks[failed].len());
        for device in 0..failed {
            let extra = self.kv_cache_blocks[device].len().saturating_sub(target);
            let ids = self.kv_cache_blocks[device].truncate_tail(extra);
            if let Err(e) = self.block_manager.free_blocks(&ids, device) {
                warn!(request_id = self.id, device, error = %e, "rollback free failed");
            }
        }
    }

    /// Release every block on every device.
    ///
    /// Device blocks are freed; host blocks of a swapped request are dropped.
    /// Calling this on a request holding nothing is a no-op.
    pub fn free_blocks(&mut self) -> Result<()> {
        let mut first_error = None;
        for device in 0..self.kv_cache_blocks.len() {
            let ids = self.kv_cache_blocks[device].take();
            let released = if self.swapped {
                self.block_manager.swap_drop(&ids, device)
            } else {
                self.block_manager.free_blocks(&ids, device)
            };
            if let Err(e) = released {
                first_error.get_or_insert(e);
            }
        }
        self.swapped = false;
        first_error.map_or(Ok(()), Err)
    }

    /// Move every device's blocks to host memory.
    ///
    /// No-op when already swapped. A failure on device k swaps devices < k
    /// back in, leaving the request device-resident.
    pub fn swap_out_async(&mut self) -> Result<()> {
        if self.swapped {
            return Ok(());
        }
        for device in 0..self.kv_cache_blocks.len() {
            match self
                .block_manager
                .swap_out(self.kv_cache_blocks[device].ids(), device)
            {
                Ok(host_ids) => self.kv_cache_blocks[device].replace(host_ids),
                Err(e) => {
                    for done in 0..device {
                        match self
                            .block_manager
                            .swap_in(self.kv_cache_blocks[done].ids(), done)
                        {
                            Ok(ids) => self.kv_cache_blocks[done].replace(ids),
                            Err(re) => {
                                warn!(request_id = self.id, device = done, error = %re, "swap-out rollback failed")
                            }
                        }
                    }
                    return Err(e);
                }
            }
        }
        self.swapped = true;
        debug!(request_id = self.id, blocks = self.current_block_count(), "request swapped out");
        Ok(())
    }

    /// Move every device's blocks back from host memory.
    ///
    /// No-op when not swapped. A failure on device k swaps devices < k out
    /// again, leaving the request host-resident.
    pub fn swap_in_async(&mut self) -> Result<()> {
        if !self.swapped {
            return Ok(());
        }
        for device in 0..self.kv_cache_blocks.len() {
            match self
                .block_manager
                .swap_in(self.kv_cache_blocks[device].ids(), device)
            {
                Ok(ids) => self.kv_cache_blocks[device].replace(ids),
                Err(e) => {
                    for done in 0..device {
                        match self
                            .block_manager
                            .swap_out(self.kv_cache_blocks[done].ids(), done)
                        {
                            Ok(host_ids) => self.kv_cache_blocks[done].replace(host_ids),
                            Err(re) => {
                                warn!(request_id = self.id, device = done, error = %re, "swap-in rollback failed")
                            }
                        }
                    }
                    return Err(e);
                }
            }
        }
        self.swapped = false;
        debug!(request_id = self.id, blocks = self.current_block_count(), "request swapped in");
        Ok(())
    }

    /// Discard the host copies of a swapped request.
    pub fn drop_swapped_async(&mut self) -> Result<()> {
        if !self.swapped {
            return Ok(());
        }
        self.free_blocks()
    }

    // ========== Prefix caching ==========

    /// Share cached blocks for the leading full blocks of the prompt.
    ///
    /// At least the last prompt token is always left to compute. A block is
    /// reused only if every device has it cached. Returns the number of
    /// prompt tokens covered.
    pub fn reuse_cached_prefix(&mut self) -> Result<usize> {
        if self.current_block_count() > 0 || self.input_tokens.is_empty() {
            return Ok(0);
        }
        let block_size = self.block_size();
        let cacheable = &self.input_tokens[..self.input_tokens.len() - 1];
        let hashes = hash_full_blocks(cacheable, block_size);

        'blocks: for hash in hashes {
            let mut hits = Vec::with_capacity(self.kv_cache_blocks.len());
            for device in 0..self.kv_cache_blocks.len() {
                match self.block_manager.lookup_prefix(hash, device)? {
                    Some(id) => hits.push(id),
                    None => {
                        for (d, id) in hits.into_iter().enumerate() {
                            self.block_manager.free_blocks(&[id], d)?;
                        }
                        break 'blocks;
                    }
                }
            }
            for (device, id) in hits.into_iter().enumerate() {
                self.kv_cache_blocks[device].push(id);
            }
        }

        self.prefix_cached_tokens = self.current_block_count() * block_size;
        if self.prefix_cached_tokens > 0 {
            debug!(request_id = self.id, tokens = self.prefix_cached_tokens, "reused cached prefix");
        }
        Ok(self.prefix_cached_tokens)
    }

    /// Give back blocks taken by [`reuse_cached_prefix`](Self::reuse_cached_prefix).
    pub fn release_cached_prefix(&mut self) -> Result<()> {
        self.prefix_cached_tokens = 0;
        self.free_blocks()
    }

    /// Publish the prompt's full blocks to the prefix cache.
    pub fn register_prefix_blocks(&self) -> Result<()> {
        if self.swapped {
            return Ok(());
        }
        let hashes = hash_full_blocks(&self.input_tokens, self.block_size());
        for (device, table) in self.kv_cache_blocks.iter().enumerate() {
            for (&id, &hash) in table.ids().iter().zip(&hashes) {
                self.block_manager.register_prefix(id, hash, device)?;
            }
        }
        Ok(())
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if self.kv_cache_blocks.iter().all(BlockTable::is_empty) {
            return;
        }
        if let Err(e) = self.free_blocks() {
            warn!(request_id = self.id, error = %e, "failed to release blocks on drop");
        }
    }
}
