//! Orchestration loop and client API.
//!
//! The [`Engine`] owns the scheduler, the runtime and the sampler. It is
//! driven either by calling [`Engine::step`] directly or by moving it onto a
//! dedicated thread with [`Engine::start`]. Clients submit work through a
//! [`Submitter`] and follow it through a [`RequestHandle`].
//!
//! ## Engine Flow
//!
//! ```text
//!   client threads                       engine thread
//!   ──────────────                       ─────────────
//!   Submitter::enqueue ──► WaitingQueue ──► Scheduler::schedule
//!        │                                      │
//!        ▼                                      ▼
//!   RequestHandle                        BatchInputBuilder::build
//!     wait()        ◄── notify ──┐              │
//!     next_step()   ◄── notify_step ─┐          ▼
//!                                │   │   Runtime::forward (context, decode)
//!                                │   │          │
//!                                │   │          ▼
//!                                │   │   TokenSampler::sample
//!                                │   │          │
//!                                └───┴── Scheduler::complete_step
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use candle_core::IndexOp;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, SamplingConfig};
use crate::core::block::compute_num_blocks;
use crate::core::block_manager::BlockManager;
use crate::core::request::{FinishReason, Priority, Request, RequestId, RequestState, Stage, DEFAULT_PRIORITY};
use crate::core::stream::StreamKind;
use crate::core::waiter::Waiter;
use crate::engine::context::ModelContext;
use crate::engine::runtime::Runtime;
use crate::engine::sampler::{SampleOutput, TokenSampler};
use crate::error::{Error, Result};
use crate::scheduler::input::{BatchInput, BatchInputBuilder};
use crate::scheduler::queue::WaitingQueue;
use crate::scheduler::{Scheduler, SchedulerOutputs};

/// Request for generation.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Unique request ID (auto-assigned if None).
    pub request_id: Option<RequestId>,
    /// Prompt token IDs.
    pub input_tokens: Vec<u32>,
    /// Sampling configuration for this request.
    pub sampling_config: SamplingConfig,
    /// Priority (higher = more important).
    pub priority: Priority,
}

impl GenerationRequest {
    /// Create a new generation request with default settings.
    pub fn new(input_tokens: Vec<u32>) -> Self {
        Self {
            request_id: None,
            input_tokens,
            sampling_config: SamplingConfig::default(),
            priority: DEFAULT_PRIORITY,
        }
    }

    pub fn request_id(mut self, id: RequestId) -> Self {
        self.request_id = Some(id);
        self
    }

    /// Set the maximum tokens to generate.
    pub fn max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.sampling_config.max_new_tokens = max_new_tokens;
        self
    }

    /// Set the temperature for sampling.
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.sampling_config.temperature = temperature;
        self
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.sampling_config.top_k = top_k;
        self
    }

    pub fn top_p(mut self, top_p: f32) -> Self {
        self.sampling_config.top_p = top_p;
        self
    }

    pub fn stop_token_ids(mut self, stop_token_ids: Vec<u32>) -> Self {
        self.sampling_config.stop_token_ids = stop_token_ids;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.sampling_config.seed = Some(seed);
        self
    }

    /// Set request priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Final result of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutput {
    pub request_id: RequestId,
    /// Generated token IDs, prompt excluded.
    pub output_tokens: Vec<u32>,
    pub finish_reason: FinishReason,
}

/// Client-side view of one submitted request.
///
/// The completion waiter and the step waiter are independent: [`wait`]
/// returns only at completion, [`next_step`] returns as soon as new tokens
/// exist.
///
/// [`wait`]: RequestHandle::wait
/// [`next_step`]: RequestHandle::next_step
#[derive(Debug)]
pub struct RequestHandle {
    id: RequestId,
    state: Arc<RequestState>,
    waiter: Arc<Waiter>,
    step_waiter: Arc<Waiter>,
    /// Generated tokens already returned by `next_step`.
    read: usize,
}

impl RequestHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.state.finish_reason()
    }

    /// Tokens generated so far.
    pub fn output_tokens(&self) -> Vec<u32> {
        self.state.generated_tokens()
    }

    fn output(&self) -> Option<GenerationOutput> {
        let finish_reason = self.state.finish_reason()?;
        Some(GenerationOutput {
            request_id: self.id,
            output_tokens: self.state.generated_tokens(),
            finish_reason,
        })
    }

    /// Block until the request finishes.
    pub fn wait(&self) -> GenerationOutput {
        loop {
            let seen = self.waiter.generation();
            if let Some(output) = self.output() {
                return output;
            }
            self.waiter.wait_for(seen);
        }
    }

    /// Block until the request finishes or `timeout` passes.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<GenerationOutput> {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = self.waiter.generation();
            if let Some(output) = self.output() {
                return Some(output);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            self.waiter.wait_timeout(seen, remaining)?;
        }
    }

    /// Tokens generated since the last call.
    ///
    /// Blocks until at least one new token exists or the request finishes
    /// (returning an empty vector). Returns `None` on timeout.
    pub fn next_step(&mut self, timeout: Duration) -> Option<Vec<u32>> {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = self.step_waiter.generation();
            let tokens = self.state.tokens_since(self.read);
            if !tokens.is_empty() {
                self.read += tokens.len();
                return Some(tokens);
            }
            if self.state.is_finished() {
                return Some(Vec::new());
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            self.step_waiter.wait_timeout(seen, remaining)?;
        }
    }
}

/// State shared between the engine and its submitters.
#[derive(Debug)]
struct Shared {
    config: EngineConfig,
    block_manager: Arc<BlockManager>,
    waiting: Arc<WaitingQueue>,
    /// Live requests by id, for duplicate detection and cancellation.
    /// Held across the stopped check and the queue push of an enqueue.
    states: Mutex<HashMap<RequestId, Arc<RequestState>>>,
    /// Waiting requests cancelled by clients after sampling had started.
    cancelled_waiting: Mutex<Vec<RequestId>>,
    next_id: AtomicU64,
    stopped: AtomicBool,
}

impl Shared {
    fn prune_finished(&self) {
        self.states.lock().retain(|_, state| !state.is_finished());
    }
}

/// Cloneable client handle for submitting and cancelling requests.
#[derive(Debug, Clone)]
pub struct Submitter {
    shared: Arc<Shared>,
}

impl Submitter {
    /// Validate and queue a request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an empty prompt, invalid
    /// sampling values, a request that could never fit in the device pool
    /// or the step-token budget, or an id already in use, and
    /// [`Error::Stopped`] after shutdown.
    pub fn enqueue(&self, request: GenerationRequest) -> Result<RequestHandle> {
        let shared = &self.shared;
        if shared.stopped.load(Ordering::Acquire) {
            return Err(Error::Stopped);
        }
        self.validate(&request)?;

        let mut states = shared.states.lock();
        // Shutdown flips `stopped` under this lock before draining the queue.
        if shared.stopped.load(Ordering::Acquire) {
            return Err(Error::Stopped);
        }
        let id = match request.request_id {
            Some(id) if states.contains_key(&id) => {
                return Err(Error::InvalidArgument(format!("request id {id} is already in use")));
            }
            Some(id) => id,
            None => loop {
                let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
                if !states.contains_key(&id) {
                    break id;
                }
            },
        };

        let state = Arc::new(RequestState::new());
        let waiter = Arc::new(Waiter::new());
        let step_waiter = Arc::new(Waiter::new());
        let prompt_len = request.input_tokens.len();
        let queued = Request::new(
            id,
            request.input_tokens,
            request.sampling_config,
            Arc::clone(&shared.block_manager),
        )
        .with_priority(request.priority)
        .with_state(Arc::clone(&state))
        .with_waiter(Arc::clone(&waiter))
        .with_step_waiter(Arc::clone(&step_waiter));

        states.insert(id, Arc::clone(&state));
        shared.waiting.push(queued);
        drop(states);
        debug!(request_id = id, prompt_tokens = prompt_len, priority = request.priority, "request enqueued");

        Ok(RequestHandle {
            id,
            state,
            waiter,
            step_waiter,
            read: 0,
        })
    }

    fn validate(&self, request: &GenerationRequest) -> Result<()> {
        let config = &self.shared.config;
        if request.input_tokens.is_empty() {
            return Err(Error::InvalidArgument("input tokens are empty".into()));
        }
        request.sampling_config.validate()?;

        let prompt_len = request.input_tokens.len();
        if prompt_len > config.scheduler.max_step_tokens {
            return Err(Error::InvalidArgument(format!(
                "prompt of {prompt_len} tokens exceeds the step budget of {}",
                config.scheduler.max_step_tokens
            )));
        }
        let max_tokens = prompt_len + request.sampling_config.max_new_tokens;
        let max_blocks = compute_num_blocks(max_tokens, config.cache.block_size);
        if max_blocks > config.cache.num_device_blocks {
            return Err(Error::InvalidArgument(format!(
                "request needs up to {max_blocks} blocks but the device pool holds {}",
                config.cache.num_device_blocks
            )));
        }
        Ok(())
    }

    /// Cancel a request.
    ///
    /// A waiting request is removed and finished immediately; a running or
    /// swapped one is flagged and finished by the next iteration.
    pub fn cancel(&self, id: RequestId) -> Result<()> {
        let shared = &self.shared;
        if let Some(mut request) = shared.waiting.remove(id) {
            shared.states.lock().remove(&id);
            if request.num_generated() > 0 {
                shared.cancelled_waiting.lock().push(id);
            }
            request.finish(FinishReason::Cancelled)?;
            debug!(request_id = id, "cancelled waiting request");
            return Ok(());
        }
        let state = shared
            .states
            .lock()
            .get(&id)
            .cloned()
            .ok_or(Error::RequestNotFound(id))?;
        if state.is_finished() {
            return Ok(());
        }
        state.cancel();
        shared.waiting.wake();
        debug!(request_id = id, "flagged request for cancellation");
        Ok(())
    }

    /// Requests accepted and not yet finished.
    pub fn num_live_requests(&self) -> usize {
        self.shared
            .states
            .lock()
            .values()
            .filter(|s| !s.is_finished())
            .count()
    }
}

/// What one iteration did.
#[derive(Debug, Default, Clone)]
pub struct StepOutcome {
    pub scheduled: SchedulerOutputs,
    /// Requests that finished while completing this step.
    pub finished: Vec<(RequestId, FinishReason)>,
}

impl StepOutcome {
    /// Whether the iteration did nothing at all.
    pub fn is_idle(&self) -> bool {
        let s = &self.scheduled;
        s.is_empty()
            && s.admitted.is_empty()
            && s.preempted.is_empty()
            && s.recomputed.is_empty()
            && s.swapped_in.is_empty()
            && s.cancelled.is_empty()
    }
}

type FatalHandler = Arc<dyn Fn(&Error) + Send + Sync>;

/// Execution core: scheduler, runtime and sampler driven one iteration at a time.
pub struct Engine {
    shared: Arc<Shared>,
    context: ModelContext,
    scheduler: Scheduler,
    builder: BatchInputBuilder,
    runtime: Box<dyn Runtime>,
    sampler: Box<dyn TokenSampler>,
    fatal_handler: FatalHandler,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("context", &self.context)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine and its block pools.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid config or one that disagrees
    /// with the model context about layers or data type.
    pub fn new(
        config: EngineConfig,
        context: ModelContext,
        runtime: impl Runtime + 'static,
        sampler: impl TokenSampler + 'static,
    ) -> Result<Self> {
        config.validate()?;
        if context.num_layers() != config.cache.num_layers {
            return Err(Error::Config(format!(
                "cache holds {} layers but the model context runs {}",
                config.cache.num_layers,
                context.num_layers()
            )));
        }
        if context.data_type() != config.cache.data_type {
            return Err(Error::Config(format!(
                "cache data type {:?} differs from model data type {:?}",
                config.cache.data_type,
                context.data_type()
            )));
        }

        let block_manager = Arc::new(BlockManager::from_config(&config)?);
        let waiting = Arc::new(WaitingQueue::new());
        let scheduler = Scheduler::new(
            config.scheduler.clone(),
            config.cache.enable_prefix_caching,
            Arc::clone(&block_manager),
            Arc::clone(&waiting),
        );
        let builder = BatchInputBuilder::new(
            config.cache.block_size,
            config.num_devices(),
            context.layer_range(),
            config.cudagraph_batch_sizes.clone(),
        )
        .with_prefix_cache(config.cache.enable_prefix_caching);

        info!(
            devices = config.num_devices(),
            device_blocks = config.cache.num_device_blocks,
            block_size = config.cache.block_size,
            max_batch_size = config.scheduler.max_batch_size,
            "engine created"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                block_manager,
                waiting,
                states: Mutex::new(HashMap::new()),
                cancelled_waiting: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                stopped: AtomicBool::new(false),
            }),
            context,
            scheduler,
            builder,
            runtime: Box::new(runtime),
            sampler: Box::new(sampler),
            fatal_handler: Arc::new(|_| std::process::abort()),
        })
    }

    /// Replace what happens on a device failure (default: abort the process).
    pub fn with_fatal_handler(mut self, handler: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.fatal_handler = Arc::new(handler);
        self
    }

    pub fn submitter(&self) -> Submitter {
        Submitter {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn block_manager(&self) -> &Arc<BlockManager> {
        &self.shared.block_manager
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn context(&self) -> &ModelContext {
        &self.context
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn has_unfinished_requests(&self) -> bool {
        self.scheduler.has_unfinished_requests()
    }

    /// Run one iteration: schedule, forward, sample, publish.
    pub fn step(&mut self) -> Result<StepOutcome> {
        let scheduled = self.scheduler.schedule()?;
        let released = std::mem::take(&mut *self.shared.cancelled_waiting.lock());
        for id in scheduled.cancelled.iter().chain(&released) {
            self.sampler.release(*id);
        }
        if scheduled.is_empty() {
            self.shared.prune_finished();
            return Ok(StepOutcome {
                scheduled,
                finished: Vec::new(),
            });
        }

        let (input, rows) = {
            let batch = self.scheduler.batch(&scheduled);
            let input = self.builder.build(&batch.context_decode, &batch.decode)?;
            let rows: Vec<(RequestId, SamplingConfig)> = batch
                .context_decode
                .iter()
                .chain(&batch.decode)
                .map(|r| (r.id(), r.sampling_config().clone()))
                .collect();
            (input, rows)
        };

        // Swapped-in blocks must be resident before any kernel reads them.
        self.shared
            .block_manager
            .synchronize_all(StreamKind::HostToDevice)?;

        let mut samples = Vec::with_capacity(rows.len());
        let (context_rows, decode_rows) = rows.split_at(input.num_context_requests);
        for (stage, stage_rows) in [
            (Stage::ContextDecode, context_rows),
            (Stage::Decode, decode_rows),
        ] {
            if stage_rows.is_empty() {
                continue;
            }
            samples.extend(self.forward_and_sample(stage, &input, stage_rows)?);
        }

        let mut finished = Vec::new();
        for (id, sample) in samples {
            if let Some(reason) = self.scheduler.complete_step(id, &sample)? {
                self.sampler.release(id);
                finished.push((id, reason));
            }
        }
        self.shared.prune_finished();

        debug!(
            requests = scheduled.num_requests(),
            tokens = scheduled.num_tokens(),
            finished = finished.len(),
            "step complete"
        );
        Ok(StepOutcome {
            scheduled,
            finished,
        })
    }

    fn forward_and_sample(
        &mut self,
        stage: Stage,
        input: &BatchInput,
        rows: &[(RequestId, SamplingConfig)],
    ) -> Result<Vec<(RequestId, SampleOutput)>> {
        let output = self
            .runtime
            .forward(stage, input, &self.shared.block_manager)?;
        let num_rows = output.logits.dim(0)?;
        if num_rows != rows.len() {
            return Err(Error::InvalidArgument(format!(
                "runtime returned {num_rows} logits rows for {} {} requests",
                rows.len(),
                stage.as_str()
            )));
        }
        rows.iter()
            .enumerate()
            .map(|(i, (id, config))| {
                let logits = output.logits.i(i)?;
                let sample = self.sampler.sample(*id, &logits, config)?;
                Ok((*id, sample))
            })
            .collect()
    }

    /// Step until no iteration makes progress.
    ///
    /// Returns every request that finished along the way.
    pub fn run_until_idle(&mut self) -> Result<Vec<(RequestId, FinishReason)>> {
        let mut finished = Vec::new();
        loop {
            let outcome = self.step()?;
            finished.extend(outcome.finished.iter().copied());
            if outcome.is_idle() {
                return Ok(finished);
            }
        }
    }

    /// Move the engine onto its own scheduling thread.
    pub fn start(self) -> Result<EngineHandle> {
        let shared = Arc::clone(&self.shared);
        let thread = thread::Builder::new()
            .name("nano-serve-engine".into())
            .spawn(move || self.run_loop())?;
        info!("engine thread started");
        Ok(EngineHandle {
            submitter: Submitter {
                shared: Arc::clone(&shared),
            },
            shared,
            thread: Some(thread),
        })
    }

    fn run_loop(mut self) {
        let idle = Duration::from_millis(self.shared.config.idle_wait_ms);
        while !self.shared.stopped.load(Ordering::Acquire) {
            match self.step() {
                Ok(outcome) if outcome.is_idle() => {
                    if self.scheduler.num_waiting() == 0 {
                        self.shared.waiting.wait_for_work(idle);
                    } else {
                        thread::sleep(idle);
                    }
                }
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "device failure, engine cannot continue");
                    (self.fatal_handler)(&e);
                    break;
                }
                Err(e) => {
                    error!(error = %e, "iteration failed");
                    thread::sleep(idle);
                }
            }
        }

        {
            let _admission = self.shared.states.lock();
            self.shared.stopped.store(true, Ordering::Release);
        }
        match self.scheduler.abort_all() {
            Ok(count) if count > 0 => warn!(count, "cancelled unfinished requests on shutdown"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "failed to cancel requests on shutdown"),
        }
        self.shared.prune_finished();
        info!("engine thread stopped");
    }
}

/// Handle to an engine running on its own thread.
#[derive(Debug)]
pub struct EngineHandle {
    submitter: Submitter,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn submitter(&self) -> Submitter {
        self.submitter.clone()
    }

    pub fn enqueue(&self, request: GenerationRequest) -> Result<RequestHandle> {
        self.submitter.enqueue(request)
    }

    pub fn cancel(&self, id: RequestId) -> Result<()> {
        self.submitter.cancel(id)
    }

    /// Whether the scheduling thread is still looping.
    pub fn is_running(&self) -> bool {
        !self.shared.stopped.load(Ordering::Acquire)
    }

    /// Stop the scheduling thread and wait for it.
    ///
    /// Requests still in flight finish as cancelled.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.waiting.wake();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("engine thread panicked");
            }
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
