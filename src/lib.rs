//! nano-serve: the execution core of a continuous-batching LLM server.
//!
//! This crate implements the parts of an inference server that sit between
//! the network front end and the numerical kernels:
//! - Paged KV cache blocks with per-device pools, host swap space and prefix caching
//! - Request lifecycle with block accounting and completion / streaming waiters
//! - Iteration-level scheduling with swap-based preemption
//! - Batch input construction (CSR token layout, slot mappings, rotary positions)
//! - An orchestration loop running on its own thread

pub mod config;
pub mod error;

pub mod core;
pub mod engine;
pub mod scheduler;

pub use config::{
    AdmissionOrder, CacheConfig, DataType, EngineConfig, ParallelConfig, PreemptionPolicy,
    SamplingConfig, SchedulerConfig,
};
pub use core::{BlockManager, FinishReason, Request, RequestId, Stage};
pub use engine::{
    Engine, EngineHandle, GenerationOutput, GenerationRequest, LogitsSampler, ModelContext,
    RequestHandle, Runtime, StaticWeights, Submitter, SyntheticRuntime, TokenSampler,
};
pub use error::{Error, Result};
pub use scheduler::{BatchInput, BatchInputBuilder, Scheduler, SchedulerOutputs};
