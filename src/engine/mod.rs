//! Execution engine.
//!
//! This module contains:
//! - Engine, the orchestration loop driving scheduler, runtime and sampler
//! - ModelContext for shared model state
//! - The Runtime seam for forward passes
//! - TokenSampler and the stock LogitsSampler

pub mod context;
pub mod llm;
pub mod runtime;
pub mod sampler;

pub use context::{ModelContext, StaticWeights, WeightProvider};
pub use llm::{
    Engine, EngineHandle, GenerationOutput, GenerationRequest, RequestHandle, StepOutcome,
    Submitter,
};
pub use runtime::{ForwardOutput, Runtime, SyntheticRuntime};
pub use sampler::{LogitsSampler, SampleOutput, TokenSampler};
