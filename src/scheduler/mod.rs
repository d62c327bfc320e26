//! Batch scheduling for continuous batching.
//!
//! This module handles:
//! - The shared waiting queue
//! - Admission ordering and preemption policies
//! - Iteration-level scheduling with swap-based preemption
//! - Building forward-pass inputs from a scheduled batch

pub mod batch;
pub mod input;
pub mod policy;
pub mod queue;

pub use batch::{ScheduledBatch, Scheduler, SchedulerOutputs};
pub use input::{BatchInput, BatchInputBuilder, BatchTensors, DeviceBlockTable, LayerSlotMapping, SlotRef};
pub use policy::{AdmissionOrder, PreemptionPolicy};
pub use queue::WaitingQueue;
