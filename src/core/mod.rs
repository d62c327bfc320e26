//! Core infrastructure for nano-serve.
//!
//! This module contains the fundamental building blocks:
//! - Block, BlockTable and composite block keys
//! - BlockManager for per-device allocation, swapping and prefix caching
//! - BlockStorage holding block contents as tensors
//! - Streams for ordered asynchronous device work
//! - Request and Waiter for the request lifecycle

pub mod block;
pub mod block_manager;
pub mod kv_cache;
pub mod request;
pub mod stream;
pub mod waiter;

pub use block::{BlockId, BlockKey, BlockLocation, BlockTable, DeviceId};
pub use block_manager::BlockManager;
pub use request::{FinishReason, Priority, Request, RequestId, RequestState, Stage};
pub use stream::{Stream, StreamKind};
pub use waiter::Waiter;
