//! Error types for nano-serve.

use thiserror::Error;

use crate::core::block::{BlockLocation, DeviceId};
use crate::core::request::RequestId;

/// Result type alias for nano-serve operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nano-serve.
#[derive(Error, Debug)]
pub enum Error {
    /// Not enough free blocks for an allocation or swap.
    ///
    /// Expected under memory pressure; the scheduler recovers from it by
    /// preempting or leaving the request waiting.
    #[error("out of KV cache blocks on {location}: requested {requested}, available {available}")]
    ResourceExhausted {
        location: BlockLocation,
        requested: usize,
        available: usize,
    },

    /// Malformed request or call arguments.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Accelerator or runtime failure during a kernel or copy.
    #[error("device {device} failed: {message}")]
    DeviceFailure { device: DeviceId, message: String },

    /// Request not tracked by the scheduler.
    #[error("request {0} not found")]
    RequestNotFound(RequestId),

    /// Invalid request stage transition.
    #[error("invalid stage transition: {from} -> {to}")]
    InvalidStageTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The engine has been stopped.
    #[error("engine stopped")]
    Stopped,
}

impl Error {
    /// Whether this error is recoverable memory pressure.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. })
    }

    /// Whether the process state is untrustworthy after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceFailure { .. })
    }

    pub(crate) fn device_failure(device: DeviceId, message: impl Into<String>) -> Self {
        Self::DeviceFailure {
            device,
            message: message.into(),
        }
    }
}
