//! Error taxonomy for pool operations
//!
//! Every lookup, acquire and channel operation returns either a usable value or a
//! [`PoolError`]. The host pipeline maps the stable [`ErrorCode`] to its own
//! response codes.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Stable error codes surfaced to the host pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Script, wrapper or class could not be resolved
    NotFound,
    /// Class or global process limits forbid another worker
    PoolExhausted,
    /// The worker channel was not established in time
    ConnectTimeout,
    /// No progress on an established channel in time
    CommTimeout,
    /// The worker could not be launched (or spawning is backed off)
    SpawnError,
    /// Request body exceeds the configured admission limit
    RequestTooLarge,
    /// Internal failure (I/O or registry storage)
    InternalError,
}

impl ErrorCode {
    /// Get the error code as a string for log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::PoolExhausted => "POOL_EXHAUSTED",
            ErrorCode::ConnectTimeout => "CONNECT_TIMEOUT",
            ErrorCode::CommTimeout => "COMM_TIMEOUT",
            ErrorCode::SpawnError => "SPAWN_ERROR",
            ErrorCode::RequestTooLarge => "REQUEST_TOO_LARGE",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Errors returned by the pool manager
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("process pool exhausted for class {class}")]
    PoolExhausted { class: String },

    #[error("worker connect timed out after {}ms", .0.as_millis())]
    ConnectTimeout(Duration),

    #[error("worker communication timed out after {}ms", .0.as_millis())]
    CommTimeout(Duration),

    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("request body of {len} bytes exceeds limit of {limit} bytes")]
    RequestTooLarge { len: u64, limit: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry store error: {0}")]
    Store(String),
}

impl PoolError {
    /// Map this error to its stable code
    pub fn code(&self) -> ErrorCode {
        match self {
            PoolError::NotFound(_) => ErrorCode::NotFound,
            PoolError::PoolExhausted { .. } => ErrorCode::PoolExhausted,
            PoolError::ConnectTimeout(_) => ErrorCode::ConnectTimeout,
            PoolError::CommTimeout(_) => ErrorCode::CommTimeout,
            PoolError::Spawn(_) => ErrorCode::SpawnError,
            PoolError::RequestTooLarge { .. } => ErrorCode::RequestTooLarge,
            PoolError::Io(_) | PoolError::Store(_) => ErrorCode::InternalError,
        }
    }

    /// Whether the worker involved should be retired rather than reused
    pub fn is_transport(&self) -> bool {
        matches!(self, PoolError::ConnectTimeout(_) | PoolError::CommTimeout(_))
    }
}

impl From<rusqlite::Error> for PoolError {
    fn from(err: rusqlite::Error) -> Self {
        PoolError::Store(err.to_string())
    }
}
