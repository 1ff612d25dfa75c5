//! Error types for Slidegate.

use thiserror::Error;

/// Failures raised by a counter store.
///
/// Stores never swallow these: the caller of the limiter decides whether a
/// store failure allows or denies traffic.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The Redis server could not be reached, timed out, or rejected the command
    #[error("Redis store unavailable: {0}")]
    Redis(#[from] redis::RedisError),

    /// A counter held a value that is not a non-negative integer
    #[error("Corrupt counter at {key}: {value:?}")]
    Corrupt { key: String, value: String },
}

/// Main error type for Slidegate operations.
#[derive(Error, Debug)]
pub enum GateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rejected per-call input
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Counter store failures
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GateError {
    /// Whether this error came from the counter store rather than the caller.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, GateError::Store(_))
    }
}

/// Result type alias for Slidegate operations.
pub type Result<T> = std::result::Result<T, GateError>;
