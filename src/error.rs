//! Error types for the Tollgate service.

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TollgateError {
    fn from(err: config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;

/// Reasons the shared window store could not produce an answer.
///
/// These never reach the caller of the limiter; they only explain, in logs,
/// why a decision was served from the local store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store reported an error (connection refused, command failure, ...)
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store answered with something we could not interpret
    #[error("Unexpected store reply: {0}")]
    Protocol(String),

    /// Another call is already (re)connecting to the store
    #[error("Shared store connection attempt already in progress")]
    Connecting,

    /// The store did not answer within the configured budget
    #[error("Shared store timed out after {0} ms")]
    Timeout(u64),

    /// The task driving the store call failed before producing a reply
    #[error("Shared store task failed: {0}")]
    Task(String),
}
