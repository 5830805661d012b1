//! Error types for the idempotency guard.

use thiserror::Error;

/// Result type alias for guard operations.
pub type IdempotencyResult<T> = Result<T, IdempotencyError>;

/// Errors that can occur while recording or checking idempotency keys.
#[derive(Error, Debug)]
pub enum IdempotencyError {
    /// Redis operation failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Event id failed validation
    #[error("Invalid event ID: {0}")]
    InvalidEventId(String),

    /// Generic error with context
    #[error("Idempotency error: {0}")]
    Other(#[from] anyhow::Error),
}
