use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    Startup(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("saga state store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("outbox error: {0}")]
    Outbox(#[from] transactional_outbox::OutboxError),

    #[error("idempotency guard error: {0}")]
    Idempotency(#[from] idempotent_consumer::IdempotencyError),

    #[error("kafka error: {0}")]
    Kafka(String),
}

impl AppError {
    /// Whether retrying the same message can succeed. Drives the consumer's
    /// retry-vs-DLQ choice.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Database(e) => !matches!(e, sqlx::Error::RowNotFound),
            AppError::Store(_) | AppError::Outbox(_) | AppError::Idempotency(_) => true,
            AppError::Kafka(_) => true,
            AppError::Serialization(_) | AppError::Config(_) | AppError::Startup(_) => false,
        }
    }
}
