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

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("outbox error: {0}")]
    Outbox(#[from] transactional_outbox::OutboxError),

    #[error("idempotency guard error: {0}")]
    Idempotency(#[from] idempotent_consumer::IdempotencyError),

    #[error("payment gateway error: {0}")]
    Gateway(String),

    #[error("kafka error: {0}")]
    Kafka(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Whether redelivering the same message can succeed.
    ///
    /// A gateway transport error leaves the charge outcome unknown; the
    /// retry re-enters the idempotent process path, so it is safe.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Database(e) => !matches!(e, sqlx::Error::RowNotFound),
            AppError::Outbox(_)
            | AppError::Idempotency(_)
            | AppError::Gateway(_)
            | AppError::Kafka(_) => true,
            AppError::Serialization(_)
            | AppError::Config(_)
            | AppError::Startup(_)
            | AppError::Internal(_) => false,
        }
    }
}
