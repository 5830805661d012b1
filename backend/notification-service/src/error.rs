use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    Startup(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("idempotency guard error: {0}")]
    Idempotency(#[from] idempotent_consumer::IdempotencyError),

    #[error("unknown template: {0}")]
    UnknownTemplate(String),

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("kafka error: {0}")]
    Kafka(String),
}

impl AppError {
    /// Whether redelivering the same message can succeed. Unknown templates
    /// and channels are data errors; retrying cannot fix them.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Delivery(_) | AppError::Idempotency(_) | AppError::Kafka(_)
        )
    }
}
