use std::time::Duration;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone)]
pub struct Config {
    pub app_env: String,
    pub redis_url: String,
    pub kafka: KafkaConfig,
    pub outbox: OutboxSettings,
    pub idempotency_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    pub group_id: String,
}

#[derive(Debug, Clone)]
pub struct OutboxSettings {
    pub batch_size: i64,
    pub poll_interval: Duration,
    pub max_retries: i32,
    pub backoff_base: Duration,
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> AppResult<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| AppError::Config(format!("invalid value for {name}: {raw}"))),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> AppResult<Self> {
        Ok(Config {
            app_env: std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            kafka: KafkaConfig {
                brokers: std::env::var("KAFKA_BROKERS")
                    .unwrap_or_else(|_| "localhost:9092".to_string()),
                group_id: std::env::var("KAFKA_GROUP_ID")
                    .unwrap_or_else(|_| "payment-service".to_string()),
            },
            outbox: OutboxSettings {
                batch_size: env_parsed("OUTBOX_BATCH_SIZE", 50i64)?,
                poll_interval: Duration::from_millis(env_parsed(
                    "OUTBOX_POLL_INTERVAL_MS",
                    1_000u64,
                )?),
                max_retries: env_parsed("OUTBOX_MAX_RETRIES", 5i32)?,
                backoff_base: Duration::from_secs(env_parsed("OUTBOX_BACKOFF_BASE_SECS", 5u64)?),
            },
            idempotency_ttl: Duration::from_secs(env_parsed("IDEMPOTENCY_TTL_SECS", 86_400u64)?),
        })
    }
}
