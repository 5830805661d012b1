use std::time::Duration;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone)]
pub struct Config {
    pub app_env: String,
    pub redis_url: String,
    pub kafka: KafkaConfig,
    pub idempotency_ttl: Duration,
    pub smtp: SmtpConfig,
}

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    pub group_id: String,
}

/// SMTP settings for the email channel.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_email: String,
    pub from_name: String,
    /// Fallback domain for recipient addresses; the customer directory that
    /// resolves real addresses is outside this service.
    pub recipient_domain: String,
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
                    .unwrap_or_else(|_| "notification-service".to_string()),
            },
            idempotency_ttl: Duration::from_secs(env_parsed("IDEMPOTENCY_TTL_SECS", 86_400u64)?),
            smtp: SmtpConfig {
                host: std::env::var("SMTP_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: env_parsed("SMTP_PORT", 587u16)?,
                username: std::env::var("SMTP_USERNAME").unwrap_or_default(),
                password: std::env::var("SMTP_PASSWORD").unwrap_or_default(),
                from_email: std::env::var("FROM_EMAIL")
                    .unwrap_or_else(|_| "noreply@orderflow.dev".to_string()),
                from_name: std::env::var("FROM_NAME")
                    .unwrap_or_else(|_| "Orderflow".to_string()),
                recipient_domain: std::env::var("CUSTOMER_EMAIL_DOMAIN")
                    .unwrap_or_else(|_| "customers.orderflow.dev".to_string()),
            },
        })
    }
}
