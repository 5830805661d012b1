//! # Idempotent Consumer Guard
//!
//! Collapses Kafka's at-least-once delivery down to at-most-once effective
//! processing. Each consumer records `(topic, event_id)` in Redis with an
//! atomic set-if-absent before running any side effect; a redelivered message
//! finds the key already present and is acknowledged without reprocessing.
//!
//! ## Why Redis
//!
//! The dedup cell must be shared by every instance of a consumer group and
//! must expire on its own, bounding both memory and the replay window. A
//! single `SET key value NX EX ttl` gives the whole check-then-claim as one
//! atomic command: no two concurrent consumers can both observe a first-time
//! event, even across rebalances.
//!
//! ## Usage contract at every consumer
//!
//! 1. Extract the event id from the `event-id` message header. If absent,
//!    acknowledge and drop - a message without identity cannot be
//!    deduplicated.
//! 2. Call [`IdempotencyGuard::is_duplicate`]. On `true`, acknowledge and
//!    return.
//! 3. Run the handler. On success, acknowledge. On failure, do NOT
//!    acknowledge - the bus redelivers, and the guard now short-circuits.
//!
//! Callers that want to mark only after downstream success use
//! [`IdempotencyGuard::mark_processed`] instead of the atomic check.
//!
//! ## Failure semantics
//!
//! Guard errors propagate. A missed duplicate here can double-charge a
//! payment, so a Redis failure leaves the message unacknowledged and the bus
//! redelivers once Redis is back.

use redis_utils::{with_timeout, SharedConnectionManager};
use std::time::Duration;
use tracing::{debug, info};

mod error;

pub use error::{IdempotencyError, IdempotencyResult};

/// Default retention for idempotency keys: 24 hours.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const KEY_PREFIX: &str = "idempotency";
const SENTINEL: &str = "1";
const MAX_EVENT_ID_LEN: usize = 255;

/// Deduplication guard keyed by `(topic, event_id)`.
///
/// Thread-safe; share across tasks with `Clone` (the underlying connection
/// manager is shared).
#[derive(Clone)]
pub struct IdempotencyGuard {
    redis: SharedConnectionManager,
    default_ttl: Duration,
}

impl IdempotencyGuard {
    /// Create a guard with the default 24 h TTL.
    pub fn new(redis: SharedConnectionManager) -> Self {
        Self::with_ttl(redis, DEFAULT_TTL)
    }

    /// Create a guard with a custom default TTL.
    pub fn with_ttl(redis: SharedConnectionManager, default_ttl: Duration) -> Self {
        Self { redis, default_ttl }
    }

    /// Key format: `idempotency:{topic}:{event_id}`.
    fn key(topic: &str, event_id: &str) -> String {
        format!("{KEY_PREFIX}:{topic}:{event_id}")
    }

    /// Atomically record `(topic, event_id)` and report whether it was
    /// already present.
    ///
    /// Returns `true` iff the event was seen before; the caller must then
    /// skip processing. Uses a single `SET NX EX` so the check-then-set
    /// window is zero.
    pub async fn is_duplicate(&self, event_id: &str, topic: &str) -> IdempotencyResult<bool> {
        self.is_duplicate_with_ttl(event_id, topic, self.default_ttl)
            .await
    }

    /// Variant of [`is_duplicate`](Self::is_duplicate) with a caller-chosen TTL.
    pub async fn is_duplicate_with_ttl(
        &self,
        event_id: &str,
        topic: &str,
        ttl: Duration,
    ) -> IdempotencyResult<bool> {
        Self::validate_event_id(event_id)?;
        let key = Self::key(topic, event_id);

        // SET key value NX EX seconds: nil reply means the key already existed.
        let was_set: Option<String> = with_timeout(async {
            let mut conn = self.redis.lock().await;
            redis::cmd("SET")
                .arg(&key)
                .arg(SENTINEL)
                .arg("NX")
                .arg("EX")
                .arg(ttl.as_secs().max(1))
                .query_async(&mut *conn)
                .await
        })
        .await?;

        let duplicate = was_set.is_none();
        if duplicate {
            debug!(event_id = %event_id, topic = %topic, "Duplicate event detected");
        }

        Ok(duplicate)
    }

    /// Record `(topic, event_id)` without the atomic check, for callers that
    /// mark only after downstream success.
    pub async fn mark_processed(&self, event_id: &str, topic: &str) -> IdempotencyResult<()> {
        Self::validate_event_id(event_id)?;
        let key = Self::key(topic, event_id);
        let ttl = self.default_ttl;

        let _: () = with_timeout(async {
            let mut conn = self.redis.lock().await;
            redis::cmd("SET")
                .arg(&key)
                .arg(SENTINEL)
                .arg("EX")
                .arg(ttl.as_secs().max(1))
                .query_async(&mut *conn)
                .await
        })
        .await?;

        info!(event_id = %event_id, topic = %topic, "Event marked as processed");
        Ok(())
    }

    /// Remove a recorded key, for tests and manual replay.
    pub async fn remove(&self, event_id: &str, topic: &str) -> IdempotencyResult<()> {
        Self::validate_event_id(event_id)?;
        let key = Self::key(topic, event_id);

        let removed: i64 = with_timeout(async {
            let mut conn = self.redis.lock().await;
            redis::cmd("DEL").arg(&key).query_async(&mut *conn).await
        })
        .await?;

        debug!(event_id = %event_id, topic = %topic, removed, "Idempotency key removed");
        Ok(())
    }

    /// Validate event_id format
    fn validate_event_id(event_id: &str) -> IdempotencyResult<()> {
        if event_id.is_empty() {
            return Err(IdempotencyError::InvalidEventId(
                "Event ID cannot be empty".to_string(),
            ));
        }

        if event_id.len() > MAX_EVENT_ID_LEN {
            return Err(IdempotencyError::InvalidEventId(format!(
                "Event ID too long: {} characters (max {MAX_EVENT_ID_LEN})",
                event_id.len()
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_format() {
        assert_eq!(
            IdempotencyGuard::key("orders.created", "evt-1"),
            "idempotency:orders.created:evt-1"
        );
    }

    #[test]
    fn test_validate_event_id() {
        assert!(IdempotencyGuard::validate_event_id("event-123").is_ok());
        assert!(IdempotencyGuard::validate_event_id("a").is_ok());
        assert!(IdempotencyGuard::validate_event_id(&"x".repeat(255)).is_ok());

        let err = IdempotencyGuard::validate_event_id("").unwrap_err();
        assert!(matches!(err, IdempotencyError::InvalidEventId(_)));

        let err = IdempotencyGuard::validate_event_id(&"x".repeat(256)).unwrap_err();
        assert!(matches!(err, IdempotencyError::InvalidEventId(_)));
    }
}
