//! Durable external store for saga state.
//!
//! State lives in Redis under `saga:order:{correlation_id}` with a TTL that
//! outlives the saga timeout by a grace period, so a stalled saga ages out on
//! its own. Completed sagas are kept visible for a short grace window via
//! [`SagaStore::schedule_delete`], which rewrites the key's TTL.

use async_trait::async_trait;
use redis_utils::{with_timeout, SharedConnectionManager};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::AppResult;
use crate::saga::state::SagaState;

fn saga_key(correlation_id: Uuid) -> String {
    format!("saga:order:{correlation_id}")
}

/// Persistence seam for saga state.
#[async_trait]
pub trait SagaStore: Send + Sync {
    async fn save(&self, state: &SagaState) -> AppResult<()>;
    async fn load(&self, correlation_id: Uuid) -> AppResult<Option<SagaState>>;
    async fn delete(&self, correlation_id: Uuid) -> AppResult<()>;
    /// Delayed removal: rewrites the key's TTL to `delay`.
    async fn schedule_delete(&self, correlation_id: Uuid, delay: Duration) -> AppResult<()>;
}

/// Redis-backed implementation.
pub struct RedisSagaStore {
    redis: SharedConnectionManager,
    state_ttl: Duration,
}

impl RedisSagaStore {
    pub fn new(redis: SharedConnectionManager, state_ttl: Duration) -> Self {
        Self { redis, state_ttl }
    }
}

#[async_trait]
impl SagaStore for RedisSagaStore {
    async fn save(&self, state: &SagaState) -> AppResult<()> {
        // Serialization failure is a programming error and fails loudly.
        let json = serde_json::to_string(state)?;
        let key = saga_key(state.correlation_id);

        let _: () = with_timeout(async {
            let mut conn = self.redis.lock().await;
            redis::cmd("SET")
                .arg(&key)
                .arg(&json)
                .arg("EX")
                .arg(self.state_ttl.as_secs().max(1))
                .query_async(&mut *conn)
                .await
        })
        .await?;

        debug!(
            correlation_id = %state.correlation_id,
            status = ?state.status,
            "Saga state saved"
        );
        Ok(())
    }

    async fn load(&self, correlation_id: Uuid) -> AppResult<Option<SagaState>> {
        let key = saga_key(correlation_id);

        let raw: Option<String> = with_timeout(async {
            let mut conn = self.redis.lock().await;
            redis::cmd("GET").arg(&key).query_async(&mut *conn).await
        })
        .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str::<SagaState>(&raw) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                // A key we cannot read is treated as absent; the orchestrator
                // then handles the event as orphaned.
                warn!(
                    correlation_id = %correlation_id,
                    error = %e,
                    "Failed to deserialize saga state, treating as absent"
                );
                Ok(None)
            }
        }
    }

    async fn delete(&self, correlation_id: Uuid) -> AppResult<()> {
        let key = saga_key(correlation_id);

        let _: i64 = with_timeout(async {
            let mut conn = self.redis.lock().await;
            redis::cmd("DEL").arg(&key).query_async(&mut *conn).await
        })
        .await?;

        debug!(correlation_id = %correlation_id, "Saga state deleted");
        Ok(())
    }

    async fn schedule_delete(&self, correlation_id: Uuid, delay: Duration) -> AppResult<()> {
        let key = saga_key(correlation_id);

        let _: i64 = with_timeout(async {
            let mut conn = self.redis.lock().await;
            redis::cmd("EXPIRE")
                .arg(&key)
                .arg(delay.as_secs().max(1))
                .query_async(&mut *conn)
                .await
        })
        .await?;

        debug!(
            correlation_id = %correlation_id,
            delay_secs = delay.as_secs(),
            "Saga state scheduled for deletion"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_namespace() {
        let id = Uuid::new_v4();
        assert_eq!(saga_key(id), format!("saga:order:{id}"));
    }
}
