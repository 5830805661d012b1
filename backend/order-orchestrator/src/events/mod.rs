//! Staging of outbound events.
//!
//! Every event the orchestrator emits is written twice in one Postgres
//! transaction: once into the append-only `order_events` log and once into
//! the outbox, where the relay picks it up. The log keeps the immutable
//! history; the outbox row carries the mutable publish lifecycle.

use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::debug;
use transactional_outbox::{OutboxRecord, SqlxOutboxRepository};
use uuid::Uuid;

use crate::error::AppResult;

/// Seam between the orchestrator and the durable store.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Record and stage the events atomically: all rows commit together or
    /// none do.
    async fn stage(&self, records: Vec<OutboxRecord>) -> AppResult<()>;
}

/// Production sink writing `order_events` and `outbox` in one transaction.
pub struct PostgresEventSink {
    pool: PgPool,
    outbox: Arc<SqlxOutboxRepository>,
}

impl PostgresEventSink {
    pub fn new(pool: PgPool, outbox: Arc<SqlxOutboxRepository>) -> Self {
        Self { pool, outbox }
    }
}

fn payload_uuid(payload: &serde_json::Value, field: &str) -> Option<Uuid> {
    payload
        .get(field)
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}

#[async_trait]
impl EventSink for PostgresEventSink {
    async fn stage(&self, records: Vec<OutboxRecord>) -> AppResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for record in &records {
            let correlation_id = payload_uuid(&record.payload, "correlationId");
            let causation_id = payload_uuid(&record.payload, "causationId");

            sqlx::query(
                r#"
                INSERT INTO order_events (
                    event_id,
                    event_type,
                    aggregate_id,
                    correlation_id,
                    causation_id,
                    payload,
                    recorded_at
                ) VALUES ($1, $2, $3, $4, $5, $6, NOW())
                "#,
            )
            .bind(record.id)
            .bind(&record.event_type)
            .bind(&record.aggregate_id)
            .bind(correlation_id)
            .bind(causation_id)
            .bind(&record.payload)
            .execute(&mut *tx)
            .await?;

            self.outbox.append(&mut tx, record).await?;
        }

        let staged = records.len();
        tx.commit().await?;

        debug!(count = staged, "Staged outbound events");
        Ok(())
    }
}
