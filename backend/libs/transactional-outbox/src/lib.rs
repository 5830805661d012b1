//! # Transactional Outbox
//!
//! Guarantees that every event published to Kafka corresponds to a committed
//! state change, and vice versa: no lost events, no phantom events.
//!
//! An outbox row is inserted in the same Postgres transaction as the business
//! write. A background relay selects unpublished rows under `FOR UPDATE SKIP
//! LOCKED`, publishes them to Kafka, and marks them published inside the same
//! transaction that holds the locks. The skip-locked scan is load-bearing: it
//! lets multiple relay workers drain disjoint rows without blocking each
//! other.
//!
//! Delivery is at-least-once; consumers deduplicate with the
//! `idempotent-consumer` guard.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use transactional_outbox::{OutboxRecord, SqlxOutboxRepository};
//! use event_schema::{topics, sources, EventEnvelope};
//! use event_schema::events::OrderConfirmed;
//! use sqlx::PgPool;
//! use uuid::Uuid;
//!
//! async fn confirm_order(
//!     pool: &PgPool,
//!     outbox: &SqlxOutboxRepository,
//!     correlation_id: Uuid,
//! ) -> Result<(), Box<dyn std::error::Error>> {
//!     let mut tx = pool.begin().await?;
//!
//!     // 1. Business write
//!     sqlx::query("UPDATE orders SET status = 'CONFIRMED' WHERE id = $1")
//!         .bind("ord_1")
//!         .execute(&mut *tx)
//!         .await?;
//!
//!     // 2. Outbox row in the same transaction
//!     let envelope = EventEnvelope::new(
//!         topics::ORDERS_CONFIRMED,
//!         sources::ORDER_ORCHESTRATOR,
//!         correlation_id,
//!         OrderConfirmed {
//!             order_id: "ord_1".to_string(),
//!             customer_id: "cust_1".to_string(),
//!         },
//!     );
//!     let record = OutboxRecord::from_envelope(
//!         "ord_1",
//!         "order",
//!         topics::ORDERS_CONFIRMED,
//!         &envelope,
//!     )?;
//!     outbox.append(&mut tx, &record).await?;
//!
//!     // 3. Both writes become visible together, or neither does
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Serialize;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use event_schema::{headers, EventEnvelope};

mod error;
pub mod metrics;

pub use error::{OutboxError, OutboxResult};
pub use metrics::OutboxMetrics;

/// Relay tuning knobs with the platform defaults.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Records selected per relay tick.
    pub batch_size: i64,
    /// Pause after a completed tick before the next one.
    pub poll_interval: Duration,
    /// Failed-publish attempts before a record is exhausted.
    pub max_retries: i32,
    /// Base of the exponential backoff schedule.
    pub backoff_base: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            poll_interval: Duration::from_secs(1),
            max_retries: 5,
            backoff_base: Duration::from_secs(5),
        }
    }
}

/// Backoff before retry `retry_count` (1-based): `base * 2^(retry_count - 1)`.
///
/// With the default 5 s base the schedule is 5, 10, 20, 40, 80 s.
pub fn backoff_delay(base: Duration, retry_count: i32) -> Duration {
    let exponent = retry_count.saturating_sub(1).clamp(0, 16) as u32;
    base.saturating_mul(2u32.saturating_pow(exponent))
}

/// One row of the outbox table.
///
/// `id` equals the embedded event's id. A record is unpublished iff
/// `published_at` is NULL; `retry_count` only increases and `published_at` is
/// set exactly once.
#[derive(Debug, Clone)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub topic: String,
    /// Serialized event envelope.
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Build a record from an event envelope.
    ///
    /// Fails with [`OutboxError::SerializationError`] if the payload cannot
    /// be encoded; that aborts the enclosing transaction, which is the right
    /// outcome for a programming error.
    pub fn from_envelope<T: Serialize>(
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        topic: impl Into<String>,
        envelope: &EventEnvelope<T>,
    ) -> OutboxResult<Self> {
        let now = Utc::now();
        Ok(Self {
            id: envelope.id,
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            event_type: envelope.event_type.clone(),
            topic: topic.into(),
            payload: serde_json::to_value(envelope)?,
            created_at: now,
            updated_at: now,
            published_at: None,
            retry_count: 0,
            last_error: None,
            next_retry_at: None,
        })
    }

    /// Kafka partition key: the envelope's correlation id.
    ///
    /// Every event of one saga shares the key, so the bus orders them on one
    /// partition. Falls back to the aggregate id for payloads without a
    /// correlation id.
    pub fn partition_key(&self) -> String {
        self.payload
            .get("correlationId")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| self.aggregate_id.clone())
    }

    /// Header pairs projected from the enveloped payload.
    pub fn header_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            (headers::EVENT_ID.to_string(), self.id.to_string()),
            (headers::EVENT_TYPE.to_string(), self.event_type.clone()),
        ];
        if let Some(version) = self.payload.get("version").and_then(|v| v.as_u64()) {
            pairs.push((headers::EVENT_VERSION.to_string(), version.to_string()));
        }
        if let Some(correlation_id) = self.payload.get("correlationId").and_then(|v| v.as_str()) {
            pairs.push((headers::CORRELATION_ID.to_string(), correlation_id.to_string()));
        }
        if let Some(causation_id) = self.payload.get("causationId").and_then(|v| v.as_str()) {
            pairs.push((headers::CAUSATION_ID.to_string(), causation_id.to_string()));
        }
        pairs
    }

    /// Relay eligibility: unpublished, retries left, and past any scheduled
    /// backoff.
    pub fn is_eligible(&self, now: DateTime<Utc>, max_retries: i32) -> bool {
        self.published_at.is_none()
            && self.retry_count < max_retries
            && self.next_retry_at.map(|at| at <= now).unwrap_or(true)
    }
}

/// SQLx-based repository for the outbox table.
pub struct SqlxOutboxRepository {
    pool: PgPool,
}

impl SqlxOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a record into the outbox within the caller's transaction.
    ///
    /// MUST be called inside the transaction that performs the business
    /// write; one commit makes both visible or neither.
    pub async fn append(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record: &OutboxRecord,
    ) -> OutboxResult<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox (
                id,
                aggregate_id,
                aggregate_type,
                event_type,
                topic,
                payload,
                created_at,
                updated_at,
                published_at,
                retry_count,
                last_error,
                next_retry_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(record.id)
        .bind(&record.aggregate_id)
        .bind(&record.aggregate_type)
        .bind(&record.event_type)
        .bind(&record.topic)
        .bind(&record.payload)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.published_at)
        .bind(record.retry_count)
        .bind(&record.last_error)
        .bind(record.next_retry_at)
        .execute(&mut **tx)
        .await
        .context("Failed to insert record into outbox")?;

        debug!(
            event_id = %record.id,
            event_type = %record.event_type,
            aggregate_id = %record.aggregate_id,
            topic = %record.topic,
            "Record inserted into outbox"
        );

        Ok(())
    }

    /// Select eligible records oldest-first, locking each selected row and
    /// skipping rows already locked by another relay worker.
    pub async fn claim_eligible(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        batch_size: i64,
        max_retries: i32,
    ) -> OutboxResult<Vec<OutboxRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT
                id,
                aggregate_id,
                aggregate_type,
                event_type,
                topic,
                payload,
                created_at,
                updated_at,
                published_at,
                retry_count,
                last_error,
                next_retry_at
            FROM outbox
            WHERE published_at IS NULL
              AND retry_count < $1
              AND (next_retry_at IS NULL OR next_retry_at <= NOW())
            ORDER BY created_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(max_retries)
        .bind(batch_size)
        .fetch_all(&mut **tx)
        .await
        .context("Failed to claim eligible outbox records")?;

        let records: Vec<OutboxRecord> = rows
            .into_iter()
            .map(|row| {
                Ok(OutboxRecord {
                    id: row.try_get("id")?,
                    aggregate_id: row.try_get("aggregate_id")?,
                    aggregate_type: row.try_get("aggregate_type")?,
                    event_type: row.try_get("event_type")?,
                    topic: row.try_get("topic")?,
                    payload: row.try_get("payload")?,
                    created_at: row.try_get("created_at")?,
                    updated_at: row.try_get("updated_at")?,
                    published_at: row.try_get("published_at")?,
                    retry_count: row.try_get("retry_count")?,
                    last_error: row.try_get("last_error")?,
                    next_retry_at: row.try_get("next_retry_at")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .context("Failed to parse outbox records")?;

        debug!(count = records.len(), "Claimed eligible outbox records");

        Ok(records)
    }

    /// Mark a claimed record as published. Called inside the claiming
    /// transaction so the publish and the status change commit together.
    pub async fn mark_published(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record_id: Uuid,
    ) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET published_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND published_at IS NULL
            "#,
        )
        .bind(record_id)
        .execute(&mut **tx)
        .await
        .context("Failed to mark record as published")?;

        if result.rows_affected() == 0 {
            warn!(record_id = %record_id, "Record not found when marking as published");
            return Err(OutboxError::RecordNotFound(record_id));
        }

        debug!(record_id = %record_id, "Record marked as published");

        Ok(())
    }

    /// Record a failed publish attempt: bump the retry count, store the error
    /// and the next backoff deadline (NULL once exhausted).
    pub async fn mark_failed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record_id: Uuid,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET retry_count = retry_count + 1,
                last_error = $2,
                next_retry_at = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(record_id)
        .bind(error)
        .bind(next_retry_at)
        .execute(&mut **tx)
        .await
        .context("Failed to mark record as failed")?;

        if result.rows_affected() == 0 {
            warn!(record_id = %record_id, "Record not found when marking as failed");
            return Err(OutboxError::RecordNotFound(record_id));
        }

        warn!(
            record_id = %record_id,
            error = %error,
            next_retry_at = ?next_retry_at,
            "Record marked as failed"
        );

        Ok(())
    }

    /// Pending count and oldest pending age in seconds (0 when none pending).
    pub async fn pending_stats(&self, max_retries: i32) -> OutboxResult<(i64, i64)> {
        let rec = sqlx::query(
            r#"
            SELECT
                COUNT(*)::BIGINT AS pending,
                COALESCE(EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT, 0) AS age_seconds
            FROM outbox
            WHERE published_at IS NULL
              AND retry_count < $1
            "#,
        )
        .bind(max_retries)
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute pending stats")?;

        let pending: i64 = rec.try_get("pending").unwrap_or(0);
        let age: i64 = rec.try_get("age_seconds").unwrap_or(0);
        Ok((pending, age))
    }

    /// Reset exhausted records for another round of delivery attempts.
    /// Operational backfill tool; normal flow never calls this.
    pub async fn replay_exhausted(&self, max_retries: i32) -> OutboxResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE outbox
            SET retry_count = 0,
                last_error = NULL,
                next_retry_at = NULL,
                updated_at = NOW()
            WHERE published_at IS NULL
              AND retry_count >= $1
            "#,
        )
        .bind(max_retries)
        .execute(&self.pool)
        .await
        .context("Failed to replay exhausted records")?;

        Ok(res.rows_affected())
    }
}

/// Publisher seam between the relay and the message broker.
///
/// Implementations should be idempotent on the broker side (idempotent
/// producer) so crash-driven re-publishes do not duplicate on the wire.
#[async_trait]
pub trait OutboxPublisher: Send + Sync {
    async fn publish(&self, record: &OutboxRecord) -> OutboxResult<()>;
}

/// Kafka-based implementation of [`OutboxPublisher`].
///
/// The producer MUST be configured with `enable.idempotence=true` and
/// `acks=all`; the partition key is the saga correlation id.
pub struct KafkaOutboxPublisher {
    producer: FutureProducer,
}

impl KafkaOutboxPublisher {
    pub fn new(producer: FutureProducer) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl OutboxPublisher for KafkaOutboxPublisher {
    async fn publish(&self, record: &OutboxRecord) -> OutboxResult<()> {
        let payload_str =
            serde_json::to_string(&record.payload).context("Failed to serialize record payload")?;

        let header_pairs = record.header_pairs();
        let mut message_headers = OwnedHeaders::new_with_capacity(header_pairs.len());
        for (name, value) in &header_pairs {
            message_headers = message_headers.insert(Header {
                key: name,
                value: Some(value.as_bytes()),
            });
        }

        let partition_key = record.partition_key();
        let kafka_record = FutureRecord::to(&record.topic)
            .key(&partition_key)
            .payload(&payload_str)
            .headers(message_headers);

        let delivery_timeout = Duration::from_secs(30);
        self.producer
            .send(kafka_record, delivery_timeout)
            .await
            .map_err(|(err, _)| {
                OutboxError::PublishFailed(format!("Kafka publish failed: {}", err))
            })?;

        info!(
            event_id = %record.id,
            event_type = %record.event_type,
            topic = %record.topic,
            "Event published to Kafka"
        );

        Ok(())
    }
}

/// Background relay publishing outbox records.
///
/// Each tick runs in a single transaction: claim eligible rows under
/// skip-locked, publish each synchronously, mark success or failure, commit.
/// A crash between broker ack and commit re-publishes on restart; consumers
/// absorb that with the idempotency guard.
pub struct OutboxProcessor<P: OutboxPublisher> {
    repository: Arc<SqlxOutboxRepository>,
    publisher: Arc<P>,
    pool: PgPool,
    config: OutboxConfig,
    metrics: Option<OutboxMetrics>,
}

impl<P: OutboxPublisher> OutboxProcessor<P> {
    pub fn new(
        pool: PgPool,
        repository: Arc<SqlxOutboxRepository>,
        publisher: Arc<P>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            repository,
            publisher,
            pool,
            config,
            metrics: None,
        }
    }

    /// Create a processor that also updates Prometheus metrics each tick.
    pub fn with_metrics(mut self, metrics: OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run the relay loop forever. Spawn as a background task.
    ///
    /// The next tick starts one poll interval after the previous tick
    /// completed, so a slow broker never stacks ticks.
    pub async fn start(&self) -> anyhow::Result<()> {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_retries = self.config.max_retries,
            "Outbox relay starting"
        );

        loop {
            match self.relay_tick().await {
                Ok(count) => {
                    if count > 0 {
                        info!(published_count = count, "Published events from outbox");
                    } else {
                        debug!("No outbox records to publish");
                    }
                }
                Err(e) => {
                    error!(error = ?e, "Outbox relay tick failed");
                }
            }

            if let Some(metrics) = &self.metrics {
                if let Ok((pending, age)) =
                    self.repository.pending_stats(self.config.max_retries).await
                {
                    metrics.pending.set(pending);
                    metrics.oldest_pending_age_seconds.set(age);
                }
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// One relay pass. Returns the number of records published.
    pub async fn relay_tick(&self) -> OutboxResult<usize> {
        let mut tx = self.pool.begin().await?;

        let records = self
            .repository
            .claim_eligible(&mut tx, self.config.batch_size, self.config.max_retries)
            .await?;

        let mut published_count = 0;

        for record in &records {
            match self.publisher.publish(record).await {
                Ok(()) => {
                    self.repository.mark_published(&mut tx, record.id).await?;
                    published_count += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.published.inc();
                    }
                }
                Err(e) => {
                    let attempt = record.retry_count + 1;
                    let next_retry_at = if attempt >= self.config.max_retries {
                        error!(
                            record_id = %record.id,
                            event_type = %record.event_type,
                            retry_count = attempt,
                            last_error = %e,
                            "Outbox record exhausted its retries, manual intervention required"
                        );
                        if let Some(metrics) = &self.metrics {
                            metrics.exhausted.inc();
                        }
                        None
                    } else {
                        let delay = backoff_delay(self.config.backoff_base, attempt);
                        Some(
                            Utc::now()
                                + chrono::Duration::from_std(delay)
                                    .unwrap_or_else(|_| chrono::Duration::seconds(300)),
                        )
                    };

                    self.repository
                        .mark_failed(&mut tx, record.id, &e.to_string(), next_retry_at)
                        .await?;
                }
            }
        }

        tx.commit().await?;

        Ok(published_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_schema::events::OrderConfirmed;
    use event_schema::{sources, topics};

    fn sample_record() -> OutboxRecord {
        let envelope = EventEnvelope::new(
            topics::ORDERS_CONFIRMED,
            sources::ORDER_ORCHESTRATOR,
            Uuid::new_v4(),
            OrderConfirmed {
                order_id: "ord_1".to_string(),
                customer_id: "cust_1".to_string(),
            },
        )
        .caused_by(Uuid::new_v4());

        OutboxRecord::from_envelope("ord_1", "order", topics::ORDERS_CONFIRMED, &envelope).unwrap()
    }

    #[test]
    fn test_backoff_schedule() {
        let base = Duration::from_secs(5);
        assert_eq!(backoff_delay(base, 1).as_secs(), 5);
        assert_eq!(backoff_delay(base, 2).as_secs(), 10);
        assert_eq!(backoff_delay(base, 3).as_secs(), 20);
        assert_eq!(backoff_delay(base, 4).as_secs(), 40);
        assert_eq!(backoff_delay(base, 5).as_secs(), 80);
    }

    #[test]
    fn test_record_id_equals_event_id() {
        let correlation_id = Uuid::new_v4();
        let envelope = EventEnvelope::new(
            topics::ORDERS_CONFIRMED,
            sources::ORDER_ORCHESTRATOR,
            correlation_id,
            OrderConfirmed {
                order_id: "ord_1".to_string(),
                customer_id: "cust_1".to_string(),
            },
        );
        let record =
            OutboxRecord::from_envelope("ord_1", "order", topics::ORDERS_CONFIRMED, &envelope)
                .unwrap();

        assert_eq!(record.id, envelope.id);
        assert_eq!(record.event_type, topics::ORDERS_CONFIRMED);
        assert_eq!(record.retry_count, 0);
        assert!(record.published_at.is_none());
        assert_eq!(record.partition_key(), correlation_id.to_string());
    }

    #[test]
    fn test_header_pairs_cover_wire_headers() {
        let record = sample_record();
        let pairs = record.header_pairs();
        for header in [
            headers::EVENT_ID,
            headers::EVENT_TYPE,
            headers::EVENT_VERSION,
            headers::CORRELATION_ID,
            headers::CAUSATION_ID,
        ] {
            assert!(
                pairs.iter().any(|(name, _)| name == header),
                "missing header {header}"
            );
        }
    }

    #[test]
    fn test_eligibility_predicate() {
        let now = Utc::now();
        let mut record = sample_record();

        assert!(record.is_eligible(now, 5));

        record.next_retry_at = Some(now + chrono::Duration::seconds(30));
        assert!(!record.is_eligible(now, 5), "backoff still pending");

        record.next_retry_at = Some(now - chrono::Duration::seconds(1));
        assert!(record.is_eligible(now, 5), "backoff elapsed");

        record.retry_count = 5;
        assert!(!record.is_eligible(now, 5), "retries exhausted");

        record.retry_count = 0;
        record.published_at = Some(now);
        assert!(!record.is_eligible(now, 5), "already published");
    }
}
