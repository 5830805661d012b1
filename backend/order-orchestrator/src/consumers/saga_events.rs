//! Kafka consumer for the orchestrator's inbound topics.
//!
//! Wraps every message in the idempotent-dispatch contract:
//!
//! 1. No `event-id` header: acknowledge and drop, the message cannot be
//!    deduplicated.
//! 2. Duplicate by `(topic, event id)`: acknowledge without side effects.
//! 3. Unparseable payload: route to the dead-letter topic and acknowledge,
//!    redelivery cannot fix a parse error.
//! 4. Handler failure: bounded in-process retries with exponential backoff,
//!    then dead-letter. If even the dead-letter publish fails the message is
//!    left unacknowledged so the bus redelivers.
//!
//! Offsets are committed manually per message, only after one of the
//! dispositions above.

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use event_schema::{topics, EnvelopeHeaders, SagaEvent};
use idempotent_consumer::IdempotencyGuard;

use crate::config::KafkaConfig;
use crate::error::{AppError, AppResult};
use crate::events::EventSink;
use crate::saga::{SagaOrchestrator, SagaStore};

/// Bounded retry schedule for handler failures: 1 s, 2 s, 4 s, capped at 10 s.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 1_000,
            max_backoff_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    pub fn get_backoff(&self, attempt: u32) -> Duration {
        let backoff = self.backoff_ms * 2_u64.pow(attempt.min(16));
        Duration::from_millis(backoff.min(self.max_backoff_ms))
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// What to do with a message after processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Commit the offset.
    Ack,
    /// Leave the offset uncommitted so the bus redelivers.
    Redeliver,
}

pub struct SagaEventConsumer<S: SagaStore, E: EventSink> {
    kafka: KafkaConfig,
    guard: IdempotencyGuard,
    orchestrator: Arc<SagaOrchestrator<S, E>>,
    dlq_producer: FutureProducer,
    retry_policy: RetryPolicy,
}

impl<S: SagaStore, E: EventSink> SagaEventConsumer<S, E> {
    pub fn new(
        kafka: KafkaConfig,
        guard: IdempotencyGuard,
        orchestrator: Arc<SagaOrchestrator<S, E>>,
        dlq_producer: FutureProducer,
    ) -> Self {
        Self {
            kafka,
            guard,
            orchestrator,
            dlq_producer,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Run the consume loop forever.
    pub async fn start(&self) -> AppResult<()> {
        // Manual commits: an offset is only committed once the message has a
        // final disposition, so a crash mid-handler redelivers.
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.kafka.brokers)
            .set("group.id", &self.kafka.group_id)
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "10000")
            .create()
            .map_err(|e| AppError::Kafka(format!("failed to create consumer: {e}")))?;

        let subscribed = [
            topics::ORDERS_CREATED,
            topics::INVENTORY_RESERVED,
            topics::INVENTORY_RESERVATION_FAILED,
            topics::PAYMENTS_COMPLETED,
            topics::PAYMENTS_FAILED,
            topics::ORDERS_CONFIRMED,
        ];
        consumer
            .subscribe(&subscribed)
            .map_err(|e| AppError::Kafka(format!("failed to subscribe: {e}")))?;

        info!(topics = ?subscribed, group_id = %self.kafka.group_id, "Saga event consumer started");

        loop {
            match consumer.recv().await {
                Err(e) => {
                    warn!("Kafka consumer error: {}", e);
                }
                Ok(message) => {
                    let disposition = self.process_message(&message).await;
                    if disposition == Disposition::Ack {
                        if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                            warn!("Failed to commit offset: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn process_message(&self, message: &BorrowedMessage<'_>) -> Disposition {
        let topic = message.topic();

        let parsed_headers = message
            .headers()
            .map(|h| {
                EnvelopeHeaders::from_pairs(
                    h.iter().filter_map(|header| {
                        header.value.map(|value| (header.key, value))
                    }),
                )
            })
            .unwrap_or_default();

        let Some(event_id) = parsed_headers.event_id else {
            warn!(topic = %topic, "Message without event-id header, dropping");
            return Disposition::Ack;
        };

        match self.guard.is_duplicate(&event_id, topic).await {
            Ok(true) => {
                debug!(event_id = %event_id, topic = %topic, "Duplicate delivery, skipping");
                return Disposition::Ack;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    event_id = %event_id,
                    topic = %topic,
                    error = %e,
                    "Idempotency check failed, leaving message for redelivery"
                );
                return Disposition::Redeliver;
            }
        }

        let Some(payload) = message.payload() else {
            warn!(event_id = %event_id, topic = %topic, "Empty payload, routing to DLQ");
            return self.dead_letter(message).await;
        };

        let event = match SagaEvent::decode(topic, payload) {
            Ok(Some(event)) => event,
            Ok(None) => {
                warn!(topic = %topic, "Message on unhandled topic, dropping");
                return Disposition::Ack;
            }
            Err(e) => {
                // Redelivery cannot fix a parse error.
                warn!(
                    event_id = %event_id,
                    topic = %topic,
                    error = %e,
                    "Unparseable payload, routing to DLQ"
                );
                return self.dead_letter(message).await;
            }
        };

        let mut attempt = 0u32;
        loop {
            match self.orchestrator.handle_event(event.clone()).await {
                Ok(()) => return Disposition::Ack,
                Err(e) if e.is_retryable() && self.retry_policy.should_retry(attempt) => {
                    warn!(
                        event_id = %event_id,
                        topic = %topic,
                        attempt,
                        error = %e,
                        "Saga handler failed, retrying"
                    );
                    tokio::time::sleep(self.retry_policy.get_backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        event_id = %event_id,
                        topic = %topic,
                        attempt,
                        error = %e,
                        "Saga handler failed after retries, routing to DLQ"
                    );
                    return self.dead_letter(message).await;
                }
            }
        }
    }

    /// Publish the raw message to `<topic>.dlq`, preserving key and headers
    /// so the event can be replayed after the fault is fixed.
    async fn dead_letter(&self, message: &BorrowedMessage<'_>) -> Disposition {
        let dlq_topic = topics::dlq(message.topic());
        let payload = message.payload().unwrap_or_default();
        let key = message.key().unwrap_or_default();

        let mut record = FutureRecord::to(&dlq_topic).payload(payload).key(key);
        if let Some(message_headers) = message.headers() {
            record = record.headers(message_headers.detach());
        }

        match self
            .dlq_producer
            .send(record, Duration::from_secs(10))
            .await
        {
            Ok(_) => {
                info!(dlq_topic = %dlq_topic, "Message routed to DLQ");
                Disposition::Ack
            }
            Err((e, _)) => {
                error!(
                    dlq_topic = %dlq_topic,
                    error = %e,
                    "DLQ publish failed, leaving message for redelivery"
                );
                Disposition::Redeliver
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.get_backoff(0), Duration::from_millis(1_000));
        assert_eq!(policy.get_backoff(1), Duration::from_millis(2_000));
        assert_eq!(policy.get_backoff(2), Duration::from_millis(4_000));
        // Capped at 10s from here on.
        assert_eq!(policy.get_backoff(5), Duration::from_millis(10_000));
    }

    #[test]
    fn test_retry_policy_bounds() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }
}
