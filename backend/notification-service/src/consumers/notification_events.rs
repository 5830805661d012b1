//! Kafka consumer for `notifications.send`.
//!
//! Deduplication before delivery matters more here than anywhere else: a
//! redelivered send must not email the customer twice.

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use event_schema::events::NotificationSend;
use event_schema::{topics, EnvelopeHeaders, EventEnvelope};
use idempotent_consumer::IdempotencyGuard;

use crate::config::KafkaConfig;
use crate::error::{AppError, AppResult};
use crate::service::NotificationService;

/// Bounded retry schedule for handler failures: 1 s, 2 s, 4 s, capped at 10 s.
#[derive(Debug, Clone)]
struct RetryPolicy {
    max_retries: u32,
    backoff_ms: u64,
    max_backoff_ms: u64,
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
    fn get_backoff(&self, attempt: u32) -> Duration {
        let backoff = self.backoff_ms * 2_u64.pow(attempt.min(16));
        Duration::from_millis(backoff.min(self.max_backoff_ms))
    }

    fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Ack,
    Redeliver,
}

pub struct NotificationEventConsumer {
    kafka: KafkaConfig,
    guard: IdempotencyGuard,
    service: Arc<NotificationService>,
    dlq_producer: FutureProducer,
    retry_policy: RetryPolicy,
}

impl NotificationEventConsumer {
    pub fn new(
        kafka: KafkaConfig,
        guard: IdempotencyGuard,
        service: Arc<NotificationService>,
        dlq_producer: FutureProducer,
    ) -> Self {
        Self {
            kafka,
            guard,
            service,
            dlq_producer,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub async fn start(&self) -> AppResult<()> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.kafka.brokers)
            .set("group.id", &self.kafka.group_id)
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "10000")
            .create()
            .map_err(|e| AppError::Kafka(format!("failed to create consumer: {e}")))?;

        consumer
            .subscribe(&[topics::NOTIFICATIONS_SEND])
            .map_err(|e| AppError::Kafka(format!("failed to subscribe: {e}")))?;

        info!(
            topic = topics::NOTIFICATIONS_SEND,
            group_id = %self.kafka.group_id,
            "Notification event consumer started"
        );

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
                    h.iter()
                        .filter_map(|header| header.value.map(|value| (header.key, value))),
                )
            })
            .unwrap_or_default();

        let Some(event_id) = parsed_headers.event_id else {
            warn!(topic = %topic, "Message without event-id header, dropping");
            return Disposition::Ack;
        };

        match self.guard.is_duplicate(&event_id, topic).await {
            Ok(true) => {
                debug!(event_id = %event_id, "Duplicate delivery, skipping");
                return Disposition::Ack;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    event_id = %event_id,
                    error = %e,
                    "Idempotency check failed, leaving message for redelivery"
                );
                return Disposition::Redeliver;
            }
        }

        let Some(payload) = message.payload() else {
            warn!(event_id = %event_id, "Empty payload, routing to DLQ");
            return self.dead_letter(message).await;
        };

        let envelope: EventEnvelope<NotificationSend> = match serde_json::from_slice(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    event_id = %event_id,
                    error = %e,
                    "Unparseable payload, routing to DLQ"
                );
                return self.dead_letter(message).await;
            }
        };

        let mut attempt = 0u32;
        loop {
            match self.service.send(&envelope).await {
                Ok(()) => return Disposition::Ack,
                Err(e) if e.is_retryable() && self.retry_policy.should_retry(attempt) => {
                    warn!(
                        event_id = %event_id,
                        attempt,
                        error = %e,
                        "Notification delivery failed, retrying"
                    );
                    tokio::time::sleep(self.retry_policy.get_backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        event_id = %event_id,
                        attempt,
                        error = %e,
                        "Notification delivery failed, routing to DLQ"
                    );
                    return self.dead_letter(message).await;
                }
            }
        }
    }

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
