//! Event schema registry for all Kafka topics across Orderflow services.
//!
//! Defines the canonical event envelope, the per-topic payload types, and the
//! projection of an envelope onto a Kafka message (partition key, value,
//! headers). Every event carries a required `version` field so payloads can
//! evolve without breaking consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod events;
pub mod topics;

pub use events::SagaEvent;

/// Current schema version for all events.
pub const SCHEMA_VERSION: u32 = 1;

/// CloudEvents-compatible spec version, constant on the wire.
pub const SPEC_VERSION: &str = "1.0";

/// Content type of every serialized envelope.
pub const DATA_CONTENT_TYPE: &str = "application/json";

/// Kafka header names carried alongside every published envelope.
pub mod headers {
    pub const EVENT_ID: &str = "event-id";
    pub const EVENT_TYPE: &str = "event-type";
    pub const EVENT_VERSION: &str = "event-version";
    pub const CORRELATION_ID: &str = "correlation-id";
    pub const CAUSATION_ID: &str = "causation-id";
}

/// Logical source paths for the services that emit events.
///
/// Envelopes always carry the source of the service that actually emitted
/// them; compensation events emitted on behalf of a participant still carry
/// the orchestrator's source.
pub mod sources {
    pub const ORDER_ORCHESTRATOR: &str = "/services/order-orchestrator";
    pub const INVENTORY_SERVICE: &str = "/services/inventory-service";
    pub const PAYMENT_SERVICE: &str = "/services/payment-service";
    pub const NOTIFICATION_SERVICE: &str = "/services/notification-service";
}

fn default_specversion() -> String {
    SPEC_VERSION.to_string()
}

fn default_datacontenttype() -> String {
    DATA_CONTENT_TYPE.to_string()
}

/// Canonical envelope for every message on the bus.
///
/// `correlation_id` is the saga identifier: all events of one business
/// transaction share it, and it doubles as the Kafka partition key so those
/// events are totally ordered. `causation_id` points at the event that
/// produced this one and is absent only at saga entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope<T> {
    /// Globally unique event id.
    pub id: Uuid,
    /// Hierarchical event type, equal to the topic name (e.g. `orders.created`).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Logical path of the emitting service (see [`sources`]).
    pub source: String,
    /// Instant the event occurred.
    pub time: DateTime<Utc>,
    /// Saga identifier, stable across the full saga lifetime.
    pub correlation_id: Uuid,
    /// Id of the event that produced this one; absent at saga entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<Uuid>,
    /// Payload schema version.
    pub version: u32,
    #[serde(default = "default_specversion")]
    pub specversion: String,
    #[serde(default = "default_datacontenttype")]
    pub datacontenttype: String,
    /// Typed payload, one struct per topic (see [`events`]).
    pub data: T,
}

impl<T> EventEnvelope<T> {
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        correlation_id: Uuid,
        data: T,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            source: source.into(),
            time: Utc::now(),
            correlation_id,
            causation_id: None,
            version: SCHEMA_VERSION,
            specversion: default_specversion(),
            datacontenttype: default_datacontenttype(),
            data,
        }
    }

    /// Record the inbound event that produced this one.
    pub fn caused_by(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }
}

impl<T: Serialize> EventEnvelope<T> {
    /// Project the envelope onto a Kafka message.
    ///
    /// The partition key is the correlation id, so every event of one saga
    /// serializes onto the same partition.
    pub fn to_kafka_message(&self) -> Result<KafkaMessage, serde_json::Error> {
        let mut message_headers = vec![
            (headers::EVENT_ID.to_string(), self.id.to_string()),
            (headers::EVENT_TYPE.to_string(), self.event_type.clone()),
            (headers::EVENT_VERSION.to_string(), self.version.to_string()),
            (
                headers::CORRELATION_ID.to_string(),
                self.correlation_id.to_string(),
            ),
        ];
        if let Some(causation_id) = self.causation_id {
            message_headers.push((headers::CAUSATION_ID.to_string(), causation_id.to_string()));
        }

        Ok(KafkaMessage {
            key: self.correlation_id.to_string(),
            value: serde_json::to_string(self)?,
            headers: message_headers,
        })
    }
}

/// Kafka message projection of an envelope.
#[derive(Debug, Clone)]
pub struct KafkaMessage {
    /// Partition key (the correlation id).
    pub key: String,
    /// Serialized envelope.
    pub value: String,
    /// Message headers as UTF-8 pairs.
    pub headers: Vec<(String, String)>,
}

/// Envelope headers as read back from a consumed Kafka message.
///
/// Consumers extract these before touching the payload: a message without an
/// `event-id` header cannot be deduplicated and is dropped up front.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeHeaders {
    pub event_id: Option<String>,
    pub event_type: Option<String>,
    pub event_version: Option<String>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
}

impl EnvelopeHeaders {
    /// Collect known headers from raw `(name, value)` pairs, ignoring the rest.
    pub fn from_pairs<'a>(pairs: impl Iterator<Item = (&'a str, &'a [u8])>) -> Self {
        let mut out = Self::default();
        for (name, value) in pairs {
            let Ok(value) = std::str::from_utf8(value) else {
                continue;
            };
            match name {
                headers::EVENT_ID => out.event_id = Some(value.to_string()),
                headers::EVENT_TYPE => out.event_type = Some(value.to_string()),
                headers::EVENT_VERSION => out.event_version = Some(value.to_string()),
                headers::CORRELATION_ID => out.correlation_id = Some(value.to_string()),
                headers::CAUSATION_ID => out.causation_id = Some(value.to_string()),
                _ => {}
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::OrderConfirmed;

    #[test]
    fn test_envelope_wire_field_names() {
        let envelope = EventEnvelope::new(
            topics::ORDERS_CONFIRMED,
            sources::ORDER_ORCHESTRATOR,
            Uuid::new_v4(),
            OrderConfirmed {
                order_id: "ord_1".to_string(),
                customer_id: "cust_1".to_string(),
            },
        );

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "orders.confirmed");
        assert_eq!(value["specversion"], "1.0");
        assert_eq!(value["datacontenttype"], "application/json");
        assert!(value.get("correlationId").is_some());
        assert!(value.get("causationId").is_none());
        assert_eq!(value["data"]["orderId"], "ord_1");
    }

    #[test]
    fn test_envelope_roundtrip_with_causation() {
        let cause = Uuid::new_v4();
        let envelope = EventEnvelope::new(
            topics::ORDERS_CONFIRMED,
            sources::ORDER_ORCHESTRATOR,
            Uuid::new_v4(),
            OrderConfirmed {
                order_id: "ord_1".to_string(),
                customer_id: "cust_1".to_string(),
            },
        )
        .caused_by(cause);

        let json = serde_json::to_string(&envelope).unwrap();
        let back: EventEnvelope<OrderConfirmed> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, envelope.id);
        assert_eq!(back.causation_id, Some(cause));
        assert_eq!(back.correlation_id, envelope.correlation_id);
    }

    #[test]
    fn test_kafka_message_projection() {
        let correlation_id = Uuid::new_v4();
        let envelope = EventEnvelope::new(
            topics::ORDERS_CONFIRMED,
            sources::ORDER_ORCHESTRATOR,
            correlation_id,
            OrderConfirmed {
                order_id: "ord_1".to_string(),
                customer_id: "cust_1".to_string(),
            },
        )
        .caused_by(Uuid::new_v4());

        let message = envelope.to_kafka_message().unwrap();
        assert_eq!(message.key, correlation_id.to_string());
        for header in [
            headers::EVENT_ID,
            headers::EVENT_TYPE,
            headers::EVENT_VERSION,
            headers::CORRELATION_ID,
            headers::CAUSATION_ID,
        ] {
            assert!(
                message.headers.iter().any(|(name, _)| name == header),
                "missing header {header}"
            );
        }
    }

    #[test]
    fn test_headers_from_pairs_ignores_unknown_and_non_utf8() {
        let pairs: Vec<(&str, &[u8])> = vec![
            (headers::EVENT_ID, b"abc".as_slice()),
            ("x-custom", b"ignored".as_slice()),
            (headers::CORRELATION_ID, &[0xff, 0xfe]),
        ];
        let parsed = EnvelopeHeaders::from_pairs(pairs.into_iter());
        assert_eq!(parsed.event_id.as_deref(), Some("abc"));
        assert!(parsed.correlation_id.is_none());
        assert!(parsed.causation_id.is_none());
    }
}
