//! Typed payloads for every topic, plus the tagged sum the orchestrator
//! dispatches on.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::{topics, EventEnvelope};

/// Notification template ids used by the order workflow.
pub mod templates {
    pub const ORDER_CONFIRMED: &str = "order-confirmed";
    pub const ORDER_CANCELLED: &str = "order-cancelled";
}

/// One line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub product_id: String,
    pub quantity: u32,
    pub unit_price: Decimal,
}

// ============================================================================
// ORDER EVENTS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub order_id: String,
    pub customer_id: String,
    pub items: Vec<OrderItem>,
    pub total_amount: Decimal,
    pub currency: String,
    pub payment_method: String,
    pub shipping_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderConfirmed {
    pub order_id: String,
    pub customer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCancelled {
    pub order_id: String,
    pub customer_id: String,
    pub reason: String,
}

// ============================================================================
// PAYMENT EVENTS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentInitiated {
    pub order_id: String,
    pub customer_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub payment_method: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCompleted {
    pub order_id: String,
    pub payment_id: String,
    pub amount: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentFailed {
    pub order_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRefunded {
    pub order_id: String,
    pub payment_id: String,
    pub amount: Decimal,
    pub currency: String,
}

// ============================================================================
// INVENTORY EVENTS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryReserveRequested {
    pub order_id: String,
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryReserved {
    pub order_id: String,
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryReservationFailed {
    pub order_id: String,
    pub reason: String,
    pub insufficient_product_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryReleased {
    pub order_id: String,
    pub items: Vec<OrderItem>,
}

// ============================================================================
// NOTIFICATION EVENTS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSend {
    pub customer_id: String,
    pub channel: String,
    pub template_id: String,
    pub variables: HashMap<String, String>,
}

/// Inbound events the saga orchestrator reacts to, decoded by topic.
///
/// Modeling the events as a sum rather than a handler hierarchy keeps the
/// orchestrator a function over `(current state, event)` with exhaustive
/// match checking.
#[derive(Debug, Clone)]
pub enum SagaEvent {
    OrderCreated(EventEnvelope<OrderCreated>),
    InventoryReserved(EventEnvelope<InventoryReserved>),
    InventoryReservationFailed(EventEnvelope<InventoryReservationFailed>),
    PaymentCompleted(EventEnvelope<PaymentCompleted>),
    PaymentFailed(EventEnvelope<PaymentFailed>),
    OrderConfirmed(EventEnvelope<OrderConfirmed>),
}

impl SagaEvent {
    /// Decode a payload from one of the orchestrator's topics.
    ///
    /// Returns `Ok(None)` for topics the orchestrator does not handle.
    pub fn decode(topic: &str, payload: &[u8]) -> Result<Option<Self>, serde_json::Error> {
        let event = match topic {
            topics::ORDERS_CREATED => Self::OrderCreated(serde_json::from_slice(payload)?),
            topics::INVENTORY_RESERVED => {
                Self::InventoryReserved(serde_json::from_slice(payload)?)
            }
            topics::INVENTORY_RESERVATION_FAILED => {
                Self::InventoryReservationFailed(serde_json::from_slice(payload)?)
            }
            topics::PAYMENTS_COMPLETED => Self::PaymentCompleted(serde_json::from_slice(payload)?),
            topics::PAYMENTS_FAILED => Self::PaymentFailed(serde_json::from_slice(payload)?),
            topics::ORDERS_CONFIRMED => Self::OrderConfirmed(serde_json::from_slice(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    pub fn event_id(&self) -> Uuid {
        match self {
            Self::OrderCreated(e) => e.id,
            Self::InventoryReserved(e) => e.id,
            Self::InventoryReservationFailed(e) => e.id,
            Self::PaymentCompleted(e) => e.id,
            Self::PaymentFailed(e) => e.id,
            Self::OrderConfirmed(e) => e.id,
        }
    }

    pub fn correlation_id(&self) -> Uuid {
        match self {
            Self::OrderCreated(e) => e.correlation_id,
            Self::InventoryReserved(e) => e.correlation_id,
            Self::InventoryReservationFailed(e) => e.correlation_id,
            Self::PaymentCompleted(e) => e.correlation_id,
            Self::PaymentFailed(e) => e.correlation_id,
            Self::OrderConfirmed(e) => e.correlation_id,
        }
    }

    pub fn event_type(&self) -> &str {
        match self {
            Self::OrderCreated(e) => &e.event_type,
            Self::InventoryReserved(e) => &e.event_type,
            Self::InventoryReservationFailed(e) => &e.event_type,
            Self::PaymentCompleted(e) => &e.event_type,
            Self::PaymentFailed(e) => &e.event_type,
            Self::OrderConfirmed(e) => &e.event_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources;

    fn dec(value: &str) -> Decimal {
        value.parse().unwrap()
    }

    fn sample_order() -> OrderCreated {
        OrderCreated {
            order_id: "ord_test_001".to_string(),
            customer_id: "cust_1".to_string(),
            items: vec![OrderItem {
                product_id: "prod_1".to_string(),
                quantity: 2,
                unit_price: dec("49.99"),
            }],
            total_amount: dec("99.98"),
            currency: "USD".to_string(),
            payment_method: "card".to_string(),
            shipping_address: "1 Main St".to_string(),
        }
    }

    #[test]
    fn test_decode_known_topic() {
        let envelope = EventEnvelope::new(
            topics::ORDERS_CREATED,
            sources::ORDER_ORCHESTRATOR,
            Uuid::new_v4(),
            sample_order(),
        );
        let payload = serde_json::to_vec(&envelope).unwrap();

        let decoded = SagaEvent::decode(topics::ORDERS_CREATED, &payload)
            .unwrap()
            .expect("orders.created is handled");
        match decoded {
            SagaEvent::OrderCreated(e) => {
                assert_eq!(e.id, envelope.id);
                assert_eq!(e.data.order_id, "ord_test_001");
                assert_eq!(e.data.total_amount, dec("99.98"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_decode_unhandled_topic() {
        let decoded = SagaEvent::decode(topics::NOTIFICATIONS_SEND, b"{}").unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn test_decode_malformed_payload_is_error() {
        assert!(SagaEvent::decode(topics::PAYMENTS_COMPLETED, b"not json").is_err());
    }

    #[test]
    fn test_item_wire_names() {
        let item = OrderItem {
            product_id: "prod_1".to_string(),
            quantity: 2,
            unit_price: dec("49.99"),
        };
        let value = serde_json::to_value(&item).unwrap();
        assert!(value.get("productId").is_some());
        assert!(value.get("unitPrice").is_some());
    }
}
