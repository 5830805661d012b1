//! Saga state: the full continuation of one in-flight order workflow.
//!
//! The orchestrator itself is stateless; everything needed to resume a saga
//! after a crash or on another instance lives in this record, keyed by
//! correlation id in the external state store.

use chrono::{DateTime, Utc};
use event_schema::events::OrderCreated;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle of one saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    Started,
    ReservingInventory,
    ProcessingPayment,
    Confirming,
    Completed,
    Compensating,
    Compensated,
    Failed,
    TimedOut,
}

impl SagaStatus {
    /// Terminal states ignore all further events for the saga.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SagaStatus::Completed
                | SagaStatus::Compensated
                | SagaStatus::Failed
                | SagaStatus::TimedOut
        )
    }
}

/// The closed set of workflow steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStep {
    ReserveInventory,
    ProcessPayment,
    ConfirmOrder,
    SendNotification,
}

impl SagaStep {
    /// The success-path sequence. `completed_steps` is always a prefix of it.
    pub const SEQUENCE: [SagaStep; 4] = [
        SagaStep::ReserveInventory,
        SagaStep::ProcessPayment,
        SagaStep::ConfirmOrder,
        SagaStep::SendNotification,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SagaStep::ReserveInventory => "RESERVE_INVENTORY",
            SagaStep::ProcessPayment => "PROCESS_PAYMENT",
            SagaStep::ConfirmOrder => "CONFIRM_ORDER",
            SagaStep::SendNotification => "SEND_NOTIFICATION",
        }
    }
}

/// Durable state of one saga.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaState {
    pub correlation_id: Uuid,
    pub order_id: String,
    pub customer_id: String,
    /// Payload of the triggering event, retained so compensation can emit
    /// item lists and amounts without another round-trip to the order store.
    pub order_snapshot: OrderCreated,
    pub status: SagaStatus,
    pub current_step: Option<SagaStep>,
    /// Append-only, in execution order.
    pub completed_steps: Vec<SagaStep>,
    pub payment_id: Option<String>,
    pub failure_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub timeout_at: DateTime<Utc>,
}

impl SagaState {
    pub fn new(correlation_id: Uuid, order: OrderCreated, timeout: Duration) -> Self {
        let now = Utc::now();
        let timeout_at = now
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::minutes(5));
        Self {
            correlation_id,
            order_id: order.order_id.clone(),
            customer_id: order.customer_id.clone(),
            order_snapshot: order,
            status: SagaStatus::Started,
            current_step: None,
            completed_steps: Vec::new(),
            payment_id: None,
            failure_reason: None,
            started_at: now,
            last_updated_at: now,
            completed_at: None,
            failed_at: None,
            timeout_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        now > self.timeout_at
    }

    /// Append a step to the completion history.
    pub fn complete_step(&mut self, step: SagaStep) {
        self.completed_steps.push(step);
        self.last_updated_at = Utc::now();
    }

    pub fn touch(&mut self) {
        self.last_updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn sample_order() -> OrderCreated {
        OrderCreated {
            order_id: "ord_1".to_string(),
            customer_id: "cust_1".to_string(),
            items: vec![],
            total_amount: Decimal::new(9998, 2),
            currency: "USD".to_string(),
            payment_method: "card".to_string(),
            shipping_address: "1 Main St".to_string(),
        }
    }

    #[test]
    fn test_terminal_statuses() {
        for status in [
            SagaStatus::Completed,
            SagaStatus::Compensated,
            SagaStatus::Failed,
            SagaStatus::TimedOut,
        ] {
            assert!(status.is_terminal(), "{status:?} should be terminal");
        }
        for status in [
            SagaStatus::Started,
            SagaStatus::ReservingInventory,
            SagaStatus::ProcessingPayment,
            SagaStatus::Confirming,
            SagaStatus::Compensating,
        ] {
            assert!(!status.is_terminal(), "{status:?} should not be terminal");
        }
    }

    #[test]
    fn test_new_state_invariants() {
        let state = SagaState::new(
            Uuid::new_v4(),
            sample_order(),
            Duration::from_millis(300_000),
        );
        assert_eq!(state.status, SagaStatus::Started);
        assert!(state.completed_steps.is_empty());
        assert!(state.timeout_at > state.started_at);
        assert!(!state.is_timed_out(state.started_at));
    }

    #[test]
    fn test_status_wire_names() {
        let json = serde_json::to_string(&SagaStatus::ReservingInventory).unwrap();
        assert_eq!(json, "\"RESERVING_INVENTORY\"");
        let back: SagaStatus = serde_json::from_str("\"TIMED_OUT\"").unwrap();
        assert_eq!(back, SagaStatus::TimedOut);
    }

    #[test]
    fn test_state_roundtrip() {
        let mut state = SagaState::new(
            Uuid::new_v4(),
            sample_order(),
            Duration::from_millis(300_000),
        );
        state.complete_step(SagaStep::ReserveInventory);
        state.payment_id = Some("pay_1".to_string());

        let json = serde_json::to_string(&state).unwrap();
        let back: SagaState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.correlation_id, state.correlation_id);
        assert_eq!(back.completed_steps, vec![SagaStep::ReserveInventory]);
        assert_eq!(back.payment_id.as_deref(), Some("pay_1"));
    }

    #[test]
    fn test_completed_steps_prefix_of_sequence() {
        let mut state = SagaState::new(
            Uuid::new_v4(),
            sample_order(),
            Duration::from_millis(300_000),
        );
        for step in SagaStep::SEQUENCE {
            state.complete_step(step);
            assert_eq!(
                state.completed_steps.as_slice(),
                &SagaStep::SEQUENCE[..state.completed_steps.len()]
            );
        }
    }
}
