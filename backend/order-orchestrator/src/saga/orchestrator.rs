//! The saga orchestrator: a stateless controller advancing the order
//! workflow through its steps and unwinding completed steps in reverse order
//! when a participant fails.
//!
//! All continuation state lives in the external store keyed by correlation
//! id, so any orchestrator instance can pick up any event; per-saga ordering
//! is guaranteed by the bus partitioning on the correlation id.
//!
//! Success path:
//! `RESERVE_INVENTORY -> PROCESS_PAYMENT -> CONFIRM_ORDER -> SEND_NOTIFICATION -> COMPLETED`

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use event_schema::events::{
    templates, InventoryReleased, InventoryReserveRequested, NotificationSend, OrderCancelled,
    OrderConfirmed, OrderCreated, PaymentInitiated, PaymentRefunded,
};
use event_schema::{sources, topics, EventEnvelope, SagaEvent};
use transactional_outbox::OutboxRecord;

use crate::error::AppResult;
use crate::events::EventSink;
use crate::metrics::SagaMetrics;
use crate::saga::state::{SagaState, SagaStatus, SagaStep};
use crate::saga::store::SagaStore;

/// Delivery channel for workflow notifications.
const NOTIFICATION_CHANNEL: &str = "email";

/// Aggregate type recorded on every staged event.
const AGGREGATE_TYPE: &str = "order";

#[derive(Debug, Clone)]
pub struct SagaConfig {
    /// Wall-clock budget for one saga.
    pub timeout: Duration,
    /// How long a terminal saga stays visible before its state is removed.
    pub grace: Duration,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(300_000),
            grace: Duration::from_secs(300),
        }
    }
}

pub struct SagaOrchestrator<S: SagaStore, E: EventSink> {
    store: S,
    sink: E,
    config: SagaConfig,
    metrics: SagaMetrics,
}

impl<S: SagaStore, E: EventSink> SagaOrchestrator<S, E> {
    pub fn new(store: S, sink: E, config: SagaConfig, metrics: SagaMetrics) -> Self {
        Self {
            store,
            sink,
            config,
            metrics,
        }
    }

    /// Entry point for every inbound saga event.
    pub async fn handle_event(&self, event: SagaEvent) -> AppResult<()> {
        match event {
            SagaEvent::OrderCreated(envelope) => self.start_saga(envelope).await,
            reply => self.handle_reply(reply).await,
        }
    }

    /// Begin a new saga for a created order and request the first step.
    async fn start_saga(&self, envelope: EventEnvelope<OrderCreated>) -> AppResult<()> {
        let correlation_id = envelope.correlation_id;

        if let Some(existing) = self.store.load(correlation_id).await? {
            warn!(
                correlation_id = %correlation_id,
                status = ?existing.status,
                "Saga already started for this correlation id, discarding"
            );
            return Ok(());
        }

        let mut state = SagaState::new(correlation_id, envelope.data.clone(), self.config.timeout);

        info!(
            correlation_id = %correlation_id,
            order_id = %state.order_id,
            timeout_at = %state.timeout_at,
            "Saga started"
        );
        self.metrics.started.inc();

        state.status = SagaStatus::ReservingInventory;
        state.current_step = Some(SagaStep::ReserveInventory);
        state.touch();

        let request = self.staged(
            &state,
            topics::INVENTORY_RESERVE_REQUESTED,
            InventoryReserveRequested {
                order_id: state.order_id.clone(),
                items: state.order_snapshot.items.clone(),
            },
            Some(envelope.id),
        )?;

        self.store.save(&state).await?;
        self.sink.stage(vec![request]).await?;

        Ok(())
    }

    /// Validate and apply a participant response.
    ///
    /// The validation pipeline runs in order: orphan check, terminal check,
    /// expected-status check, lazy timeout check. Anything that fails
    /// validation is discarded without mutating state.
    async fn handle_reply(&self, event: SagaEvent) -> AppResult<()> {
        let correlation_id = event.correlation_id();

        let Some(mut state) = self.store.load(correlation_id).await? else {
            warn!(
                correlation_id = %correlation_id,
                event_type = %event.event_type(),
                "Orphan event: no saga state, discarding"
            );
            return Ok(());
        };

        if state.is_terminal() {
            debug!(
                correlation_id = %correlation_id,
                event_type = %event.event_type(),
                status = ?state.status,
                "Event for terminal saga, discarding"
            );
            return Ok(());
        }

        // Compensation is triggered at most once per saga.
        if state.status == SagaStatus::Compensating {
            warn!(
                correlation_id = %correlation_id,
                event_type = %event.event_type(),
                "Saga already compensating, discarding"
            );
            return Ok(());
        }

        if let Some(expected) = expected_status(&event) {
            if state.status != expected {
                warn!(
                    correlation_id = %correlation_id,
                    event_type = %event.event_type(),
                    status = ?state.status,
                    expected = ?expected,
                    "Out of sequence event, discarding"
                );
                return Ok(());
            }
        }

        if state.is_timed_out(Utc::now()) {
            warn!(
                correlation_id = %correlation_id,
                timeout_at = %state.timeout_at,
                "Saga timed out, forcing compensation and discarding the event"
            );
            state.status = SagaStatus::TimedOut;
            state.failed_at = Some(Utc::now());
            state.touch();
            self.store.save(&state).await?;
            return self
                .compensate(state, "Saga timed out".to_string(), event.event_id())
                .await;
        }

        match event {
            SagaEvent::InventoryReserved(envelope) => {
                self.on_inventory_reserved(state, envelope.id).await
            }
            SagaEvent::PaymentCompleted(envelope) => {
                state.payment_id = Some(envelope.data.payment_id.clone());
                self.on_payment_completed(state, envelope.id).await
            }
            SagaEvent::OrderConfirmed(envelope) => self.on_order_confirmed(state, envelope.id).await,
            SagaEvent::InventoryReservationFailed(envelope) => {
                let reason = format!("Inventory reservation failed: {}", envelope.data.reason);
                self.compensate(state, reason, envelope.id).await
            }
            SagaEvent::PaymentFailed(envelope) => {
                let reason = format!("Payment failed: {}", envelope.data.reason);
                self.compensate(state, reason, envelope.id).await
            }
            SagaEvent::OrderCreated(_) => {
                debug!(correlation_id = %correlation_id, "Unexpected start event in reply path");
                Ok(())
            }
        }
    }

    /// Inventory held: move on to payment.
    async fn on_inventory_reserved(&self, mut state: SagaState, cause: Uuid) -> AppResult<()> {
        state.complete_step(SagaStep::ReserveInventory);
        state.status = SagaStatus::ProcessingPayment;
        state.current_step = Some(SagaStep::ProcessPayment);

        let snapshot = &state.order_snapshot;
        let initiate = self.staged(
            &state,
            topics::PAYMENTS_INITIATED,
            PaymentInitiated {
                order_id: state.order_id.clone(),
                customer_id: state.customer_id.clone(),
                amount: snapshot.total_amount,
                currency: snapshot.currency.clone(),
                payment_method: snapshot.payment_method.clone(),
            },
            Some(cause),
        )?;

        self.store.save(&state).await?;
        self.sink.stage(vec![initiate]).await?;

        Ok(())
    }

    /// Payment captured: confirm the order.
    async fn on_payment_completed(&self, mut state: SagaState, cause: Uuid) -> AppResult<()> {
        state.complete_step(SagaStep::ProcessPayment);
        state.status = SagaStatus::Confirming;
        state.current_step = Some(SagaStep::ConfirmOrder);

        let confirm = self.staged(
            &state,
            topics::ORDERS_CONFIRMED,
            OrderConfirmed {
                order_id: state.order_id.clone(),
                customer_id: state.customer_id.clone(),
            },
            Some(cause),
        )?;

        self.store.save(&state).await?;
        self.sink.stage(vec![confirm]).await?;

        Ok(())
    }

    /// Order confirmed: fire the customer notification and complete.
    ///
    /// There is no intermediate status for SEND_NOTIFICATION; the saga does
    /// not wait for the notification service.
    async fn on_order_confirmed(&self, mut state: SagaState, cause: Uuid) -> AppResult<()> {
        state.complete_step(SagaStep::ConfirmOrder);
        state.current_step = Some(SagaStep::SendNotification);

        let mut variables = HashMap::new();
        variables.insert("orderId".to_string(), state.order_id.clone());
        variables.insert(
            "totalAmount".to_string(),
            state.order_snapshot.total_amount.to_string(),
        );

        let notify = self.staged(
            &state,
            topics::NOTIFICATIONS_SEND,
            NotificationSend {
                customer_id: state.customer_id.clone(),
                channel: NOTIFICATION_CHANNEL.to_string(),
                template_id: templates::ORDER_CONFIRMED.to_string(),
                variables,
            },
            Some(cause),
        )?;

        state.complete_step(SagaStep::SendNotification);
        state.status = SagaStatus::Completed;
        state.current_step = None;
        state.completed_at = Some(Utc::now());

        self.store.save(&state).await?;
        self.sink.stage(vec![notify]).await?;

        info!(
            correlation_id = %state.correlation_id,
            order_id = %state.order_id,
            "Saga completed"
        );
        self.metrics.completed.inc();
        self.observe_duration(&state);
        self.store
            .schedule_delete(state.correlation_id, self.config.grace)
            .await?;

        Ok(())
    }

    /// Unwind completed steps in reverse order, then cancel the order and
    /// notify the customer.
    ///
    /// Compensation maps 1:1 onto `completed_steps`: a step that never
    /// completed is never compensated, and the reverse order guarantees the
    /// refund is emitted before stock is released.
    async fn compensate(
        &self,
        mut state: SagaState,
        reason: String,
        cause: Uuid,
    ) -> AppResult<()> {
        info!(
            correlation_id = %state.correlation_id,
            order_id = %state.order_id,
            reason = %reason,
            completed_steps = ?state.completed_steps,
            "Entering compensation"
        );

        state.status = SagaStatus::Compensating;
        state.failure_reason = Some(reason.clone());
        if state.failed_at.is_none() {
            state.failed_at = Some(Utc::now());
        }
        state.current_step = None;
        state.touch();
        self.store.save(&state).await?;
        self.metrics.compensating.inc();

        let mut records = Vec::new();

        for step in state.completed_steps.iter().rev() {
            match step {
                SagaStep::ReserveInventory => {
                    records.push(self.staged(
                        &state,
                        topics::INVENTORY_RELEASED,
                        InventoryReleased {
                            order_id: state.order_id.clone(),
                            items: state.order_snapshot.items.clone(),
                        },
                        Some(cause),
                    )?);
                }
                SagaStep::ProcessPayment => {
                    if let Some(payment_id) = &state.payment_id {
                        records.push(self.staged(
                            &state,
                            topics::PAYMENTS_REFUNDED,
                            PaymentRefunded {
                                order_id: state.order_id.clone(),
                                payment_id: payment_id.clone(),
                                amount: state.order_snapshot.total_amount,
                                currency: state.order_snapshot.currency.clone(),
                            },
                            Some(cause),
                        )?);
                    } else {
                        warn!(
                            correlation_id = %state.correlation_id,
                            "Payment step completed without a stored payment id, skipping refund"
                        );
                    }
                }
                // Idempotent steps with no external effect to undo.
                SagaStep::ConfirmOrder | SagaStep::SendNotification => {}
            }
        }

        records.push(self.staged(
            &state,
            topics::ORDERS_CANCELLED,
            OrderCancelled {
                order_id: state.order_id.clone(),
                customer_id: state.customer_id.clone(),
                reason: reason.clone(),
            },
            Some(cause),
        )?);

        let mut variables = HashMap::new();
        variables.insert("orderId".to_string(), state.order_id.clone());
        variables.insert("reason".to_string(), reason.clone());
        records.push(self.staged(
            &state,
            topics::NOTIFICATIONS_SEND,
            NotificationSend {
                customer_id: state.customer_id.clone(),
                channel: NOTIFICATION_CHANNEL.to_string(),
                template_id: templates::ORDER_CANCELLED.to_string(),
                variables,
            },
            Some(cause),
        )?);

        self.sink.stage(records).await?;

        state.status = SagaStatus::Compensated;
        state.touch();
        self.store.save(&state).await?;

        info!(
            correlation_id = %state.correlation_id,
            order_id = %state.order_id,
            "Saga compensated"
        );
        self.metrics.compensated.inc();
        self.observe_duration(&state);
        self.store
            .schedule_delete(state.correlation_id, self.config.grace)
            .await?;

        Ok(())
    }

    /// Build an outbox record for an outbound event of this saga.
    fn staged<T: Serialize>(
        &self,
        state: &SagaState,
        topic: &'static str,
        data: T,
        cause: Option<Uuid>,
    ) -> AppResult<OutboxRecord> {
        let mut envelope = EventEnvelope::new(
            topic,
            sources::ORDER_ORCHESTRATOR,
            state.correlation_id,
            data,
        );
        if let Some(causation_id) = cause {
            envelope = envelope.caused_by(causation_id);
        }
        Ok(OutboxRecord::from_envelope(
            &state.order_id,
            AGGREGATE_TYPE,
            topic,
            &envelope,
        )?)
    }

    fn observe_duration(&self, state: &SagaState) {
        let elapsed = Utc::now().signed_duration_since(state.started_at);
        let seconds = (elapsed.num_milliseconds().max(0) as f64) / 1_000.0;
        self.metrics.duration.observe(seconds);
    }
}

/// Expected current status for a response event.
///
/// `None` means any non-terminal status is acceptable (failure triggers).
fn expected_status(event: &SagaEvent) -> Option<SagaStatus> {
    match event {
        SagaEvent::InventoryReserved(_) => Some(SagaStatus::ReservingInventory),
        SagaEvent::PaymentCompleted(_) => Some(SagaStatus::ProcessingPayment),
        SagaEvent::OrderConfirmed(_) => Some(SagaStatus::Confirming),
        SagaEvent::InventoryReservationFailed(_)
        | SagaEvent::PaymentFailed(_)
        | SagaEvent::OrderCreated(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use event_schema::events::{InventoryReservationFailed, InventoryReserved, PaymentCompleted};
    use rust_decimal::Decimal;
    use std::sync::Mutex;

    struct InMemoryStore {
        states: Mutex<HashMap<Uuid, SagaState>>,
        scheduled: Mutex<Vec<(Uuid, Duration)>>,
    }

    impl InMemoryStore {
        fn new() -> Self {
            Self {
                states: Mutex::new(HashMap::new()),
                scheduled: Mutex::new(Vec::new()),
            }
        }

        fn get(&self, correlation_id: Uuid) -> Option<SagaState> {
            self.states.lock().unwrap().get(&correlation_id).cloned()
        }

        fn put(&self, state: SagaState) {
            self.states
                .lock()
                .unwrap()
                .insert(state.correlation_id, state);
        }
    }

    #[async_trait]
    impl SagaStore for &InMemoryStore {
        async fn save(&self, state: &SagaState) -> AppResult<()> {
            self.put(state.clone());
            Ok(())
        }

        async fn load(&self, correlation_id: Uuid) -> AppResult<Option<SagaState>> {
            Ok(self.get(correlation_id))
        }

        async fn delete(&self, correlation_id: Uuid) -> AppResult<()> {
            self.states.lock().unwrap().remove(&correlation_id);
            Ok(())
        }

        async fn schedule_delete(&self, correlation_id: Uuid, delay: Duration) -> AppResult<()> {
            self.scheduled.lock().unwrap().push((correlation_id, delay));
            Ok(())
        }
    }

    struct RecordingSink {
        staged: Mutex<Vec<OutboxRecord>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                staged: Mutex::new(Vec::new()),
            }
        }

        fn topics(&self) -> Vec<String> {
            self.staged
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.topic.clone())
                .collect()
        }
    }

    #[async_trait]
    impl EventSink for &RecordingSink {
        async fn stage(&self, records: Vec<OutboxRecord>) -> AppResult<()> {
            self.staged.lock().unwrap().extend(records);
            Ok(())
        }
    }

    fn orchestrator<'a>(
        store: &'a InMemoryStore,
        sink: &'a RecordingSink,
    ) -> SagaOrchestrator<&'a InMemoryStore, &'a RecordingSink> {
        SagaOrchestrator::new(
            store,
            sink,
            SagaConfig::default(),
            SagaMetrics::new("order-orchestrator-test"),
        )
    }

    fn sample_order() -> OrderCreated {
        OrderCreated {
            order_id: "ord_test_001".to_string(),
            customer_id: "cust_1".to_string(),
            items: vec![event_schema::events::OrderItem {
                product_id: "prod_1".to_string(),
                quantity: 2,
                unit_price: Decimal::new(4999, 2),
            }],
            total_amount: Decimal::new(9998, 2),
            currency: "USD".to_string(),
            payment_method: "card".to_string(),
            shipping_address: "1 Main St".to_string(),
        }
    }

    fn order_created(correlation_id: Uuid) -> SagaEvent {
        SagaEvent::OrderCreated(EventEnvelope::new(
            topics::ORDERS_CREATED,
            "/services/order-service",
            correlation_id,
            sample_order(),
        ))
    }

    fn inventory_reserved(correlation_id: Uuid) -> SagaEvent {
        SagaEvent::InventoryReserved(EventEnvelope::new(
            topics::INVENTORY_RESERVED,
            sources::INVENTORY_SERVICE,
            correlation_id,
            InventoryReserved {
                order_id: "ord_test_001".to_string(),
                items: sample_order().items,
            },
        ))
    }

    fn payment_completed(correlation_id: Uuid, payment_id: &str) -> SagaEvent {
        SagaEvent::PaymentCompleted(EventEnvelope::new(
            topics::PAYMENTS_COMPLETED,
            sources::PAYMENT_SERVICE,
            correlation_id,
            PaymentCompleted {
                order_id: "ord_test_001".to_string(),
                payment_id: payment_id.to_string(),
                amount: Decimal::new(9998, 2),
                currency: "USD".to_string(),
            },
        ))
    }

    fn order_confirmed(correlation_id: Uuid) -> SagaEvent {
        SagaEvent::OrderConfirmed(EventEnvelope::new(
            topics::ORDERS_CONFIRMED,
            sources::ORDER_ORCHESTRATOR,
            correlation_id,
            OrderConfirmed {
                order_id: "ord_test_001".to_string(),
                customer_id: "cust_1".to_string(),
            },
        ))
    }

    fn reservation_failed(correlation_id: Uuid, reason: &str) -> SagaEvent {
        SagaEvent::InventoryReservationFailed(EventEnvelope::new(
            topics::INVENTORY_RESERVATION_FAILED,
            sources::INVENTORY_SERVICE,
            correlation_id,
            InventoryReservationFailed {
                order_id: "ord_test_001".to_string(),
                reason: reason.to_string(),
                insufficient_product_ids: vec!["prod_1".to_string()],
            },
        ))
    }

    fn payment_failed(correlation_id: Uuid, reason: &str) -> SagaEvent {
        SagaEvent::PaymentFailed(EventEnvelope::new(
            topics::PAYMENTS_FAILED,
            sources::PAYMENT_SERVICE,
            correlation_id,
            event_schema::events::PaymentFailed {
                order_id: "ord_test_001".to_string(),
                reason: reason.to_string(),
            },
        ))
    }

    #[tokio::test]
    async fn test_happy_path_reaches_completed() {
        let store = InMemoryStore::new();
        let sink = RecordingSink::new();
        let saga = orchestrator(&store, &sink);
        let correlation_id = Uuid::new_v4();

        saga.handle_event(order_created(correlation_id)).await.unwrap();
        saga.handle_event(inventory_reserved(correlation_id))
            .await
            .unwrap();
        saga.handle_event(payment_completed(correlation_id, "pay_1"))
            .await
            .unwrap();
        saga.handle_event(order_confirmed(correlation_id))
            .await
            .unwrap();

        let state = store.get(correlation_id).unwrap();
        assert_eq!(state.status, SagaStatus::Completed);
        assert_eq!(state.completed_steps, SagaStep::SEQUENCE.to_vec());
        assert_eq!(state.payment_id.as_deref(), Some("pay_1"));
        assert!(state.completed_at.is_some());

        assert_eq!(
            sink.topics(),
            vec![
                topics::INVENTORY_RESERVE_REQUESTED,
                topics::PAYMENTS_INITIATED,
                topics::ORDERS_CONFIRMED,
                topics::NOTIFICATIONS_SEND,
            ]
        );

        // Terminal saga is kept around briefly for debugging.
        assert_eq!(store.scheduled.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_orphan_event_is_discarded() {
        let store = InMemoryStore::new();
        let sink = RecordingSink::new();
        let saga = orchestrator(&store, &sink);

        saga.handle_event(inventory_reserved(Uuid::new_v4()))
            .await
            .unwrap();

        assert!(sink.topics().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_sequence_event_is_discarded() {
        let store = InMemoryStore::new();
        let sink = RecordingSink::new();
        let saga = orchestrator(&store, &sink);
        let correlation_id = Uuid::new_v4();

        saga.handle_event(order_created(correlation_id)).await.unwrap();
        // Saga is RESERVING_INVENTORY; a payment completion is premature.
        saga.handle_event(payment_completed(correlation_id, "pay_1"))
            .await
            .unwrap();

        let state = store.get(correlation_id).unwrap();
        assert_eq!(state.status, SagaStatus::ReservingInventory);
        assert!(state.completed_steps.is_empty());
        assert_eq!(sink.topics(), vec![topics::INVENTORY_RESERVE_REQUESTED]);
    }

    #[tokio::test]
    async fn test_duplicate_reply_advances_once() {
        let store = InMemoryStore::new();
        let sink = RecordingSink::new();
        let saga = orchestrator(&store, &sink);
        let correlation_id = Uuid::new_v4();

        saga.handle_event(order_created(correlation_id)).await.unwrap();
        saga.handle_event(inventory_reserved(correlation_id))
            .await
            .unwrap();
        saga.handle_event(inventory_reserved(correlation_id))
            .await
            .unwrap();

        let initiated = sink
            .topics()
            .iter()
            .filter(|t| t.as_str() == topics::PAYMENTS_INITIATED)
            .count();
        assert_eq!(initiated, 1);

        let state = store.get(correlation_id).unwrap();
        assert_eq!(state.completed_steps, vec![SagaStep::ReserveInventory]);
    }

    #[tokio::test]
    async fn test_event_after_terminal_state_is_discarded() {
        let store = InMemoryStore::new();
        let sink = RecordingSink::new();
        let saga = orchestrator(&store, &sink);
        let correlation_id = Uuid::new_v4();

        saga.handle_event(order_created(correlation_id)).await.unwrap();
        saga.handle_event(reservation_failed(correlation_id, "Out of stock"))
            .await
            .unwrap();
        let staged_before = sink.topics().len();

        saga.handle_event(payment_failed(correlation_id, "Declined"))
            .await
            .unwrap();

        let state = store.get(correlation_id).unwrap();
        assert_eq!(state.status, SagaStatus::Compensated);
        assert_eq!(sink.topics().len(), staged_before, "no further emits");
    }

    #[tokio::test]
    async fn test_compensation_with_no_completed_steps() {
        let store = InMemoryStore::new();
        let sink = RecordingSink::new();
        let saga = orchestrator(&store, &sink);
        let correlation_id = Uuid::new_v4();

        saga.handle_event(order_created(correlation_id)).await.unwrap();
        saga.handle_event(reservation_failed(correlation_id, "Out of stock"))
            .await
            .unwrap();

        let state = store.get(correlation_id).unwrap();
        assert_eq!(state.status, SagaStatus::Compensated);
        assert!(state
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("Out of stock"));

        let staged = sink.topics();
        assert!(!staged.contains(&topics::INVENTORY_RELEASED.to_string()));
        assert!(!staged.contains(&topics::PAYMENTS_REFUNDED.to_string()));
        assert_eq!(
            &staged[1..],
            &[
                topics::ORDERS_CANCELLED.to_string(),
                topics::NOTIFICATIONS_SEND.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_full_chain_rollback_is_reverse_ordered() {
        let store = InMemoryStore::new();
        let sink = RecordingSink::new();
        let saga = orchestrator(&store, &sink);
        let correlation_id = Uuid::new_v4();

        saga.handle_event(order_created(correlation_id)).await.unwrap();
        saga.handle_event(inventory_reserved(correlation_id))
            .await
            .unwrap();
        saga.handle_event(payment_completed(correlation_id, "pay_7"))
            .await
            .unwrap();
        saga.handle_event(payment_failed(correlation_id, "Chargeback"))
            .await
            .unwrap();

        let staged = sink.topics();
        let compensation = &staged[3..];
        assert_eq!(
            compensation,
            &[
                topics::PAYMENTS_REFUNDED.to_string(),
                topics::INVENTORY_RELEASED.to_string(),
                topics::ORDERS_CANCELLED.to_string(),
                topics::NOTIFICATIONS_SEND.to_string(),
            ],
            "refund must precede release"
        );

        let staged_records = sink.staged.lock().unwrap();
        assert_eq!(staged_records[3].payload["data"]["paymentId"], "pay_7");
    }

    #[tokio::test]
    async fn test_timed_out_saga_compensates_and_discards_event() {
        let store = InMemoryStore::new();
        let sink = RecordingSink::new();
        let saga = orchestrator(&store, &sink);
        let correlation_id = Uuid::new_v4();

        saga.handle_event(order_created(correlation_id)).await.unwrap();

        // Force the deadline into the past.
        let mut state = store.get(correlation_id).unwrap();
        state.timeout_at = Utc::now() - chrono::Duration::seconds(1);
        store.put(state);

        saga.handle_event(inventory_reserved(correlation_id))
            .await
            .unwrap();

        let state = store.get(correlation_id).unwrap();
        assert_eq!(state.status, SagaStatus::Compensated);
        assert_eq!(state.failure_reason.as_deref(), Some("Saga timed out"));
        // The triggering event was discarded: the step never completed.
        assert!(state.completed_steps.is_empty());
        assert!(!sink.topics().contains(&topics::PAYMENTS_INITIATED.to_string()));
    }

    #[tokio::test]
    async fn test_duplicate_start_is_discarded() {
        let store = InMemoryStore::new();
        let sink = RecordingSink::new();
        let saga = orchestrator(&store, &sink);
        let correlation_id = Uuid::new_v4();

        saga.handle_event(order_created(correlation_id)).await.unwrap();
        saga.handle_event(order_created(correlation_id)).await.unwrap();

        assert_eq!(sink.topics(), vec![topics::INVENTORY_RESERVE_REQUESTED]);
    }

    #[tokio::test]
    async fn test_outbound_events_carry_causation_and_correlation() {
        let store = InMemoryStore::new();
        let sink = RecordingSink::new();
        let saga = orchestrator(&store, &sink);
        let correlation_id = Uuid::new_v4();

        let start = order_created(correlation_id);
        let start_id = start.event_id();
        saga.handle_event(start).await.unwrap();

        let staged = sink.staged.lock().unwrap();
        let request = &staged[0];
        assert_eq!(
            request.payload["correlationId"],
            correlation_id.to_string()
        );
        assert_eq!(request.payload["causationId"], start_id.to_string());
    }
}
