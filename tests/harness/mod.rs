//! Shared fixtures for the saga scenario tests: in-memory implementations of
//! the orchestrator's store and sink seams, plus event constructors.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use event_schema::events::{
    InventoryReservationFailed, InventoryReserved, OrderConfirmed, OrderCreated, OrderItem,
    PaymentCompleted, PaymentFailed,
};
use event_schema::{sources, topics, EventEnvelope, SagaEvent};
use transactional_outbox::OutboxRecord;

use order_orchestrator::error::AppResult;
use order_orchestrator::events::EventSink;
use order_orchestrator::metrics::SagaMetrics;
use order_orchestrator::saga::{SagaConfig, SagaOrchestrator, SagaState, SagaStore};

pub const ORDER_ID: &str = "ord_test_001";
pub const CUSTOMER_ID: &str = "cust_42";

#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    states: Arc<Mutex<HashMap<Uuid, SagaState>>>,
    pub scheduled_deletes: Arc<Mutex<Vec<(Uuid, Duration)>>>,
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, correlation_id: Uuid) -> Option<SagaState> {
        self.states.lock().unwrap().get(&correlation_id).cloned()
    }

    pub fn put(&self, state: SagaState) {
        self.states
            .lock()
            .unwrap()
            .insert(state.correlation_id, state);
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
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
        self.scheduled_deletes
            .lock()
            .unwrap()
            .push((correlation_id, delay));
        Ok(())
    }
}

/// Captures every staged outbox record in staging order.
#[derive(Clone, Default)]
pub struct RecordingSink {
    pub staged: Arc<Mutex<Vec<OutboxRecord>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topics(&self) -> Vec<String> {
        self.staged
            .lock()
            .unwrap()
            .iter()
            .map(|record| record.topic.clone())
            .collect()
    }

    pub fn records(&self) -> Vec<OutboxRecord> {
        self.staged.lock().unwrap().clone()
    }

    /// Staged payloads for one topic.
    pub fn payloads_for(&self, topic: &str) -> Vec<serde_json::Value> {
        self.staged
            .lock()
            .unwrap()
            .iter()
            .filter(|record| record.topic == topic)
            .map(|record| record.payload.clone())
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn stage(&self, records: Vec<OutboxRecord>) -> AppResult<()> {
        self.staged.lock().unwrap().extend(records);
        Ok(())
    }
}

pub struct SagaFixture {
    pub store: InMemorySagaStore,
    pub sink: RecordingSink,
    pub orchestrator: SagaOrchestrator<InMemorySagaStore, RecordingSink>,
}

pub fn fixture() -> SagaFixture {
    let store = InMemorySagaStore::new();
    let sink = RecordingSink::new();
    let orchestrator = SagaOrchestrator::new(
        store.clone(),
        sink.clone(),
        SagaConfig::default(),
        SagaMetrics::new("saga-scenario-tests"),
    );
    SagaFixture {
        store,
        sink,
        orchestrator,
    }
}

pub fn dec(value: &str) -> Decimal {
    value.parse().unwrap()
}

pub fn order_items() -> Vec<OrderItem> {
    vec![OrderItem {
        product_id: "prod_1".to_string(),
        quantity: 2,
        unit_price: dec("49.99"),
    }]
}

pub fn order_created(correlation_id: Uuid) -> SagaEvent {
    SagaEvent::OrderCreated(EventEnvelope::new(
        topics::ORDERS_CREATED,
        "/services/order-service",
        correlation_id,
        OrderCreated {
            order_id: ORDER_ID.to_string(),
            customer_id: CUSTOMER_ID.to_string(),
            items: order_items(),
            total_amount: dec("99.98"),
            currency: "USD".to_string(),
            payment_method: "card".to_string(),
            shipping_address: "1 Main St, Springfield".to_string(),
        },
    ))
}

pub fn inventory_reserved(correlation_id: Uuid) -> SagaEvent {
    SagaEvent::InventoryReserved(EventEnvelope::new(
        topics::INVENTORY_RESERVED,
        sources::INVENTORY_SERVICE,
        correlation_id,
        InventoryReserved {
            order_id: ORDER_ID.to_string(),
            items: order_items(),
        },
    ))
}

pub fn reservation_failed(correlation_id: Uuid, reason: &str) -> SagaEvent {
    SagaEvent::InventoryReservationFailed(EventEnvelope::new(
        topics::INVENTORY_RESERVATION_FAILED,
        sources::INVENTORY_SERVICE,
        correlation_id,
        InventoryReservationFailed {
            order_id: ORDER_ID.to_string(),
            reason: reason.to_string(),
            insufficient_product_ids: vec!["prod_1".to_string()],
        },
    ))
}

pub fn payment_completed(correlation_id: Uuid, payment_id: &str) -> SagaEvent {
    SagaEvent::PaymentCompleted(EventEnvelope::new(
        topics::PAYMENTS_COMPLETED,
        sources::PAYMENT_SERVICE,
        correlation_id,
        PaymentCompleted {
            order_id: ORDER_ID.to_string(),
            payment_id: payment_id.to_string(),
            amount: dec("99.98"),
            currency: "USD".to_string(),
        },
    ))
}

pub fn payment_failed(correlation_id: Uuid, reason: &str) -> SagaEvent {
    SagaEvent::PaymentFailed(EventEnvelope::new(
        topics::PAYMENTS_FAILED,
        sources::PAYMENT_SERVICE,
        correlation_id,
        PaymentFailed {
            order_id: ORDER_ID.to_string(),
            reason: reason.to_string(),
        },
    ))
}

pub fn order_confirmed(correlation_id: Uuid) -> SagaEvent {
    SagaEvent::OrderConfirmed(EventEnvelope::new(
        topics::ORDERS_CONFIRMED,
        sources::ORDER_ORCHESTRATOR,
        correlation_id,
        OrderConfirmed {
            order_id: ORDER_ID.to_string(),
            customer_id: CUSTOMER_ID.to_string(),
        },
    ))
}
