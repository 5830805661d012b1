//! Reserve and release handlers.
//!
//! Reservation runs in one transaction with the outbox append, so the stock
//! mutation and the response event commit together. An insufficient product
//! rolls the whole transaction back, which also releases the in-attempt
//! partial reservations, and the failure event is staged on its own.

use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use event_schema::events::{
    InventoryReleased, InventoryReservationFailed, InventoryReserveRequested, InventoryReserved,
    OrderItem,
};
use event_schema::{sources, topics, EventEnvelope};
use transactional_outbox::{OutboxRecord, SqlxOutboxRepository};

use crate::error::AppResult;
use crate::models::ReservationStatus;
use crate::repository::InventoryRepository;

const AGGREGATE_TYPE: &str = "inventory";

/// Backoff before optimistic-lock retry `attempt` (1-based): 10, 20, 30 ms.
fn lock_backoff(attempt: u32) -> Duration {
    Duration::from_millis(10 * attempt as u64)
}

pub struct InventoryService {
    pool: PgPool,
    outbox: Arc<SqlxOutboxRepository>,
    lock_max_retries: u32,
}

impl InventoryService {
    pub fn new(pool: PgPool, outbox: Arc<SqlxOutboxRepository>, lock_max_retries: u32) -> Self {
        Self {
            pool,
            outbox,
            lock_max_retries,
        }
    }

    /// Handle `inventory.reserve-requested`.
    ///
    /// Emits exactly one response per accepted request: `inventory.reserved`
    /// on success, `inventory.reservation-failed` naming every offending
    /// product otherwise.
    pub async fn reserve(
        &self,
        envelope: &EventEnvelope<InventoryReserveRequested>,
    ) -> AppResult<()> {
        let request = &envelope.data;
        let order_id = &request.order_id;

        let mut tx = self.pool.begin().await?;

        // Idempotent by order id: a replayed request re-emits the stored
        // outcome instead of double-reserving.
        if let Some(existing) = InventoryRepository::get_reservation(&mut tx, order_id).await? {
            debug!(
                order_id = %order_id,
                status = ?existing.status,
                "Reservation already exists, re-emitting stored result"
            );
            if existing.status == ReservationStatus::Reserved {
                let response = self.reserved_event(envelope, existing.items.clone())?;
                self.outbox.append(&mut tx, &response).await?;
            }
            tx.commit().await?;
            return Ok(());
        }

        let mut insufficient: Vec<String> = Vec::new();
        for item in &request.items {
            if !self.reserve_product(&mut tx, item).await? {
                insufficient.push(item.product_id.clone());
            }
        }

        if insufficient.is_empty() {
            InventoryRepository::insert_reservation(&mut tx, order_id, &request.items).await?;
            let response = self.reserved_event(envelope, request.items.clone())?;
            self.outbox.append(&mut tx, &response).await?;
            tx.commit().await?;

            info!(order_id = %order_id, items = request.items.len(), "Inventory reserved");
            return Ok(());
        }

        // Roll back the partial holds, then stage the failure on its own.
        tx.rollback().await?;

        warn!(
            order_id = %order_id,
            insufficient = ?insufficient,
            "Insufficient stock, reservation failed"
        );

        let reason = format!("Insufficient stock for products: {}", insufficient.join(", "));
        let failure = EventEnvelope::new(
            topics::INVENTORY_RESERVATION_FAILED,
            sources::INVENTORY_SERVICE,
            envelope.correlation_id,
            InventoryReservationFailed {
                order_id: order_id.clone(),
                reason,
                insufficient_product_ids: insufficient,
            },
        )
        .caused_by(envelope.id);
        let record = OutboxRecord::from_envelope(
            order_id,
            AGGREGATE_TYPE,
            topics::INVENTORY_RESERVATION_FAILED,
            &failure,
        )?;

        let mut tx = self.pool.begin().await?;
        self.outbox.append(&mut tx, &record).await?;
        tx.commit().await?;

        Ok(())
    }

    /// Reserve one product under optimistic concurrency.
    ///
    /// Returns false once the product is definitively insufficient (missing,
    /// sold out, or still conflicted after the bounded retries).
    async fn reserve_product(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        item: &OrderItem,
    ) -> AppResult<bool> {
        let quantity = item.quantity as i32;

        let mut attempt = 0u32;
        loop {
            let Some(product) = InventoryRepository::get_product(tx, &item.product_id).await?
            else {
                warn!(product_id = %item.product_id, "Unknown product");
                return Ok(false);
            };

            if product.available < quantity {
                return Ok(false);
            }

            if InventoryRepository::try_reserve(tx, &item.product_id, quantity, product.version)
                .await?
            {
                return Ok(true);
            }

            attempt += 1;
            if attempt > self.lock_max_retries {
                warn!(
                    product_id = %item.product_id,
                    attempts = attempt,
                    "Version conflicts exhausted retries, reporting insufficient stock"
                );
                return Ok(false);
            }

            debug!(
                product_id = %item.product_id,
                attempt,
                "Version conflict, retrying"
            );
            tokio::time::sleep(lock_backoff(attempt)).await;
        }
    }

    /// Handle `inventory.released` (compensation).
    ///
    /// Idempotent by order id: an already-released reservation is a no-op,
    /// and quantities come from the stored reservation rather than the event.
    pub async fn release(&self, envelope: &EventEnvelope<InventoryReleased>) -> AppResult<()> {
        let order_id = &envelope.data.order_id;

        let mut tx = self.pool.begin().await?;

        let Some(reservation) = InventoryRepository::get_reservation(&mut tx, order_id).await?
        else {
            warn!(order_id = %order_id, "Release for unknown reservation, ignoring");
            tx.commit().await?;
            return Ok(());
        };

        if reservation.status == ReservationStatus::Released {
            debug!(order_id = %order_id, "Reservation already released");
            tx.commit().await?;
            return Ok(());
        }

        for item in &reservation.items {
            InventoryRepository::release_product(&mut tx, &item.product_id, item.quantity as i32)
                .await?;
        }
        InventoryRepository::mark_reservation_released(&mut tx, order_id).await?;

        tx.commit().await?;

        info!(order_id = %order_id, "Reservation released");
        Ok(())
    }

    fn reserved_event(
        &self,
        request: &EventEnvelope<InventoryReserveRequested>,
        items: Vec<OrderItem>,
    ) -> AppResult<OutboxRecord> {
        let response = EventEnvelope::new(
            topics::INVENTORY_RESERVED,
            sources::INVENTORY_SERVICE,
            request.correlation_id,
            InventoryReserved {
                order_id: request.data.order_id.clone(),
                items,
            },
        )
        .caused_by(request.id);

        Ok(OutboxRecord::from_envelope(
            &request.data.order_id,
            AGGREGATE_TYPE,
            topics::INVENTORY_RESERVED,
            &response,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_backoff_schedule() {
        assert_eq!(lock_backoff(1), Duration::from_millis(10));
        assert_eq!(lock_backoff(2), Duration::from_millis(20));
        assert_eq!(lock_backoff(3), Duration::from_millis(30));
    }
}
