//! Process and refund handlers.
//!
//! Processing is idempotent by order id: a payment row either exists and its
//! stored outcome is re-emitted, or the gateway is attempted once and the row
//! plus the outcome event commit together. Refunds are idempotent by payment
//! id.

use sqlx::PgPool;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use event_schema::events::{PaymentCompleted, PaymentFailed, PaymentInitiated, PaymentRefunded};
use event_schema::{sources, topics, EventEnvelope};
use transactional_outbox::{OutboxRecord, SqlxOutboxRepository};

use crate::error::{AppError, AppResult};
use crate::gateway::{ChargeOutcome, ChargeRequest, PaymentGateway};
use crate::models::{Payment, PaymentStatus, Refund};
use crate::repository::PaymentRepository;

const AGGREGATE_TYPE: &str = "payment";

pub struct PaymentService<G: PaymentGateway> {
    pool: PgPool,
    outbox: Arc<SqlxOutboxRepository>,
    gateway: G,
}

impl<G: PaymentGateway> PaymentService<G> {
    pub fn new(pool: PgPool, outbox: Arc<SqlxOutboxRepository>, gateway: G) -> Self {
        Self {
            pool,
            outbox,
            gateway,
        }
    }

    /// Handle `payments.initiated`.
    pub async fn process(&self, envelope: &EventEnvelope<PaymentInitiated>) -> AppResult<()> {
        let request = &envelope.data;
        let order_id = &request.order_id;

        {
            let mut tx = self.pool.begin().await?;
            if let Some(existing) =
                PaymentRepository::get_payment_by_order(&mut tx, order_id).await?
            {
                debug!(
                    order_id = %order_id,
                    payment_id = %existing.payment_id,
                    status = ?existing.status,
                    "Payment already attempted, re-emitting stored result"
                );
                let record = self.outcome_event(envelope, &existing)?;
                self.outbox.append(&mut tx, &record).await?;
                tx.commit().await?;
                return Ok(());
            }
            tx.commit().await?;
        }

        // The gateway call sits outside any transaction; a crash after the
        // charge but before the commit is absorbed by the exists-check above
        // on redelivery.
        let outcome = self
            .gateway
            .charge(&ChargeRequest {
                order_id: order_id.clone(),
                customer_id: request.customer_id.clone(),
                amount: request.amount,
                currency: request.currency.clone(),
                payment_method: request.payment_method.clone(),
            })
            .await
            .map_err(|e| AppError::Gateway(e.to_string()))?;

        let payment = match outcome {
            ChargeOutcome::Approved { gateway_reference } => {
                info!(
                    order_id = %order_id,
                    gateway_reference = %gateway_reference,
                    "Payment approved"
                );
                Payment {
                    payment_id: format!("pay_{}", Uuid::new_v4().simple()),
                    order_id: order_id.clone(),
                    customer_id: request.customer_id.clone(),
                    amount: request.amount,
                    currency: request.currency.clone(),
                    status: PaymentStatus::Completed,
                    failure_reason: None,
                    created_at: chrono::Utc::now(),
                    updated_at: chrono::Utc::now(),
                }
            }
            ChargeOutcome::Declined { reason } => {
                warn!(order_id = %order_id, reason = %reason, "Payment declined");
                Payment {
                    payment_id: format!("pay_{}", Uuid::new_v4().simple()),
                    order_id: order_id.clone(),
                    customer_id: request.customer_id.clone(),
                    amount: request.amount,
                    currency: request.currency.clone(),
                    status: PaymentStatus::Failed,
                    failure_reason: Some(reason),
                    created_at: chrono::Utc::now(),
                    updated_at: chrono::Utc::now(),
                }
            }
        };

        let mut tx = self.pool.begin().await?;

        if !PaymentRepository::insert_payment(&mut tx, &payment).await? {
            // Lost a race with a concurrent attempt; their row wins.
            let stored = PaymentRepository::get_payment_by_order(&mut tx, order_id)
                .await?
                .ok_or_else(|| {
                    AppError::Gateway(format!("payment row for {order_id} vanished"))
                })?;
            warn!(
                order_id = %order_id,
                payment_id = %stored.payment_id,
                "Concurrent payment attempt won, re-emitting its result"
            );
            let record = self.outcome_event(envelope, &stored)?;
            self.outbox.append(&mut tx, &record).await?;
            tx.commit().await?;
            return Ok(());
        }

        let record = self.outcome_event(envelope, &payment)?;
        self.outbox.append(&mut tx, &record).await?;
        tx.commit().await?;

        Ok(())
    }

    /// Handle `payments.refunded` (compensation). Idempotent by payment id.
    pub async fn refund(&self, envelope: &EventEnvelope<PaymentRefunded>) -> AppResult<()> {
        let request = &envelope.data;
        let payment_id = &request.payment_id;

        let mut tx = self.pool.begin().await?;

        let Some(_payment) = PaymentRepository::get_payment(&mut tx, payment_id).await? else {
            warn!(payment_id = %payment_id, "Refund for unknown payment, ignoring");
            tx.commit().await?;
            return Ok(());
        };

        if PaymentRepository::get_refund(&mut tx, payment_id).await?.is_some() {
            debug!(payment_id = %payment_id, "Payment already refunded");
            tx.commit().await?;
            return Ok(());
        }

        let refund = Refund {
            refund_id: format!("ref_{}", Uuid::new_v4().simple()),
            payment_id: payment_id.clone(),
            amount: request.amount,
            currency: request.currency.clone(),
            created_at: chrono::Utc::now(),
        };
        PaymentRepository::insert_refund(&mut tx, &refund).await?;
        PaymentRepository::mark_refunded(&mut tx, payment_id).await?;

        tx.commit().await?;

        info!(
            payment_id = %payment_id,
            order_id = %request.order_id,
            amount = %request.amount,
            "Payment refunded"
        );
        Ok(())
    }

    /// The response event for a stored payment outcome.
    fn outcome_event(
        &self,
        request: &EventEnvelope<PaymentInitiated>,
        payment: &Payment,
    ) -> AppResult<OutboxRecord> {
        let record = match payment.status {
            // A refunded payment did complete; the saga decides what that means.
            PaymentStatus::Completed | PaymentStatus::Refunded => {
                let response = EventEnvelope::new(
                    topics::PAYMENTS_COMPLETED,
                    sources::PAYMENT_SERVICE,
                    request.correlation_id,
                    PaymentCompleted {
                        order_id: payment.order_id.clone(),
                        payment_id: payment.payment_id.clone(),
                        amount: payment.amount,
                        currency: payment.currency.clone(),
                    },
                )
                .caused_by(request.id);
                OutboxRecord::from_envelope(
                    &payment.order_id,
                    AGGREGATE_TYPE,
                    topics::PAYMENTS_COMPLETED,
                    &response,
                )?
            }
            PaymentStatus::Failed => {
                let reason = payment
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "Payment declined".to_string());
                let response = EventEnvelope::new(
                    topics::PAYMENTS_FAILED,
                    sources::PAYMENT_SERVICE,
                    request.correlation_id,
                    PaymentFailed {
                        order_id: payment.order_id.clone(),
                        reason,
                    },
                )
                .caused_by(request.id);
                OutboxRecord::from_envelope(
                    &payment.order_id,
                    AGGREGATE_TYPE,
                    topics::PAYMENTS_FAILED,
                    &response,
                )?
            }
        };

        Ok(record)
    }
}
