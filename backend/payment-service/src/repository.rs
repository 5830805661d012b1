//! SQL access for payments and refunds.

use anyhow::Context;
use sqlx::{Postgres, Row, Transaction};

use crate::error::AppResult;
use crate::models::{Payment, PaymentStatus, Refund};

pub struct PaymentRepository;

impl PaymentRepository {
    pub async fn get_payment_by_order(
        tx: &mut Transaction<'_, Postgres>,
        order_id: &str,
    ) -> AppResult<Option<Payment>> {
        let row = sqlx::query(
            r#"
            SELECT payment_id, order_id, customer_id, amount, currency,
                   status, failure_reason, created_at, updated_at
            FROM payments
            WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(Self::payment_from_row).transpose()
    }

    pub async fn get_payment(
        tx: &mut Transaction<'_, Postgres>,
        payment_id: &str,
    ) -> AppResult<Option<Payment>> {
        let row = sqlx::query(
            r#"
            SELECT payment_id, order_id, customer_id, amount, currency,
                   status, failure_reason, created_at, updated_at
            FROM payments
            WHERE payment_id = $1
            "#,
        )
        .bind(payment_id)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(Self::payment_from_row).transpose()
    }

    /// Insert a payment row. Returns false when an attempt for the order
    /// already exists (lost race); the caller re-reads and re-emits.
    pub async fn insert_payment(
        tx: &mut Transaction<'_, Postgres>,
        payment: &Payment,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO payments (
                payment_id, order_id, customer_id, amount, currency,
                status, failure_reason, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW())
            ON CONFLICT (order_id) DO NOTHING
            "#,
        )
        .bind(&payment.payment_id)
        .bind(&payment.order_id)
        .bind(&payment.customer_id)
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(payment.status.as_str())
        .bind(&payment.failure_reason)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_refunded(
        tx: &mut Transaction<'_, Postgres>,
        payment_id: &str,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE payments
            SET status = $2,
                updated_at = NOW()
            WHERE payment_id = $1
            "#,
        )
        .bind(payment_id)
        .bind(PaymentStatus::Refunded.as_str())
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    pub async fn get_refund(
        tx: &mut Transaction<'_, Postgres>,
        payment_id: &str,
    ) -> AppResult<Option<Refund>> {
        let row = sqlx::query(
            r#"
            SELECT refund_id, payment_id, amount, currency, created_at
            FROM refunds
            WHERE payment_id = $1
            "#,
        )
        .bind(payment_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(row.map(|row| Refund {
            refund_id: row.get("refund_id"),
            payment_id: row.get("payment_id"),
            amount: row.get("amount"),
            currency: row.get("currency"),
            created_at: row.get("created_at"),
        }))
    }

    pub async fn insert_refund(
        tx: &mut Transaction<'_, Postgres>,
        refund: &Refund,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO refunds (refund_id, payment_id, amount, currency, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (payment_id) DO NOTHING
            "#,
        )
        .bind(&refund.refund_id)
        .bind(&refund.payment_id)
        .bind(refund.amount)
        .bind(&refund.currency)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    fn payment_from_row(row: sqlx::postgres::PgRow) -> AppResult<Payment> {
        let raw_status: String = row.try_get("status")?;
        let status = PaymentStatus::parse(&raw_status)
            .with_context(|| format!("unknown payment status: {raw_status}"))?;

        Ok(Payment {
            payment_id: row.get("payment_id"),
            order_id: row.get("order_id"),
            customer_id: row.get("customer_id"),
            amount: row.get("amount"),
            currency: row.get("currency"),
            status,
            failure_reason: row.get("failure_reason"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}
