//! SQL access for stock rows and reservations.
//!
//! Stock mutations go through conditional updates guarded by the row's
//! version column; callers retry on conflict.

use anyhow::Context;
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use tracing::debug;

use event_schema::events::OrderItem;

use crate::error::AppResult;
use crate::models::{Product, Reservation, ReservationStatus};

pub struct InventoryRepository;

impl InventoryRepository {
    pub async fn get_product(
        tx: &mut Transaction<'_, Postgres>,
        product_id: &str,
    ) -> AppResult<Option<Product>> {
        let row = sqlx::query(
            r#"
            SELECT product_id, available, reserved, version
            FROM inventory
            WHERE product_id = $1
            "#,
        )
        .bind(product_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(row.map(|row| Product {
            product_id: row.get("product_id"),
            available: row.get("available"),
            reserved: row.get("reserved"),
            version: row.get("version"),
        }))
    }

    /// Move stock from available to reserved iff the version still matches
    /// and enough stock remains. Returns false on a conflict or a concurrent
    /// sell-out; the caller re-reads and retries.
    pub async fn try_reserve(
        tx: &mut Transaction<'_, Postgres>,
        product_id: &str,
        quantity: i32,
        expected_version: i32,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE inventory
            SET available = available - $2,
                reserved = reserved + $2,
                version = version + 1,
                updated_at = NOW()
            WHERE product_id = $1
              AND version = $3
              AND available >= $2
            "#,
        )
        .bind(product_id)
        .bind(quantity)
        .bind(expected_version)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Return reserved stock to availability, clamping reserved at zero.
    pub async fn release_product(
        tx: &mut Transaction<'_, Postgres>,
        product_id: &str,
        quantity: i32,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE inventory
            SET available = available + $2,
                reserved = GREATEST(reserved - $2, 0),
                version = version + 1,
                updated_at = NOW()
            WHERE product_id = $1
            "#,
        )
        .bind(product_id)
        .bind(quantity)
        .execute(&mut **tx)
        .await?;

        debug!(product_id = %product_id, quantity, "Stock released");
        Ok(())
    }

    pub async fn insert_reservation(
        tx: &mut Transaction<'_, Postgres>,
        order_id: &str,
        items: &[OrderItem],
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO inventory_reservations (order_id, items, status)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(order_id)
        .bind(Json(items))
        .bind(ReservationStatus::Reserved.as_str())
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    pub async fn get_reservation(
        tx: &mut Transaction<'_, Postgres>,
        order_id: &str,
    ) -> AppResult<Option<Reservation>> {
        let row = sqlx::query(
            r#"
            SELECT order_id, items, status, created_at, updated_at
            FROM inventory_reservations
            WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&mut **tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let Json(items): Json<Vec<OrderItem>> = row.try_get("items")?;
        let raw_status: String = row.try_get("status")?;
        let status = ReservationStatus::parse(&raw_status)
            .with_context(|| format!("unknown reservation status: {raw_status}"))?;

        Ok(Some(Reservation {
            order_id: row.get("order_id"),
            items,
            status,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }))
    }

    pub async fn mark_reservation_released(
        tx: &mut Transaction<'_, Postgres>,
        order_id: &str,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE inventory_reservations
            SET status = $2,
                updated_at = NOW()
            WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .bind(ReservationStatus::Released.as_str())
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
