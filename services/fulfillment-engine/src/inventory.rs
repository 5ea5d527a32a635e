//! Buyer inventory replenishment on drop settlement.
//!
//! Runs inside the drop transaction so the stock increment commits or
//! rolls back atomically with the shipment/order terminal update.

use crate::errors::Result;
use crate::models::LineItem;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

/// SKU matching tolerates case and separator drift ("SKU-1" == "sku 1").
fn normalised_sku(value: &str) -> (String, String) {
    let lower = value.to_lowercase();
    let compact = lower.replace(['-', ' '], "");
    (lower, compact)
}

/// Increment the buyer's on-hand stock for each line item; rows that do
/// not exist yet are created with the protocol defaults.
pub async fn replenish_line_items(
    tx: &mut Transaction<'_, Postgres>,
    buyer: &str,
    items: &[LineItem],
    now: DateTime<Utc>,
) -> Result<u32> {
    let mut touched = 0u32;
    for item in items {
        let qty = item.qty.round() as i64;
        if qty <= 0 {
            continue;
        }
        let (sku_lower, sku_compact) = normalised_sku(&item.sku_id);

        let updated = sqlx::query(
            r#"
            UPDATE products
            SET target_stock = target_stock + $1, active = TRUE, updated_at = $2
            WHERE owner = $3
              AND (lower(sku_id) = $4
                   OR replace(replace(lower(sku_id), '-', ''), ' ', '') = $5)
            "#,
        )
        .bind(qty)
        .bind(now)
        .bind(buyer)
        .bind(&sku_lower)
        .bind(&sku_compact)
        .execute(&mut **tx)
        .await?;

        if updated.rows_affected() == 0 {
            sqlx::query(
                r#"
                INSERT INTO products (
                    id, owner, sku_id, name, unit, min_threshold, target_stock,
                    active, created_at, updated_at
                )
                VALUES ($1, $2, $3, $3, 'unit', 0, $4, TRUE, $5, $5)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(buyer)
            .bind(&item.sku_id)
            .bind(qty)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        }
        touched += 1;
        info!("replenished {} x{} for {}", item.sku_id, qty, buyer);
    }
    Ok(touched)
}
