//! # Inventory Repository
//!
//! Stock batches and the per-sale allocations taken from them at checkout.
//! Cancelling a sale returns its allocations (see
//! [`SaleRepository::cancel_stale`](super::sale::SaleRepository::cancel_stale)).

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use solarpay_core::{new_id, InventoryBatch, SaleBatchAllocation};

#[derive(Debug, sqlx::FromRow)]
struct BatchRow {
    id: String,
    product_id: String,
    remaining_quantity: i64,
    created_at: DateTime<Utc>,
}

impl From<BatchRow> for InventoryBatch {
    fn from(row: BatchRow) -> Self {
        InventoryBatch {
            id: row.id,
            product_id: row.product_id,
            remaining_quantity: row.remaining_quantity,
            created_at: row.created_at,
        }
    }
}

/// Repository for inventory database operations.
#[derive(Debug, Clone)]
pub struct InventoryRepository {
    pool: SqlitePool,
}

impl InventoryRepository {
    /// Creates a new InventoryRepository.
    pub fn new(pool: SqlitePool) -> Self {
        InventoryRepository { pool }
    }

    /// Receives a batch of stock.
    pub async fn insert_batch(
        &self,
        product_id: &str,
        quantity: i64,
        now: DateTime<Utc>,
    ) -> DbResult<InventoryBatch> {
        let batch = InventoryBatch {
            id: new_id(),
            product_id: product_id.to_string(),
            remaining_quantity: quantity,
            created_at: now,
        };

        sqlx::query(
            "INSERT INTO inventory_batches (id, product_id, remaining_quantity, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&batch.id)
        .bind(&batch.product_id)
        .bind(batch.remaining_quantity)
        .bind(batch.created_at)
        .execute(&self.pool)
        .await?;

        Ok(batch)
    }

    /// Gets a batch by ID.
    pub async fn get_batch(&self, id: &str) -> DbResult<Option<InventoryBatch>> {
        let row: Option<BatchRow> = sqlx::query_as(
            "SELECT id, product_id, remaining_quantity, created_at FROM inventory_batches WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(InventoryBatch::from))
    }

    /// Reserves `quantity` units of a batch for a sale.
    ///
    /// ## Errors
    /// `Conflict` if the batch has fewer than `quantity` units left.
    pub async fn allocate(&self, sale_id: &str, batch_id: &str, quantity: i64) -> DbResult<SaleBatchAllocation> {
        let mut tx = self.pool.begin().await?;

        let taken = sqlx::query(
            r#"
            UPDATE inventory_batches
            SET remaining_quantity = remaining_quantity - ?2
            WHERE id = ?1 AND remaining_quantity >= ?2
            "#,
        )
        .bind(batch_id)
        .bind(quantity)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if taken == 0 {
            tx.rollback().await?;
            return Err(DbError::Conflict(format!("batch {batch_id} cannot supply {quantity} units")));
        }

        let allocation = SaleBatchAllocation {
            id: new_id(),
            sale_id: sale_id.to_string(),
            batch_id: batch_id.to_string(),
            quantity,
        };

        sqlx::query(
            "INSERT INTO sale_batch_allocations (id, sale_id, batch_id, quantity) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&allocation.id)
        .bind(&allocation.sale_id)
        .bind(&allocation.batch_id)
        .bind(allocation.quantity)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(sale_id = %sale_id, batch_id = %batch_id, quantity, "Stock allocated");
        Ok(allocation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::seed_sale;
    use crate::{Database, DbConfig};

    #[tokio::test]
    async fn test_allocate_beyond_stock_fails() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let now = Utc::now();
        let sale = seed_sale(&db, now).await;
        let batch = db.inventory().insert_batch("prod-1", 3, now).await.unwrap();

        db.inventory().allocate(&sale.id, &batch.id, 2).await.unwrap();
        let err = db.inventory().allocate(&sale.id, &batch.id, 2).await.unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));

        let batch = db.inventory().get_batch(&batch.id).await.unwrap().unwrap();
        assert_eq!(batch.remaining_quantity, 1);
    }
}
