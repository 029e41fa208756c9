//! # Sale Repository
//!
//! Database operations for sales, line items and customers.
//!
//! ## Sale Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sale Lifecycle                                    │
//! │                                                                         │
//! │  1. CHECKOUT                                                           │
//! │     └── insert_sale() → Sale { status: Unpaid } + items + devices      │
//! │                                                                         │
//! │  2. PAYMENTS (PaymentRepository::complete)                             │
//! │     └── Unpaid → InInstallment → Completed                             │
//! │                                                                         │
//! │  3. ABANDONED (sweeper)                                                │
//! │     └── find_stale_unpaid() → cancel_stale()                           │
//! │         └── Cancelled + inventory restored + pending payments failed   │
//! │             (one transaction)                                          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::repository::to_u32;
use solarpay_core::{
    CustomerContact, InstallmentAccountDetails, Money, PaymentMethod, PaymentMode, Sale,
    SaleLineItem, SaleStatus,
};

/// What one stale-sale cancellation changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CancelledSale {
    /// Units put back into inventory batches.
    pub restored_units: i64,
    /// Pending payments moved to failed.
    pub failed_payments: u64,
}

#[derive(Debug, sqlx::FromRow)]
struct SaleRow {
    id: String,
    customer_id: String,
    agent_id: Option<String>,
    status: SaleStatus,
    payment_mode: PaymentMode,
    payment_method: PaymentMethod,
    total_price: i64,
    total_paid: i64,
    total_monthly_payment: i64,
    installment_starting_price: i64,
    total_installment_duration: i64,
    remaining_installments: i64,
    total_miscellaneous_price: i64,
    account_bank_name: Option<String>,
    account_name: Option<String>,
    account_number: Option<String>,
    delivered_account_details: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SaleRow {
    fn into_sale(self) -> DbResult<Sale> {
        let account_details = match (self.account_bank_name, self.account_name, self.account_number) {
            (Some(bank_name), Some(account_name), Some(account_number)) => {
                Some(InstallmentAccountDetails {
                    bank_name,
                    account_name,
                    account_number,
                })
            }
            _ => None,
        };

        Ok(Sale {
            id: self.id,
            customer_id: self.customer_id,
            agent_id: self.agent_id,
            status: self.status,
            payment_mode: self.payment_mode,
            payment_method: self.payment_method,
            total_price: Money::from_minor(self.total_price),
            total_paid: Money::from_minor(self.total_paid),
            total_monthly_payment: Money::from_minor(self.total_monthly_payment),
            installment_starting_price: Money::from_minor(self.installment_starting_price),
            total_installment_duration: to_u32(
                "sales.total_installment_duration",
                self.total_installment_duration,
            )?,
            remaining_installments: to_u32("sales.remaining_installments", self.remaining_installments)?,
            total_miscellaneous_price: Money::from_minor(self.total_miscellaneous_price),
            account_details,
            delivered_account_details: self.delivered_account_details,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SaleItemRow {
    id: String,
    sale_id: String,
    product_id: String,
    payment_mode: PaymentMode,
    quantity: i64,
    total_price: i64,
    monthly_payment: i64,
    installment_starting_price: i64,
    installment_duration: i64,
}

pub(crate) const SALE_COLUMNS: &str = r#"
    id, customer_id, agent_id, status, payment_mode, payment_method,
    total_price, total_paid, total_monthly_payment, installment_starting_price,
    total_installment_duration, remaining_installments, total_miscellaneous_price,
    account_bank_name, account_name, account_number, delivered_account_details,
    created_at, updated_at
"#;

/// Reads one sale on an existing connection (used inside transactions).
pub(crate) async fn fetch_sale(
    conn: &mut sqlx::SqliteConnection,
    sale_id: &str,
) -> DbResult<Option<Sale>> {
    let row: Option<SaleRow> =
        sqlx::query_as(&format!("SELECT {SALE_COLUMNS} FROM sales WHERE id = ?1"))
            .bind(sale_id)
            .fetch_optional(conn)
            .await?;

    row.map(SaleRow::into_sale).transpose()
}

/// Repository for sale database operations.
///
/// ## Usage
/// ```rust,ignore
/// let repo = db.sales();
/// let sale = repo.get("sale-uuid").await?;
/// let stale = repo.find_stale_unpaid(cutoff, 100).await?;
/// ```
#[derive(Debug, Clone)]
pub struct SaleRepository {
    pool: SqlitePool,
}

impl SaleRepository {
    /// Creates a new SaleRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SaleRepository { pool }
    }

    // =========================================================================
    // Customers
    // =========================================================================

    /// Inserts a customer record.
    pub async fn insert_customer(&self, contact: &CustomerContact, now: DateTime<Utc>) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO customers (id, name, email, phone, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&contact.customer_id)
        .bind(&contact.name)
        .bind(&contact.email)
        .bind(&contact.phone)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Notification contact for a sale's customer.
    pub async fn contact(&self, sale_id: &str) -> DbResult<Option<CustomerContact>> {
        let row: Option<(String, String, Option<String>, Option<String>)> = sqlx::query_as(
            r#"
            SELECT c.id, c.name, c.email, c.phone
            FROM sales s
            INNER JOIN customers c ON c.id = s.customer_id
            WHERE s.id = ?1
            "#,
        )
        .bind(sale_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(customer_id, name, email, phone)| CustomerContact {
            customer_id,
            name,
            email,
            phone,
        }))
    }

    // =========================================================================
    // Sales
    // =========================================================================

    /// Inserts a sale with its line items and device links in one transaction.
    ///
    /// ## Arguments
    /// * `sale` - Sale header
    /// * `items` - Line items; `device_ids` become `sale_item_devices` rows
    pub async fn insert_sale(&self, sale: &Sale, items: &[SaleLineItem]) -> DbResult<()> {
        debug!(id = %sale.id, items = items.len(), "Inserting sale");

        let (bank_name, account_name, account_number) = match &sale.account_details {
            Some(details) => (
                Some(details.bank_name.as_str()),
                Some(details.account_name.as_str()),
                Some(details.account_number.as_str()),
            ),
            None => (None, None, None),
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO sales (
                id, customer_id, agent_id, status, payment_mode, payment_method,
                total_price, total_paid, total_monthly_payment, installment_starting_price,
                total_installment_duration, remaining_installments, total_miscellaneous_price,
                account_bank_name, account_name, account_number, delivered_account_details,
                created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6,
                ?7, ?8, ?9, ?10,
                ?11, ?12, ?13,
                ?14, ?15, ?16, ?17,
                ?18, ?19
            )
            "#,
        )
        .bind(&sale.id)
        .bind(&sale.customer_id)
        .bind(&sale.agent_id)
        .bind(sale.status)
        .bind(sale.payment_mode)
        .bind(sale.payment_method)
        .bind(sale.total_price.minor())
        .bind(sale.total_paid.minor())
        .bind(sale.total_monthly_payment.minor())
        .bind(sale.installment_starting_price.minor())
        .bind(i64::from(sale.total_installment_duration))
        .bind(i64::from(sale.remaining_installments))
        .bind(sale.total_miscellaneous_price.minor())
        .bind(bank_name)
        .bind(account_name)
        .bind(account_number)
        .bind(sale.delivered_account_details)
        .bind(sale.created_at)
        .bind(sale.updated_at)
        .execute(&mut *tx)
        .await?;

        for item in items {
            sqlx::query(
                r#"
                INSERT INTO sale_items (
                    id, sale_id, product_id, payment_mode, quantity,
                    total_price, monthly_payment, installment_starting_price, installment_duration
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
            )
            .bind(&item.id)
            .bind(&sale.id)
            .bind(&item.product_id)
            .bind(item.payment_mode)
            .bind(i64::from(item.quantity))
            .bind(item.total_price.minor())
            .bind(item.monthly_payment.minor())
            .bind(item.installment_starting_price.minor())
            .bind(i64::from(item.installment_duration))
            .execute(&mut *tx)
            .await?;

            for device_id in &item.device_ids {
                sqlx::query("INSERT INTO sale_item_devices (sale_item_id, device_id) VALUES (?1, ?2)")
                    .bind(&item.id)
                    .bind(device_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Gets a sale by ID.
    pub async fn get(&self, id: &str) -> DbResult<Option<Sale>> {
        let mut conn = self.pool.acquire().await?;
        fetch_sale(&mut conn, id).await
    }

    /// Line items of a sale with their linked device IDs.
    pub async fn line_items(&self, sale_id: &str) -> DbResult<Vec<SaleLineItem>> {
        let rows: Vec<SaleItemRow> = sqlx::query_as(
            r#"
            SELECT id, sale_id, product_id, payment_mode, quantity,
                   total_price, monthly_payment, installment_starting_price, installment_duration
            FROM sale_items
            WHERE sale_id = ?1
            ORDER BY rowid
            "#,
        )
        .bind(sale_id)
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let device_ids: Vec<String> = sqlx::query_scalar(
                "SELECT device_id FROM sale_item_devices WHERE sale_item_id = ?1 ORDER BY rowid",
            )
            .bind(&row.id)
            .fetch_all(&self.pool)
            .await?;

            items.push(SaleLineItem {
                id: row.id,
                sale_id: row.sale_id,
                product_id: row.product_id,
                payment_mode: row.payment_mode,
                quantity: to_u32("sale_items.quantity", row.quantity)?,
                total_price: Money::from_minor(row.total_price),
                monthly_payment: Money::from_minor(row.monthly_payment),
                installment_starting_price: Money::from_minor(row.installment_starting_price),
                installment_duration: to_u32("sale_items.installment_duration", row.installment_duration)?,
                device_ids,
            });
        }

        Ok(items)
    }

    // =========================================================================
    // Stale Sales
    // =========================================================================

    /// Unpaid sales created at or before `cutoff` with no completed payment.
    ///
    /// Oldest first, at most `limit`.
    pub async fn find_stale_unpaid(&self, cutoff: DateTime<Utc>, limit: u32) -> DbResult<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT s.id
            FROM sales s
            WHERE s.status = 'unpaid'
              AND s.created_at <= ?1
              AND NOT EXISTS (
                  SELECT 1 FROM payments p
                  WHERE p.sale_id = s.id AND p.status = 'completed'
              )
            ORDER BY s.created_at
            LIMIT ?2
            "#,
        )
        .bind(cutoff)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    /// Cancels one stale sale.
    ///
    /// ## Transaction
    /// ```text
    /// UPDATE sales → cancelled   (only if still unpaid with no completed payment)
    ///   │  0 rows → Ok(None), nothing else runs
    ///   ▼
    /// inventory_batches += allocated quantity
    ///   ▼
    /// pending payments → failed
    ///   ▼
    /// COMMIT
    /// ```
    ///
    /// Allocation rows are kept so the sale's history still shows what it
    /// reserved.
    pub async fn cancel_stale(&self, sale_id: &str, now: DateTime<Utc>) -> DbResult<Option<CancelledSale>> {
        let mut tx = self.pool.begin().await?;

        let cancelled = sqlx::query(
            r#"
            UPDATE sales
            SET status = 'cancelled', updated_at = ?2
            WHERE id = ?1
              AND status = 'unpaid'
              AND NOT EXISTS (
                  SELECT 1 FROM payments p
                  WHERE p.sale_id = sales.id AND p.status = 'completed'
              )
            "#,
        )
        .bind(sale_id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if cancelled == 0 {
            debug!(sale_id = %sale_id, "Sale no longer eligible for cancellation");
            tx.rollback().await?;
            return Ok(None);
        }

        let restored_units: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(quantity), 0) FROM sale_batch_allocations WHERE sale_id = ?1",
        )
        .bind(sale_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE inventory_batches
            SET remaining_quantity = remaining_quantity + (
                SELECT COALESCE(SUM(a.quantity), 0)
                FROM sale_batch_allocations a
                WHERE a.batch_id = inventory_batches.id AND a.sale_id = ?1
            )
            WHERE id IN (SELECT batch_id FROM sale_batch_allocations WHERE sale_id = ?1)
            "#,
        )
        .bind(sale_id)
        .execute(&mut *tx)
        .await?;

        let failed_payments = sqlx::query(
            r#"
            UPDATE payments
            SET status = 'failed', updated_at = ?2
            WHERE sale_id = ?1 AND status = 'pending'
            "#,
        )
        .bind(sale_id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        info!(
            sale_id = %sale_id,
            restored_units = restored_units,
            failed_payments = failed_payments,
            "Cancelled stale sale"
        );

        Ok(Some(CancelledSale {
            restored_units,
            failed_payments,
        }))
    }

    // =========================================================================
    // Account Details Delivery
    // =========================================================================

    /// Marks the sale's account details as delivered.
    ///
    /// Returns `true` only for the caller that flipped the flag, so exactly
    /// one caller sends the message.
    pub async fn claim_account_details_delivery(&self, sale_id: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let claimed = sqlx::query(
            r#"
            UPDATE sales
            SET delivered_account_details = 1, updated_at = ?2
            WHERE id = ?1
              AND delivered_account_details = 0
              AND account_number IS NOT NULL
            "#,
        )
        .bind(sale_id)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(claimed == 1)
    }

    /// Undoes a claim whose message could not be sent.
    pub async fn release_account_details_delivery(&self, sale_id: &str) -> DbResult<()> {
        let released = sqlx::query(
            "UPDATE sales SET delivered_account_details = 0 WHERE id = ?1 AND delivered_account_details = 1",
        )
        .bind(sale_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if released == 0 {
            return Err(DbError::not_found("Sale", sale_id));
        }
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::{pending_payment, seed_sale};
    use crate::{Database, DbConfig};
    use chrono::Duration;

    #[tokio::test]
    async fn test_insert_and_get_sale() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let now = Utc::now();
        let sale = seed_sale(&db, now).await;

        let loaded = db.sales().get(&sale.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SaleStatus::Unpaid);
        assert_eq!(loaded.total_price, Money::from_major(144_000));
        assert_eq!(loaded.remaining_installments, 24);
        assert_eq!(loaded.account_details, sale.account_details);

        let contact = db.sales().contact(&sale.id).await.unwrap().unwrap();
        assert_eq!(contact.name, "Ada Obi");
    }

    #[tokio::test]
    async fn test_stale_sale_cancellation_restores_inventory() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let now = Utc::now();
        let sale = seed_sale(&db, now - Duration::hours(7)).await;

        let batch = db.inventory().insert_batch("prod-1", 10, now).await.unwrap();
        db.inventory().allocate(&sale.id, &batch.id, 2).await.unwrap();
        db.payments().insert(&pending_payment(&sale.id, now)).await.unwrap();

        let stale = db.sales().find_stale_unpaid(now - Duration::hours(6), 10).await.unwrap();
        assert_eq!(stale, vec![sale.id.clone()]);

        let outcome = db.sales().cancel_stale(&sale.id, now).await.unwrap().unwrap();
        assert_eq!(outcome.restored_units, 2);
        assert_eq!(outcome.failed_payments, 1);

        let batch = db.inventory().get_batch(&batch.id).await.unwrap().unwrap();
        assert_eq!(batch.remaining_quantity, 10);

        let loaded = db.sales().get(&sale.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SaleStatus::Cancelled);

        // Second pass is a no-op
        assert!(db.sales().cancel_stale(&sale.id, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recent_sale_is_not_stale() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let now = Utc::now();
        seed_sale(&db, now - Duration::hours(1)).await;

        let stale = db.sales().find_stale_unpaid(now - Duration::hours(6), 10).await.unwrap();
        assert!(stale.is_empty());
    }

    #[tokio::test]
    async fn test_account_details_claimed_once() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let now = Utc::now();
        let sale = seed_sale(&db, now).await;

        assert!(db.sales().claim_account_details_delivery(&sale.id, now).await.unwrap());
        assert!(!db.sales().claim_account_details_delivery(&sale.id, now).await.unwrap());

        db.sales().release_account_details_delivery(&sale.id).await.unwrap();
        assert!(db.sales().claim_account_details_delivery(&sale.id, now).await.unwrap());
    }
}
