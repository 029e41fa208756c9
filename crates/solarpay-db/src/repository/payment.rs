//! # Payment Repository
//!
//! Payments, their gateway audit trail, and the completion unit.
//!
//! ## Completion Unit
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  complete(CompletionRequest)            one SQLite transaction          │
//! │                                                                         │
//! │  1. UPDATE payments ... WHERE status IN (pending, failed)              │
//! │       │ 0 rows → AlreadyCompleted / Refunded / NotFound                │
//! │       ▼                                                                 │
//! │  2. read sale ── cancelled? ──► payment REFUNDED, commit               │
//! │       ▼                                                                 │
//! │  3. wallet debit (WALLET method only) ── short? ──► rollback           │
//! │       ▼                                                                 │
//! │  4. apply_payment(snapshot, amount)                                    │
//! │       ▼                                                                 │
//! │  5. UPDATE sales ... WHERE total_paid = <read value>                   │
//! │  6. UPDATE payments → completed, months_covered                        │
//! │  7. INSERT payment_responses                                           │
//! │       ▼                                                                 │
//! │  COMMIT                                                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The first statement is a write, so the transaction holds the SQLite write
//! lock before it reads anything. Two reconcilers racing on one reference
//! serialize here: the loser sees `AlreadyCompleted`.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use crate::error::{DbError, DbResult};
use crate::repository::sale::fetch_sale;
use crate::repository::wallet::{apply_entry_in, LedgerEntry, LedgerWrite};
use solarpay_core::{
    apply_payment, new_id, InstallmentOutcome, Money, Payment, PaymentMethod, PaymentResponse,
    PaymentStatus, Sale, SaleStatus,
};

// =============================================================================
// Completion Types
// =============================================================================

/// Input to [`PaymentRepository::complete`].
#[derive(Debug, Clone)]
pub struct CompletionRequest<'a> {
    pub transaction_ref: &'a str,
    /// `(source, body)` stored in the audit trail with the transition.
    pub response: Option<(&'a str, &'a str)>,
    /// Debit taken from the agent wallet in the same transaction.
    pub wallet_debit: Option<LedgerEntry>,
    pub now: DateTime<Utc>,
}

/// What [`PaymentRepository::complete`] did.
#[derive(Debug, Clone)]
pub enum CompletionOutcome {
    /// This call moved the payment to COMPLETED and updated the sale.
    Applied {
        payment: Payment,
        sale: Sale,
        outcome: InstallmentOutcome,
    },
    /// An earlier call already completed it. Nothing changed.
    AlreadyCompleted { payment: Payment, sale: Sale },
    /// The sale was cancelled; the payment is (now or already) REFUNDED.
    Refunded { payment: Payment, sale: Sale },
    /// The wallet could not cover the debit. Nothing changed.
    InsufficientBalance { balance: Money },
    /// No payment carries this reference.
    NotFound,
}

// =============================================================================
// Rows
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    id: String,
    sale_id: String,
    amount: i64,
    transaction_ref: String,
    method: PaymentMethod,
    status: PaymentStatus,
    agent_id: Option<String>,
    gateway_order_id: Option<String>,
    gateway_order_ref: Option<String>,
    sms_number: Option<String>,
    sms_message: Option<String>,
    months_covered: Option<i64>,
    tokens_settled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<PaymentRow> for Payment {
    fn from(row: PaymentRow) -> Self {
        Payment {
            id: row.id,
            sale_id: row.sale_id,
            amount: Money::from_minor(row.amount),
            transaction_ref: row.transaction_ref,
            method: row.method,
            status: row.status,
            agent_id: row.agent_id,
            gateway_order_id: row.gateway_order_id,
            gateway_order_ref: row.gateway_order_ref,
            sms_number: row.sms_number,
            sms_message: row.sms_message,
            months_covered: row.months_covered,
            tokens_settled_at: row.tokens_settled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentResponseRow {
    id: String,
    payment_id: String,
    source: String,
    body: String,
    recorded_at: DateTime<Utc>,
}

impl From<PaymentResponseRow> for PaymentResponse {
    fn from(row: PaymentResponseRow) -> Self {
        PaymentResponse {
            id: row.id,
            payment_id: row.payment_id,
            source: row.source,
            body: row.body,
            recorded_at: row.recorded_at,
        }
    }
}

const PAYMENT_COLUMNS: &str = r#"
    id, sale_id, amount, transaction_ref, method, status, agent_id,
    gateway_order_id, gateway_order_ref, sms_number, sms_message,
    months_covered, tokens_settled_at, created_at, updated_at, completed_at
"#;

async fn fetch_by_ref(conn: &mut SqliteConnection, transaction_ref: &str) -> DbResult<Option<Payment>> {
    let row: Option<PaymentRow> = sqlx::query_as(&format!(
        "SELECT {PAYMENT_COLUMNS} FROM payments WHERE transaction_ref = ?1"
    ))
    .bind(transaction_ref)
    .fetch_optional(conn)
    .await?;

    Ok(row.map(Payment::from))
}

async fn insert_response(
    conn: &mut SqliteConnection,
    payment_id: &str,
    source: &str,
    body: &str,
    now: DateTime<Utc>,
) -> DbResult<PaymentResponse> {
    let response = PaymentResponse {
        id: new_id(),
        payment_id: payment_id.to_string(),
        source: source.to_string(),
        body: body.to_string(),
        recorded_at: now,
    };

    sqlx::query(
        r#"
        INSERT INTO payment_responses (id, payment_id, source, body, recorded_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(&response.id)
    .bind(&response.payment_id)
    .bind(&response.source)
    .bind(&response.body)
    .bind(response.recorded_at)
    .execute(conn)
    .await?;

    Ok(response)
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for payment database operations.
#[derive(Debug, Clone)]
pub struct PaymentRepository {
    pool: SqlitePool,
}

impl PaymentRepository {
    /// Creates a new PaymentRepository.
    pub fn new(pool: SqlitePool) -> Self {
        PaymentRepository { pool }
    }

    /// Inserts a new payment.
    ///
    /// ## Errors
    /// `UniqueViolation` if the transaction reference is already taken.
    pub async fn insert(&self, payment: &Payment) -> DbResult<()> {
        debug!(
            transaction_ref = %payment.transaction_ref,
            sale_id = %payment.sale_id,
            method = payment.method.as_str(),
            "Inserting payment"
        );

        sqlx::query(
            r#"
            INSERT INTO payments (
                id, sale_id, amount, transaction_ref, method, status, agent_id,
                gateway_order_id, gateway_order_ref, sms_number, sms_message,
                months_covered, tokens_settled_at, created_at, updated_at, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            "#,
        )
        .bind(&payment.id)
        .bind(&payment.sale_id)
        .bind(payment.amount.minor())
        .bind(&payment.transaction_ref)
        .bind(payment.method)
        .bind(payment.status)
        .bind(&payment.agent_id)
        .bind(&payment.gateway_order_id)
        .bind(&payment.gateway_order_ref)
        .bind(&payment.sms_number)
        .bind(&payment.sms_message)
        .bind(payment.months_covered)
        .bind(payment.tokens_settled_at)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .bind(payment.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::UniqueViolation { field, .. } => {
                DbError::duplicate(field, payment.transaction_ref.clone())
            }
            other => other,
        })?;

        Ok(())
    }

    /// Gets a payment by ID.
    pub async fn get(&self, id: &str) -> DbResult<Option<Payment>> {
        let row: Option<PaymentRow> =
            sqlx::query_as(&format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = ?1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(Payment::from))
    }

    /// Gets a payment by its transaction reference.
    pub async fn get_by_transaction_ref(&self, transaction_ref: &str) -> DbResult<Option<Payment>> {
        let mut conn = self.pool.acquire().await?;
        fetch_by_ref(&mut conn, transaction_ref).await
    }

    /// Stores the gateway order created for an online payment.
    pub async fn set_gateway_order(
        &self,
        payment_id: &str,
        order_id: &str,
        order_ref: &str,
        sms_number: Option<&str>,
        sms_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE payments
            SET gateway_order_id = ?2, gateway_order_ref = ?3,
                sms_number = ?4, sms_message = ?5, updated_at = ?6
            WHERE id = ?1
            "#,
        )
        .bind(payment_id)
        .bind(order_id)
        .bind(order_ref)
        .bind(sms_number)
        .bind(sms_message)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(DbError::not_found("Payment", payment_id));
        }
        Ok(())
    }

    // =========================================================================
    // Audit Trail
    // =========================================================================

    /// Appends a raw gateway/webhook body to the payment's audit trail.
    pub async fn record_response(
        &self,
        payment_id: &str,
        source: &str,
        body: &str,
        now: DateTime<Utc>,
    ) -> DbResult<PaymentResponse> {
        let mut conn = self.pool.acquire().await?;
        insert_response(&mut conn, payment_id, source, body, now).await
    }

    /// Audit trail of a payment, oldest first.
    pub async fn responses_for(&self, payment_id: &str) -> DbResult<Vec<PaymentResponse>> {
        let rows: Vec<PaymentResponseRow> = sqlx::query_as(
            r#"
            SELECT id, payment_id, source, body, recorded_at
            FROM payment_responses
            WHERE payment_id = ?1
            ORDER BY recorded_at, rowid
            "#,
        )
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(PaymentResponse::from).collect())
    }

    // =========================================================================
    // State Transitions
    // =========================================================================

    /// Completes a payment and applies it to its sale atomically.
    ///
    /// See the module docs for the transaction layout.
    ///
    /// ## Errors
    /// - `Conflict` if the sale row moved underneath the transaction
    /// - `NotFound` if the payment's sale (or the debited wallet) is missing
    pub async fn complete(&self, request: CompletionRequest<'_>) -> DbResult<CompletionOutcome> {
        let now = request.now;
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            r#"
            UPDATE payments
            SET updated_at = ?2
            WHERE transaction_ref = ?1 AND status IN ('pending', 'failed')
            "#,
        )
        .bind(request.transaction_ref)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let Some(payment) = fetch_by_ref(&mut tx, request.transaction_ref).await? else {
            tx.rollback().await?;
            return Ok(CompletionOutcome::NotFound);
        };

        let sale = fetch_sale(&mut tx, &payment.sale_id)
            .await?
            .ok_or_else(|| DbError::not_found("Sale", payment.sale_id.clone()))?;

        if claimed == 0 {
            tx.rollback().await?;
            debug!(
                transaction_ref = %payment.transaction_ref,
                status = %payment.status,
                "Payment already settled"
            );
            return Ok(match payment.status {
                PaymentStatus::Refunded => CompletionOutcome::Refunded { payment, sale },
                _ => CompletionOutcome::AlreadyCompleted { payment, sale },
            });
        }

        // Late success on an abandoned sale: keep the money trail, touch nothing else
        if sale.status == SaleStatus::Cancelled {
            sqlx::query("UPDATE payments SET status = 'refunded', updated_at = ?2 WHERE id = ?1")
                .bind(&payment.id)
                .bind(now)
                .execute(&mut *tx)
                .await?;

            if let Some((source, body)) = request.response {
                insert_response(&mut tx, &payment.id, source, body, now).await?;
            }

            let payment = fetch_by_ref(&mut tx, request.transaction_ref)
                .await?
                .ok_or_else(|| DbError::not_found("Payment", request.transaction_ref))?;
            tx.commit().await?;

            warn!(
                transaction_ref = %payment.transaction_ref,
                sale_id = %sale.id,
                "Payment succeeded on a cancelled sale, marked refunded"
            );
            return Ok(CompletionOutcome::Refunded { payment, sale });
        }

        if let Some(entry) = &request.wallet_debit {
            match apply_entry_in(&mut tx, entry, now).await? {
                LedgerWrite::Applied(_) | LedgerWrite::Existing(_) => {}
                LedgerWrite::Insufficient { balance } => {
                    tx.rollback().await?;
                    return Ok(CompletionOutcome::InsufficientBalance { balance });
                }
            }
        }

        let outcome = apply_payment(&sale.snapshot(), payment.amount);

        let updated = sqlx::query(
            r#"
            UPDATE sales
            SET status = ?2, total_paid = ?3, remaining_installments = ?4, updated_at = ?5
            WHERE id = ?1 AND total_paid = ?6
            "#,
        )
        .bind(&sale.id)
        .bind(outcome.new_status)
        .bind(outcome.new_total_paid.minor())
        .bind(i64::from(outcome.new_remaining_duration))
        .bind(now)
        .bind(sale.total_paid.minor())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Err(DbError::Conflict(format!("sale {} total_paid moved", sale.id)));
        }

        sqlx::query(
            r#"
            UPDATE payments
            SET status = 'completed', months_covered = ?2, completed_at = ?3, updated_at = ?3
            WHERE id = ?1
            "#,
        )
        .bind(&payment.id)
        .bind(outcome.months_covered.as_i64())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if let Some((source, body)) = request.response {
            insert_response(&mut tx, &payment.id, source, body, now).await?;
        }

        let payment = fetch_by_ref(&mut tx, request.transaction_ref)
            .await?
            .ok_or_else(|| DbError::not_found("Payment", request.transaction_ref))?;
        let sale = fetch_sale(&mut tx, &payment.sale_id)
            .await?
            .ok_or_else(|| DbError::not_found("Sale", payment.sale_id.clone()))?;

        tx.commit().await?;

        info!(
            transaction_ref = %payment.transaction_ref,
            sale_id = %sale.id,
            sale_status = %sale.status,
            months_covered = outcome.months_covered.as_i64(),
            "Payment completed"
        );

        Ok(CompletionOutcome::Applied {
            payment,
            sale,
            outcome,
        })
    }

    /// Moves a PENDING payment to FAILED and records why.
    ///
    /// Returns `false` if the payment was not pending.
    pub async fn mark_failed(
        &self,
        transaction_ref: &str,
        response: Option<(&str, &str)>,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        let failed = sqlx::query(
            r#"
            UPDATE payments
            SET status = 'failed', updated_at = ?2
            WHERE transaction_ref = ?1 AND status = 'pending'
            "#,
        )
        .bind(transaction_ref)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if failed == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        if let Some((source, body)) = response {
            if let Some(payment) = fetch_by_ref(&mut tx, transaction_ref).await? {
                insert_response(&mut tx, &payment.id, source, body, now).await?;
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    // =========================================================================
    // Queues
    // =========================================================================

    /// Online payments still PENDING with a gateway order, created since
    /// `since`. Oldest first.
    pub async fn list_pending(&self, since: DateTime<Utc>, limit: u32) -> DbResult<Vec<Payment>> {
        let rows: Vec<PaymentRow> = sqlx::query_as(&format!(
            r#"
            SELECT {PAYMENT_COLUMNS}
            FROM payments
            WHERE status = 'pending'
              AND method = 'online'
              AND gateway_order_ref IS NOT NULL
              AND created_at >= ?1
            ORDER BY created_at
            LIMIT ?2
            "#
        ))
        .bind(since)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Payment::from).collect())
    }

    /// COMPLETED payments whose devices have not all received tokens.
    pub async fn list_unsettled(&self, limit: u32) -> DbResult<Vec<Payment>> {
        let rows: Vec<PaymentRow> = sqlx::query_as(&format!(
            r#"
            SELECT {PAYMENT_COLUMNS}
            FROM payments
            WHERE status = 'completed' AND tokens_settled_at IS NULL
            ORDER BY completed_at
            LIMIT ?1
            "#
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Payment::from).collect())
    }

    /// Records that every tokenable device got its token for this payment.
    pub async fn mark_tokens_settled(&self, payment_id: &str, now: DateTime<Utc>) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE payments
            SET tokens_settled_at = ?2, updated_at = ?2
            WHERE id = ?1 AND tokens_settled_at IS NULL
            "#,
        )
        .bind(payment_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

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
    use solarpay_core::{LedgerEntryKind, MonthsCovered};

    fn request(transaction_ref: &str, now: DateTime<Utc>) -> CompletionRequest<'_> {
        CompletionRequest {
            transaction_ref,
            response: Some(("gateway_status", r#"{"status":"success"}"#)),
            wallet_debit: None,
            now,
        }
    }

    #[tokio::test]
    async fn test_complete_applies_installment() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let now = Utc::now();
        let sale = seed_sale(&db, now).await;
        let payment = pending_payment(&sale.id, now);
        db.payments().insert(&payment).await.unwrap();

        let outcome = db
            .payments()
            .complete(request(&payment.transaction_ref, now))
            .await
            .unwrap();

        let CompletionOutcome::Applied { payment, sale, outcome } = outcome else {
            panic!("expected Applied");
        };
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert_eq!(payment.months_covered, Some(1));
        assert_eq!(outcome.months_covered, MonthsCovered::Months(1));
        assert_eq!(sale.status, SaleStatus::InInstallment);
        assert_eq!(sale.total_paid, Money::from_major(6_000));
        assert_eq!(sale.remaining_installments, 23);

        let audit = db.payments().responses_for(&payment.id).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].source, "gateway_status");
    }

    #[tokio::test]
    async fn test_complete_twice_applies_once() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let now = Utc::now();
        let sale = seed_sale(&db, now).await;
        let payment = pending_payment(&sale.id, now);
        db.payments().insert(&payment).await.unwrap();

        db.payments().complete(request(&payment.transaction_ref, now)).await.unwrap();
        let second = db
            .payments()
            .complete(request(&payment.transaction_ref, now))
            .await
            .unwrap();

        let CompletionOutcome::AlreadyCompleted { sale, .. } = second else {
            panic!("expected AlreadyCompleted");
        };
        assert_eq!(sale.total_paid, Money::from_major(6_000));
    }

    #[tokio::test]
    async fn test_complete_unknown_reference() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let outcome = db.payments().complete(request("SP-missing", Utc::now())).await.unwrap();
        assert!(matches!(outcome, CompletionOutcome::NotFound));
    }

    #[tokio::test]
    async fn test_complete_on_cancelled_sale_refunds() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let now = Utc::now();
        let sale = seed_sale(&db, now).await;
        let payment = pending_payment(&sale.id, now);
        db.payments().insert(&payment).await.unwrap();

        db.sales().cancel_stale(&sale.id, now).await.unwrap().unwrap();

        let outcome = db
            .payments()
            .complete(request(&payment.transaction_ref, now))
            .await
            .unwrap();

        let CompletionOutcome::Refunded { payment, sale } = outcome else {
            panic!("expected Refunded");
        };
        assert_eq!(payment.status, PaymentStatus::Refunded);
        assert_eq!(sale.status, SaleStatus::Cancelled);
        assert_eq!(sale.total_paid, Money::zero());
    }

    #[tokio::test]
    async fn test_wallet_debit_short_balance_changes_nothing() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let now = Utc::now();
        let sale = seed_sale(&db, now).await;
        db.wallets().create("agent-7", now).await.unwrap();

        let mut payment = pending_payment(&sale.id, now);
        payment.method = PaymentMethod::Wallet;
        payment.agent_id = Some("agent-7".into());
        db.payments().insert(&payment).await.unwrap();

        let outcome = db
            .payments()
            .complete(CompletionRequest {
                transaction_ref: &payment.transaction_ref,
                response: None,
                wallet_debit: Some(LedgerEntry {
                    agent_id: "agent-7".into(),
                    kind: LedgerEntryKind::Debit,
                    amount: payment.amount,
                    reference: format!("{}-debit", payment.transaction_ref),
                    description: "Payment for sale".into(),
                    payment_id: Some(payment.id.clone()),
                }),
                now,
            })
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            CompletionOutcome::InsufficientBalance { balance } if balance == Money::zero()
        ));

        let stored = db.payments().get(&payment.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_pending_and_unsettled_queues() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let now = Utc::now();
        let sale = seed_sale(&db, now).await;
        let payment = pending_payment(&sale.id, now);
        db.payments().insert(&payment).await.unwrap();

        // No gateway order yet
        assert!(db.payments().list_pending(now - chrono::Duration::days(1), 10).await.unwrap().is_empty());

        db.payments()
            .set_gateway_order(&payment.id, "ord-1", "OGR-1", Some("20767"), None, now)
            .await
            .unwrap();
        assert_eq!(db.payments().list_pending(now - chrono::Duration::days(1), 10).await.unwrap().len(), 1);

        db.payments().complete(request(&payment.transaction_ref, now)).await.unwrap();
        assert_eq!(db.payments().list_unsettled(10).await.unwrap().len(), 1);

        db.payments().mark_tokens_settled(&payment.id, now).await.unwrap();
        assert!(db.payments().list_unsettled(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_failed_only_from_pending() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let now = Utc::now();
        let sale = seed_sale(&db, now).await;
        let payment = pending_payment(&sale.id, now);
        db.payments().insert(&payment).await.unwrap();

        assert!(db
            .payments()
            .mark_failed(&payment.transaction_ref, Some(("gateway_status", "{}")), now)
            .await
            .unwrap());
        assert!(!db.payments().mark_failed(&payment.transaction_ref, None, now).await.unwrap());

        // FAILED payments can still complete on retry
        let outcome = db
            .payments()
            .complete(request(&payment.transaction_ref, now))
            .await
            .unwrap();
        assert!(matches!(outcome, CompletionOutcome::Applied { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_reference_rejected() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let now = Utc::now();
        let sale = seed_sale(&db, now).await;
        let payment = pending_payment(&sale.id, now);
        db.payments().insert(&payment).await.unwrap();

        let mut dup = pending_payment(&sale.id, now);
        dup.transaction_ref = payment.transaction_ref.clone();
        let err = db.payments().insert(&dup).await.unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));
    }
}
