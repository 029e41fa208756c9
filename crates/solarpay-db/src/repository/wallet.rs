//! # Wallet Repository
//!
//! Agent wallets, the append-only ledger, and gateway top-ups.
//!
//! ## Ledger Write
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  apply_entry_in(conn, entry)                                           │
//! │                                                                         │
//! │  UPDATE wallets SET updated_at ──► 0 rows: wallet NotFound             │
//! │       │ (write lock held from here)                                    │
//! │       ▼                                                                 │
//! │  reference already in ledger? ──► Existing(txn)                        │
//! │       ▼                                                                 │
//! │  new = prev ± amount ── new < 0? ──► Insufficient { balance: prev }    │
//! │       ▼                                                                 │
//! │  UPDATE wallets SET balance = new WHERE balance = prev                 │
//! │  INSERT wallet_transactions (prev, new, reference)                     │
//! │       ▼                                                                 │
//! │  Applied(txn)                                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `apply_entry_in` runs on a caller's connection so payment completion can
//! debit in the same transaction.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use solarpay_core::{
    new_id, LedgerEntryKind, LedgerStatus, Money, Wallet, WalletTopUp, WalletTransaction,
};

// =============================================================================
// Ledger Types
// =============================================================================

/// A balance movement to be written to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub agent_id: String,
    pub kind: LedgerEntryKind,
    pub amount: Money,
    /// Idempotency key for the ledger row.
    pub reference: String,
    pub description: String,
    pub payment_id: Option<String>,
}

/// Result of writing a [`LedgerEntry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerWrite {
    /// A new ledger row was written and the balance moved.
    Applied(WalletTransaction),
    /// The reference was used before; this is the original row.
    Existing(WalletTransaction),
    /// A debit would make the balance negative. Nothing was written.
    Insufficient { balance: Money },
}

// =============================================================================
// Rows
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct WalletRow {
    id: String,
    agent_id: String,
    balance: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<WalletRow> for Wallet {
    fn from(row: WalletRow) -> Self {
        Wallet {
            id: row.id,
            agent_id: row.agent_id,
            balance: Money::from_minor(row.balance),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WalletTransactionRow {
    id: String,
    wallet_id: String,
    agent_id: String,
    kind: LedgerEntryKind,
    amount: i64,
    previous_balance: i64,
    new_balance: i64,
    reference: String,
    description: String,
    status: LedgerStatus,
    payment_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<WalletTransactionRow> for WalletTransaction {
    fn from(row: WalletTransactionRow) -> Self {
        WalletTransaction {
            id: row.id,
            wallet_id: row.wallet_id,
            agent_id: row.agent_id,
            kind: row.kind,
            amount: Money::from_minor(row.amount),
            previous_balance: Money::from_minor(row.previous_balance),
            new_balance: Money::from_minor(row.new_balance),
            reference: row.reference,
            description: row.description,
            status: row.status,
            payment_id: row.payment_id,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TopUpRow {
    id: String,
    agent_id: String,
    amount: i64,
    reference: String,
    gateway_order_id: Option<String>,
    gateway_order_ref: Option<String>,
    status: LedgerStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<TopUpRow> for WalletTopUp {
    fn from(row: TopUpRow) -> Self {
        WalletTopUp {
            id: row.id,
            agent_id: row.agent_id,
            amount: Money::from_minor(row.amount),
            reference: row.reference,
            gateway_order_id: row.gateway_order_id,
            gateway_order_ref: row.gateway_order_ref,
            status: row.status,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        }
    }
}

const TRANSACTION_COLUMNS: &str = r#"
    id, wallet_id, agent_id, kind, amount, previous_balance, new_balance,
    reference, description, status, payment_id, created_at
"#;

const TOP_UP_COLUMNS: &str = r#"
    id, agent_id, amount, reference, gateway_order_id, gateway_order_ref,
    status, created_at, updated_at, completed_at
"#;

async fn fetch_transaction(
    conn: &mut SqliteConnection,
    reference: &str,
) -> DbResult<Option<WalletTransaction>> {
    let row: Option<WalletTransactionRow> = sqlx::query_as(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM wallet_transactions WHERE reference = ?1"
    ))
    .bind(reference)
    .fetch_optional(conn)
    .await?;

    Ok(row.map(WalletTransaction::from))
}

// =============================================================================
// Ledger Write
// =============================================================================

/// Writes one ledger entry on `conn`. The caller owns the transaction.
///
/// ## Errors
/// - `NotFound` if the agent has no wallet
/// - `Conflict` if the balance moved between read and write
pub(crate) async fn apply_entry_in(
    conn: &mut SqliteConnection,
    entry: &LedgerEntry,
    now: DateTime<Utc>,
) -> DbResult<LedgerWrite> {
    let touched = sqlx::query("UPDATE wallets SET updated_at = ?2 WHERE agent_id = ?1")
        .bind(&entry.agent_id)
        .bind(now)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    if touched == 0 {
        return Err(DbError::not_found("Wallet", entry.agent_id.clone()));
    }

    if let Some(existing) = fetch_transaction(&mut *conn, &entry.reference).await? {
        debug!(reference = %entry.reference, "Ledger reference already used");
        return Ok(LedgerWrite::Existing(existing));
    }

    let (wallet_id, balance): (String, i64) =
        sqlx::query_as("SELECT id, balance FROM wallets WHERE agent_id = ?1")
            .bind(&entry.agent_id)
            .fetch_one(&mut *conn)
            .await?;

    let previous = Money::from_minor(balance);
    let new_balance = entry.kind.apply(previous, entry.amount);

    if new_balance.is_negative() {
        return Ok(LedgerWrite::Insufficient { balance: previous });
    }

    let moved = sqlx::query(
        "UPDATE wallets SET balance = ?2, updated_at = ?3 WHERE id = ?1 AND balance = ?4",
    )
    .bind(&wallet_id)
    .bind(new_balance.minor())
    .bind(now)
    .bind(previous.minor())
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if moved == 0 {
        return Err(DbError::Conflict(format!("wallet {} balance moved", entry.agent_id)));
    }

    let txn = WalletTransaction {
        id: new_id(),
        wallet_id,
        agent_id: entry.agent_id.clone(),
        kind: entry.kind,
        amount: entry.amount,
        previous_balance: previous,
        new_balance,
        reference: entry.reference.clone(),
        description: entry.description.clone(),
        status: LedgerStatus::Completed,
        payment_id: entry.payment_id.clone(),
        created_at: now,
    };

    sqlx::query(
        r#"
        INSERT INTO wallet_transactions (
            id, wallet_id, agent_id, kind, amount, previous_balance, new_balance,
            reference, description, status, payment_id, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
    )
    .bind(&txn.id)
    .bind(&txn.wallet_id)
    .bind(&txn.agent_id)
    .bind(txn.kind)
    .bind(txn.amount.minor())
    .bind(txn.previous_balance.minor())
    .bind(txn.new_balance.minor())
    .bind(&txn.reference)
    .bind(&txn.description)
    .bind(txn.status)
    .bind(&txn.payment_id)
    .bind(txn.created_at)
    .execute(&mut *conn)
    .await?;

    Ok(LedgerWrite::Applied(txn))
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for wallet database operations.
///
/// ## Usage
/// ```rust,ignore
/// let repo = db.wallets();
/// repo.create("agent-7", now).await?;
/// let write = repo.apply_entry(&entry, now).await?;
/// ```
#[derive(Debug, Clone)]
pub struct WalletRepository {
    pool: SqlitePool,
}

impl WalletRepository {
    /// Creates a new WalletRepository.
    pub fn new(pool: SqlitePool) -> Self {
        WalletRepository { pool }
    }

    /// Opens a zero-balance wallet for an agent.
    ///
    /// ## Errors
    /// `UniqueViolation` if the agent already has one.
    pub async fn create(&self, agent_id: &str, now: DateTime<Utc>) -> DbResult<Wallet> {
        let wallet = Wallet {
            id: new_id(),
            agent_id: agent_id.to_string(),
            balance: Money::zero(),
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO wallets (id, agent_id, balance, created_at, updated_at) VALUES (?1, ?2, 0, ?3, ?4)",
        )
        .bind(&wallet.id)
        .bind(&wallet.agent_id)
        .bind(wallet.created_at)
        .bind(wallet.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::UniqueViolation { field, .. } => DbError::duplicate(field, agent_id),
            other => other,
        })?;

        info!(agent_id = %agent_id, "Wallet created");
        Ok(wallet)
    }

    /// Gets an agent's wallet.
    pub async fn get_by_agent(&self, agent_id: &str) -> DbResult<Option<Wallet>> {
        let row: Option<WalletRow> = sqlx::query_as(
            "SELECT id, agent_id, balance, created_at, updated_at FROM wallets WHERE agent_id = ?1",
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Wallet::from))
    }

    /// Writes one ledger entry in its own transaction.
    ///
    /// Commits only when a new row was written.
    pub async fn apply_entry(&self, entry: &LedgerEntry, now: DateTime<Utc>) -> DbResult<LedgerWrite> {
        let mut tx = self.pool.begin().await?;
        let write = apply_entry_in(&mut tx, entry, now).await?;

        match &write {
            LedgerWrite::Applied(txn) => {
                tx.commit().await?;
                info!(
                    agent_id = %txn.agent_id,
                    kind = txn.kind.as_str(),
                    amount = %txn.amount,
                    new_balance = %txn.new_balance,
                    reference = %txn.reference,
                    "Ledger entry applied"
                );
            }
            LedgerWrite::Existing(_) | LedgerWrite::Insufficient { .. } => {
                tx.rollback().await?;
            }
        }

        Ok(write)
    }

    /// Ledger row carrying `reference`, if any.
    pub async fn find_by_reference(&self, reference: &str) -> DbResult<Option<WalletTransaction>> {
        let mut conn = self.pool.acquire().await?;
        fetch_transaction(&mut conn, reference).await
    }

    /// An agent's ledger, oldest first.
    pub async fn history(&self, agent_id: &str, limit: u32, offset: u32) -> DbResult<Vec<WalletTransaction>> {
        let rows: Vec<WalletTransactionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM wallet_transactions
            WHERE agent_id = ?1
            ORDER BY created_at, rowid
            LIMIT ?2 OFFSET ?3
            "#
        ))
        .bind(agent_id)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(WalletTransaction::from).collect())
    }

    /// Sum of the agent's ledger in posting order. Equals the cached balance
    /// when the ledger is intact.
    pub async fn ledger_balance(&self, agent_id: &str) -> DbResult<Money> {
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(CASE kind WHEN 'credit' THEN amount ELSE -amount END), 0)
            FROM wallet_transactions
            WHERE agent_id = ?1 AND status = 'completed'
            "#,
        )
        .bind(agent_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(Money::from_minor(total))
    }

    // =========================================================================
    // Top-ups
    // =========================================================================

    /// Records a new pending top-up.
    pub async fn insert_top_up(&self, top_up: &WalletTopUp) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO wallet_top_ups (
                id, agent_id, amount, reference, gateway_order_id, gateway_order_ref,
                status, created_at, updated_at, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&top_up.id)
        .bind(&top_up.agent_id)
        .bind(top_up.amount.minor())
        .bind(&top_up.reference)
        .bind(&top_up.gateway_order_id)
        .bind(&top_up.gateway_order_ref)
        .bind(top_up.status)
        .bind(top_up.created_at)
        .bind(top_up.updated_at)
        .bind(top_up.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::UniqueViolation { field, .. } => DbError::duplicate(field, top_up.reference.clone()),
            other => other,
        })?;

        Ok(())
    }

    /// Gets a top-up by reference.
    pub async fn get_top_up(&self, reference: &str) -> DbResult<Option<WalletTopUp>> {
        let row: Option<TopUpRow> = sqlx::query_as(&format!(
            "SELECT {TOP_UP_COLUMNS} FROM wallet_top_ups WHERE reference = ?1"
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(WalletTopUp::from))
    }

    /// Stores the gateway order behind a top-up.
    pub async fn set_top_up_order(
        &self,
        reference: &str,
        order_id: &str,
        order_ref: &str,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE wallet_top_ups
            SET gateway_order_id = ?2, gateway_order_ref = ?3, updated_at = ?4
            WHERE reference = ?1
            "#,
        )
        .bind(reference)
        .bind(order_id)
        .bind(order_ref)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(DbError::not_found("WalletTopUp", reference));
        }
        Ok(())
    }

    /// Credits a settled top-up and marks it completed in one transaction.
    ///
    /// Returns `None` if the top-up is not pending (already credited or
    /// failed).
    pub async fn complete_top_up(
        &self,
        reference: &str,
        description: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Option<WalletTransaction>> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            r#"
            UPDATE wallet_top_ups
            SET status = 'completed', completed_at = ?2, updated_at = ?2
            WHERE reference = ?1 AND status = 'pending'
            "#,
        )
        .bind(reference)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let (agent_id, amount): (String, i64) =
            sqlx::query_as("SELECT agent_id, amount FROM wallet_top_ups WHERE reference = ?1")
                .bind(reference)
                .fetch_one(&mut *tx)
                .await?;

        let entry = LedgerEntry {
            agent_id,
            kind: LedgerEntryKind::Credit,
            amount: Money::from_minor(amount),
            reference: reference.to_string(),
            description: description.to_string(),
            payment_id: None,
        };

        let txn = match apply_entry_in(&mut tx, &entry, now).await? {
            LedgerWrite::Applied(txn) | LedgerWrite::Existing(txn) => txn,
            LedgerWrite::Insufficient { .. } => {
                tx.rollback().await?;
                return Err(DbError::Internal("credit reported insufficient balance".into()));
            }
        };

        tx.commit().await?;

        info!(
            agent_id = %txn.agent_id,
            amount = %txn.amount,
            reference = %reference,
            "Top-up credited"
        );
        Ok(Some(txn))
    }

    /// Marks a pending top-up as failed. Returns `false` if it was not pending.
    pub async fn fail_top_up(&self, reference: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let failed = sqlx::query(
            r#"
            UPDATE wallet_top_ups
            SET status = 'failed', updated_at = ?2
            WHERE reference = ?1 AND status = 'pending'
            "#,
        )
        .bind(reference)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(failed == 1)
    }

    /// Pending top-ups with a gateway order, created since `since`.
    pub async fn list_pending_top_ups(&self, since: DateTime<Utc>, limit: u32) -> DbResult<Vec<WalletTopUp>> {
        let rows: Vec<TopUpRow> = sqlx::query_as(&format!(
            r#"
            SELECT {TOP_UP_COLUMNS}
            FROM wallet_top_ups
            WHERE status = 'pending'
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

        Ok(rows.into_iter().map(WalletTopUp::from).collect())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
