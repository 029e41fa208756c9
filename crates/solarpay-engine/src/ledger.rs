//! # Wallet Ledger
//!
//! Agent balances as an append-only log. Every movement is one SQLite
//! transaction that writes the cached balance and an immutable ledger row
//! with before/after snapshots.
//!
//! ## Serialization
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  credit / debit (agent-7, ref)                                          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  KeyedLocks["agent-7"]          one writer per agent in this process    │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  apply_entry ── reference seen? ──► Existing (idempotent no-op)        │
//! │       │                                                                 │
//! │       ├── balance < amount ──► InsufficientBalance                     │
//! │       ▼                                                                 │
//! │  UPDATE wallets ... WHERE balance = <read>  ── 0 rows ──► retry        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Top-ups add a gateway order in front: [`WalletLedger::initiate_top_up`]
//! records a pending top-up, and [`WalletLedger::reconcile_top_up`] credits
//! it exactly once after the gateway reports success.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::EngineResult;
use crate::gateway::{OrderStatus, PaymentGateway};
use crate::locks::KeyedLocks;
use crate::retry::RetryPolicy;
use solarpay_core::validation::{clamp_page_size, msisdn_or_fallback, validate_amount, validate_reference};
use solarpay_core::{
    new_id, CoreError, LedgerEntryKind, LedgerStatus, Money, Wallet, WalletTopUp, WalletTransaction, MAX_PAGE_SIZE,
};
use solarpay_db::{Database, DbError, LedgerEntry, LedgerWrite};

/// Attempts at an optimistic balance update before giving up.
const CONFLICT_ATTEMPTS: u32 = 3;

/// What [`WalletLedger::reconcile_top_up`] found.
#[derive(Debug, Clone)]
pub enum TopUpReconciliation {
    /// This call credited the wallet.
    Credited(WalletTransaction),
    /// An earlier call credited it.
    AlreadyCompleted(Option<WalletTransaction>),
    /// Gateway has not settled yet, or could not be reached.
    Pending,
    /// Gateway reported failure; the top-up will not be credited.
    Failed,
}

/// Agent wallet operations.
pub struct WalletLedger {
    db: Database,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    agent_locks: KeyedLocks,
    top_up_locks: KeyedLocks,
}

impl WalletLedger {
    pub fn new(db: Database, gateway: Arc<dyn PaymentGateway>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        WalletLedger {
            db,
            gateway,
            clock,
            retry,
            agent_locks: KeyedLocks::new(),
            top_up_locks: KeyedLocks::new(),
        }
    }

    /// Exclusive access to an agent's balance.
    ///
    /// Held by every writer of the wallet, including payment completion with
    /// a wallet debit.
    pub(crate) async fn lock_agent(&self, agent_id: &str) -> OwnedMutexGuard<()> {
        self.agent_locks.lock(agent_id).await
    }

    // =========================================================================
    // Wallets
    // =========================================================================

    /// Opens a zero-balance wallet for an agent.
    pub async fn create_wallet(&self, agent_id: &str) -> EngineResult<Wallet> {
        validate_reference("agent_id", agent_id)?;
        Ok(self.db.wallets().create(agent_id, self.clock.now()).await?)
    }

    /// Cached balance of an agent's wallet.
    pub async fn balance(&self, agent_id: &str) -> EngineResult<Money> {
        let wallet = self.wallet(agent_id).await?;
        Ok(wallet.balance)
    }

    /// One page of an agent's ledger, oldest first. `page` starts at 1.
    pub async fn history(&self, agent_id: &str, page: u32, page_size: u32) -> EngineResult<Vec<WalletTransaction>> {
        self.wallet(agent_id).await?;

        let limit = clamp_page_size(page_size, MAX_PAGE_SIZE);
        let offset = page.saturating_sub(1).saturating_mul(limit);
        Ok(self.db.wallets().history(agent_id, limit, offset).await?)
    }

    async fn wallet(&self, agent_id: &str) -> EngineResult<Wallet> {
        self.db
            .wallets()
            .get_by_agent(agent_id)
            .await?
            .ok_or_else(|| CoreError::WalletNotFound(agent_id.to_string()).into())
    }

    // =========================================================================
    // Credit / Debit
    // =========================================================================

    /// Adds `amount` to the agent's wallet.
    ///
    /// A reused `reference` returns the transaction already recorded for it.
    pub async fn credit(
        &self,
        agent_id: &str,
        amount: Money,
        reference: &str,
        description: &str,
    ) -> EngineResult<WalletTransaction> {
        self.post(LedgerEntry {
            agent_id: agent_id.to_string(),
            kind: LedgerEntryKind::Credit,
            amount,
            reference: reference.to_string(),
            description: description.to_string(),
            payment_id: None,
        })
        .await
    }

    /// Takes `amount` from the agent's wallet.
    ///
    /// ## Errors
    /// `InsufficientBalance` if the wallet holds less than `amount`.
    pub async fn debit(
        &self,
        agent_id: &str,
        amount: Money,
        reference: &str,
        description: &str,
    ) -> EngineResult<WalletTransaction> {
        self.post(LedgerEntry {
            agent_id: agent_id.to_string(),
            kind: LedgerEntryKind::Debit,
            amount,
            reference: reference.to_string(),
            description: description.to_string(),
            payment_id: None,
        })
        .await
    }

    async fn post(&self, entry: LedgerEntry) -> EngineResult<WalletTransaction> {
        validate_amount(entry.amount)?;
        validate_reference("reference", &entry.reference)?;

        let _guard = self.lock_agent(&entry.agent_id).await;
        let mut attempt = 1;

        loop {
            match self.db.wallets().apply_entry(&entry, self.clock.now()).await {
                Ok(LedgerWrite::Applied(txn)) => return Ok(txn),
                Ok(LedgerWrite::Existing(txn)) => {
                    debug!(reference = %entry.reference, "Ledger entry already recorded");
                    return Ok(txn);
                }
                Ok(LedgerWrite::Insufficient { balance }) => {
                    return Err(CoreError::InsufficientBalance {
                        agent_id: entry.agent_id.clone(),
                        balance,
                        requested: entry.amount,
                    }
                    .into());
                }
                Err(DbError::NotFound { .. }) => {
                    return Err(CoreError::WalletNotFound(entry.agent_id.clone()).into());
                }
                Err(e) if e.is_transient() && attempt < CONFLICT_ATTEMPTS => {
                    warn!(agent_id = %entry.agent_id, attempt, error = %e, "Ledger write conflicted, retrying");
                    tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // =========================================================================
    // Top-ups
    // =========================================================================

    /// Opens a gateway order that will credit the wallet once paid.
    ///
    /// The top-up row is written first so a crash after the gateway call
    /// still leaves something for the poller to reconcile.
    pub async fn initiate_top_up(
        &self,
        agent_id: &str,
        amount: Money,
        reference: &str,
        phone: Option<&str>,
    ) -> EngineResult<WalletTopUp> {
        validate_amount(amount)?;
        validate_reference("reference", reference)?;
        self.wallet(agent_id).await?;

        let now = self.clock.now();
        let mut top_up = WalletTopUp {
            id: new_id(),
            agent_id: agent_id.to_string(),
            amount,
            reference: reference.to_string(),
            gateway_order_id: None,
            gateway_order_ref: None,
            status: LedgerStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.db.wallets().insert_top_up(&top_up).await?;

        let msisdn = msisdn_or_fallback(phone);
        let description = format!("Wallet top-up for agent {}", agent_id);

        let order = self
            .retry
            .run("create_order", || {
                self.gateway.create_order(amount, &msisdn, &description, reference)
            })
            .await;

        let order = match order {
            Ok(order) => order,
            Err(e) => {
                warn!(reference = %reference, error = %e, "Top-up order creation failed");
                self.db.wallets().fail_top_up(reference, self.clock.now()).await?;
                return Err(e);
            }
        };

        let now = self.clock.now();
        self.db
            .wallets()
            .set_top_up_order(reference, &order.order_id, &order.order_reference, now)
            .await?;

        top_up.gateway_order_id = Some(order.order_id);
        top_up.gateway_order_ref = Some(order.order_reference);
        top_up.updated_at = now;

        info!(agent_id = %agent_id, reference = %reference, amount = %amount, "Top-up initiated");
        Ok(top_up)
    }

    /// Checks a pending top-up with the gateway and credits it once.
    ///
    /// Safe to call repeatedly and concurrently for the same reference.
    pub async fn reconcile_top_up(&self, reference: &str) -> EngineResult<TopUpReconciliation> {
        let _guard = self.top_up_locks.lock(reference).await;

        let top_up = self
            .db
            .wallets()
            .get_top_up(reference)
            .await?
            .ok_or_else(|| CoreError::TopUpNotFound(reference.to_string()))?;

        match top_up.status {
            LedgerStatus::Completed => {
                let txn = self.db.wallets().find_by_reference(reference).await?;
                return Ok(TopUpReconciliation::AlreadyCompleted(txn));
            }
            LedgerStatus::Failed => return Ok(TopUpReconciliation::Failed),
            LedgerStatus::Pending => {}
        }

        let order_ref = top_up.gateway_order_ref.as_deref().unwrap_or(reference);
        let status = match self
            .retry
            .run("check_status", || self.gateway.check_status(order_ref))
            .await
        {
            Ok(status) => status,
            Err(e) if e.is_retryable() => {
                warn!(reference = %reference, error = %e, "Gateway unavailable, top-up left pending");
                return Ok(TopUpReconciliation::Pending);
            }
            Err(e) => return Err(e),
        };

        match status.status {
            OrderStatus::Successful => {
                let _agent = self.lock_agent(&top_up.agent_id).await;
                let credited = self
                    .db
                    .wallets()
                    .complete_top_up(reference, "Wallet top-up verified via Ogaranya", self.clock.now())
                    .await?;

                match credited {
                    Some(txn) => Ok(TopUpReconciliation::Credited(txn)),
                    None => {
                        let txn = self.db.wallets().find_by_reference(reference).await?;
                        Ok(TopUpReconciliation::AlreadyCompleted(txn))
                    }
                }
            }
            OrderStatus::Failed => {
                self.db.wallets().fail_top_up(reference, self.clock.now()).await?;
                info!(reference = %reference, "Top-up failed at gateway");
                Ok(TopUpReconciliation::Failed)
            }
            OrderStatus::Pending => Ok(TopUpReconciliation::Pending),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
