//! # Payment Reconciliation Engine
//!
//! Turns a payment confirmation trigger (webhook, manual re-check, poller)
//! into exactly one application of the payment to its sale.
//!
//! ## State Machine
//! ```text
//!                 ┌──────────── gateway FAILED ───────────┐
//!                 │                                       ▼
//!   ┌─────────┐   │  gateway SUCCESSFUL / cash / wallet ┌────────┐
//!   │ PENDING │───┴───────────────────────────────────► │ FAILED │ (retriable)
//!   └────┬────┘                                         └───┬────┘
//!        │ success on live sale                             │ success
//!        ▼                                                  ▼
//!   ┌───────────┐                                    ┌───────────┐
//!   │ COMPLETED │ ◄──────────────────────────────────│ COMPLETED │
//!   └───────────┘                                    └───────────┘
//!        success on CANCELLED sale ──► REFUNDED (terminal, sale untouched)
//! ```
//!
//! ## Reconcile Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  reconcile_payment(ref)          under KeyedLocks[ref]                  │
//! │                                                                         │
//! │  1. load payment ── missing ──► PaymentNotFound                         │
//! │  2. COMPLETED / REFUNDED ──► idempotent answer                          │
//! │  3. confirm:  ONLINE → gateway.check_status (bounded retry)             │
//! │               CASH   → agent confirmation                               │
//! │               WALLET → debit inside step 4                              │
//! │  4. payments().complete(..)     ONE transaction                         │
//! │  ─────────────────────────── commit ─────────────────────────────────── │
//! │  5. best effort, each step isolated:                                    │
//! │       tokens ──► token notification ──► account details (once)         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything after the commit can be re-run from committed state, so a
//! crash between 4 and 5 loses nothing: the poller picks up unsettled tokens.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::gateway::{OrderStatus, PaymentGateway, WebhookEvent};
use crate::ledger::WalletLedger;
use crate::locks::KeyedLocks;
use crate::notify::Notifier;
use crate::protocol::TokenProtocol;
use crate::retry::RetryPolicy;
use crate::tokens::{TokenBatch, TokenIssuanceCoordinator};
use solarpay_core::validation::{msisdn_or_fallback, validate_amount, validate_reference};
use solarpay_core::{
    new_id, CoreError, DeviceToken, LedgerEntryKind, Money, Payment, PaymentMethod, PaymentStatus, Sale,
    ValidationError,
};
use solarpay_db::{CompletionOutcome, CompletionRequest, Database, DbError, LedgerEntry};

/// Attempts at the completion transaction when the database reports a
/// transient failure.
const COMPLETION_ATTEMPTS: u32 = 3;

// =============================================================================
// Result Types
// =============================================================================

/// How a reconcile call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconciliationStatus {
    /// This call applied the payment.
    Completed,
    /// The payment was applied earlier.
    AlreadyCompleted,
    /// Not settled yet (or the gateway could not be reached). Nothing changed.
    Pending,
    /// The gateway reported failure. The payment may be retried.
    Failed,
    /// Money arrived for a cancelled sale.
    Refunded,
}

impl std::fmt::Display for ReconciliationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconciliationStatus::Completed => write!(f, "completed"),
            ReconciliationStatus::AlreadyCompleted => write!(f, "already_completed"),
            ReconciliationStatus::Pending => write!(f, "pending"),
            ReconciliationStatus::Failed => write!(f, "failed"),
            ReconciliationStatus::Refunded => write!(f, "refunded"),
        }
    }
}

/// Answer of [`ReconciliationEngine::reconcile_payment`].
#[derive(Debug, Clone)]
pub struct ReconciliationResult {
    pub status: ReconciliationStatus,
    pub sale: Sale,
    /// Tokens minted by this call.
    pub issued_tokens: Vec<DeviceToken>,
    /// Devices left without their token; retried by the poller.
    pub failed_devices: Vec<String>,
}

impl ReconciliationResult {
    fn without_tokens(status: ReconciliationStatus, sale: Sale) -> Self {
        ReconciliationResult {
            status,
            sale,
            issued_tokens: Vec::new(),
            failed_devices: Vec::new(),
        }
    }

    /// True once the payment is applied, by this call or an earlier one.
    pub fn is_settled(&self) -> bool {
        matches!(
            self.status,
            ReconciliationStatus::Completed | ReconciliationStatus::AlreadyCompleted
        )
    }
}

/// Input to [`ReconciliationEngine::initiate_payment`].
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub sale_id: String,
    pub amount: Money,
    pub transaction_ref: String,
    pub method: PaymentMethod,
    /// Paying agent. Required for WALLET, recorded for CASH.
    pub agent_id: Option<String>,
}

/// How a payment is confirmed.
enum Confirmation {
    Settled { source: &'static str, body: String },
    Pending,
    Failed { body: String },
}

// =============================================================================
// Engine
// =============================================================================

/// The reconciliation orchestrator.
pub struct ReconciliationEngine {
    db: Database,
    gateway: Arc<dyn PaymentGateway>,
    tokens: Arc<TokenIssuanceCoordinator>,
    ledger: Arc<WalletLedger>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    payment_locks: KeyedLocks,
}

impl ReconciliationEngine {
    pub fn new(
        db: Database,
        gateway: Arc<dyn PaymentGateway>,
        tokens: Arc<TokenIssuanceCoordinator>,
        ledger: Arc<WalletLedger>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        ReconciliationEngine {
            db,
            gateway,
            tokens,
            ledger,
            notifier,
            clock,
            retry,
            payment_locks: KeyedLocks::new(),
        }
    }

    /// Wires the ledger, the token coordinator and the engine from one
    /// configuration.
    pub fn assemble(
        db: Database,
        config: &EngineConfig,
        gateway: Arc<dyn PaymentGateway>,
        protocol: Arc<dyn TokenProtocol>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let retry = RetryPolicy::from(&config.retry);
        let ledger = Arc::new(WalletLedger::new(
            db.clone(),
            Arc::clone(&gateway),
            Arc::clone(&clock),
            retry.clone(),
        ));
        let tokens = Arc::new(TokenIssuanceCoordinator::new(
            db.clone(),
            protocol,
            Arc::clone(&clock),
            retry.clone(),
            config.tokens.max_parallel_devices,
        ));

        ReconciliationEngine::new(db, gateway, tokens, ledger, notifier, clock, retry)
    }

    /// Token coordinator used for post-commit issuance.
    pub fn tokens(&self) -> &Arc<TokenIssuanceCoordinator> {
        &self.tokens
    }

    /// Wallet ledger used for WALLET payments.
    pub fn ledger(&self) -> &Arc<WalletLedger> {
        &self.ledger
    }

    // =========================================================================
    // Initiation
    // =========================================================================

    /// Records a PENDING payment and, for ONLINE payments, opens the gateway
    /// order the customer pays against.
    ///
    /// ## Errors
    /// - `SaleNotFound`, `InvalidSaleStatus` for closed sales
    /// - `UniqueViolation` if the transaction reference is taken
    /// - gateway errors (the payment is then marked FAILED)
    pub async fn initiate_payment(&self, request: PaymentRequest) -> EngineResult<Payment> {
        validate_amount(request.amount)?;
        validate_reference("transaction_ref", &request.transaction_ref)?;

        let sale = self.load_sale(&request.sale_id).await?;
        if sale.status.is_terminal() {
            return Err(CoreError::InvalidSaleStatus {
                sale_id: sale.id,
                current_status: sale.status.to_string(),
            }
            .into());
        }

        if request.method == PaymentMethod::Wallet && request.agent_id.is_none() {
            return Err(ValidationError::Required {
                field: "agent_id".into(),
            }
            .into());
        }

        let now = self.clock.now();
        let payment = Payment {
            id: new_id(),
            sale_id: sale.id.clone(),
            amount: request.amount,
            transaction_ref: request.transaction_ref.clone(),
            method: request.method,
            status: PaymentStatus::Pending,
            agent_id: request.agent_id.clone(),
            gateway_order_id: None,
            gateway_order_ref: None,
            sms_number: None,
            sms_message: None,
            months_covered: None,
            tokens_settled_at: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.db.payments().insert(&payment).await?;

        if request.method != PaymentMethod::Online {
            info!(
                transaction_ref = %payment.transaction_ref,
                method = payment.method.as_str(),
                "Payment recorded, awaiting confirmation"
            );
            return Ok(payment);
        }

        let contact = self.db.sales().contact(&sale.id).await?;
        let msisdn = msisdn_or_fallback(contact.as_ref().and_then(|c| c.phone.as_deref()));
        let description = format!("Payment for sale {}", sale.id);

        let order = match self
            .retry
            .run("create_order", || {
                self.gateway
                    .create_order(request.amount, &msisdn, &description, &request.transaction_ref)
            })
            .await
        {
            Ok(order) => order,
            Err(e) => {
                warn!(transaction_ref = %payment.transaction_ref, error = %e, "Gateway order creation failed");
                let body = json!({ "error": e.to_string() }).to_string();
                self.db
                    .payments()
                    .mark_failed(&payment.transaction_ref, Some(("order_creation", &body)), self.clock.now())
                    .await?;
                return Err(e);
            }
        };

        self.db
            .payments()
            .set_gateway_order(
                &payment.id,
                &order.order_id,
                &order.order_reference,
                order.sms_number.as_deref(),
                order.message.as_deref(),
                self.clock.now(),
            )
            .await?;

        info!(
            transaction_ref = %payment.transaction_ref,
            order_reference = %order.order_reference,
            amount = %payment.amount,
            "Online payment initiated"
        );

        self.db
            .payments()
            .get(&payment.id)
            .await?
            .ok_or_else(|| CoreError::PaymentNotFound(payment.transaction_ref.clone()).into())
    }

    // =========================================================================
    // Webhook Intake
    // =========================================================================

    /// Records a gateway webhook on the payment's audit trail, then
    /// reconciles. The webhook body is never trusted for the status; the
    /// gateway is asked again.
    pub async fn handle_webhook(&self, raw: serde_json::Value) -> EngineResult<ReconciliationResult> {
        let event = WebhookEvent::parse(raw)?;

        let payment = self
            .db
            .payments()
            .get_by_transaction_ref(&event.transaction_ref)
            .await?
            .ok_or_else(|| CoreError::PaymentNotFound(event.transaction_ref.clone()))?;

        if payment.method != PaymentMethod::Online {
            return Err(CoreError::UnsupportedMethod {
                transaction_ref: payment.transaction_ref,
                method: payment.method.as_str().to_string(),
                operation: "gateway webhooks".into(),
            }
            .into());
        }

        self.db
            .payments()
            .record_response(&payment.id, "webhook", &event.raw.to_string(), self.clock.now())
            .await?;

        debug!(
            transaction_ref = %event.transaction_ref,
            reported_status = %event.reported_status,
            "Webhook recorded"
        );

        self.reconcile_payment(&event.transaction_ref).await
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Applies a payment to its sale if, and only if, it has settled.
    ///
    /// Safe to call any number of times, concurrently, from any trigger.
    pub async fn reconcile_payment(&self, transaction_ref: &str) -> EngineResult<ReconciliationResult> {
        let _guard = self.payment_locks.lock(transaction_ref).await;

        let payment = self
            .db
            .payments()
            .get_by_transaction_ref(transaction_ref)
            .await?
            .ok_or_else(|| CoreError::PaymentNotFound(transaction_ref.to_string()))?;

        match payment.status {
            PaymentStatus::Completed => {
                let sale = self.load_sale(&payment.sale_id).await?;
                debug!(transaction_ref = %transaction_ref, "Payment already completed");
                return Ok(ReconciliationResult::without_tokens(
                    ReconciliationStatus::AlreadyCompleted,
                    sale,
                ));
            }
            PaymentStatus::Refunded => {
                let sale = self.load_sale(&payment.sale_id).await?;
                return Ok(ReconciliationResult::without_tokens(ReconciliationStatus::Refunded, sale));
            }
            PaymentStatus::Pending | PaymentStatus::Failed => {}
        }

        match self.confirm(&payment).await? {
            Confirmation::Settled { source, body } => self.complete(&payment, source, &body).await,
            Confirmation::Pending => {
                let sale = self.load_sale(&payment.sale_id).await?;
                debug!(transaction_ref = %transaction_ref, "Payment still pending");
                Ok(ReconciliationResult::without_tokens(ReconciliationStatus::Pending, sale))
            }
            Confirmation::Failed { body } => {
                self.db
                    .payments()
                    .mark_failed(transaction_ref, Some(("gateway_status", &body)), self.clock.now())
                    .await?;
                let sale = self.load_sale(&payment.sale_id).await?;
                info!(transaction_ref = %transaction_ref, "Payment failed at gateway");
                Ok(ReconciliationResult::without_tokens(ReconciliationStatus::Failed, sale))
            }
        }
    }

    /// Re-runs token issuance for a completed payment.
    pub async fn retry_token_issuance(&self, transaction_ref: &str) -> EngineResult<TokenBatch> {
        let batch = self.tokens.retry_for_payment(transaction_ref).await?;

        if !batch.issued.is_empty() {
            if let Some(payment) = self.db.payments().get_by_transaction_ref(transaction_ref).await? {
                self.notify_tokens(&payment.sale_id, &batch.issued).await;
            }
        }
        Ok(batch)
    }

    /// Decides whether the payment has settled.
    async fn confirm(&self, payment: &Payment) -> EngineResult<Confirmation> {
        match payment.method {
            PaymentMethod::Online => {
                let order_ref = payment
                    .gateway_order_ref
                    .as_deref()
                    .unwrap_or(&payment.transaction_ref);

                let status = match self
                    .retry
                    .run("check_status", || self.gateway.check_status(order_ref))
                    .await
                {
                    Ok(status) => status,
                    Err(e) if e.is_retryable() => {
                        warn!(
                            transaction_ref = %payment.transaction_ref,
                            error = %e,
                            "Gateway unavailable, payment left pending"
                        );
                        return Ok(Confirmation::Pending);
                    }
                    Err(e) => return Err(e),
                };

                Ok(match status.status {
                    OrderStatus::Successful => Confirmation::Settled {
                        source: "gateway_status",
                        body: status.raw.to_string(),
                    },
                    OrderStatus::Pending => Confirmation::Pending,
                    OrderStatus::Failed => Confirmation::Failed {
                        body: status.raw.to_string(),
                    },
                })
            }
            PaymentMethod::Cash => Ok(Confirmation::Settled {
                source: "cash_confirmation",
                body: json!({
                    "method": "CASH",
                    "agent_id": payment.agent_id,
                })
                .to_string(),
            }),
            PaymentMethod::Wallet => Ok(Confirmation::Settled {
                source: "wallet_debit",
                body: json!({
                    "method": "WALLET",
                    "agent_id": payment.agent_id,
                })
                .to_string(),
            }),
        }
    }

    /// Step 4 and, when this call applied the payment, step 5.
    async fn complete(&self, payment: &Payment, source: &str, body: &str) -> EngineResult<ReconciliationResult> {
        let wallet_debit = match payment.method {
            PaymentMethod::Wallet => {
                let agent_id = payment.agent_id.clone().ok_or_else(|| ValidationError::Required {
                    field: "agent_id".into(),
                })?;
                Some(LedgerEntry {
                    agent_id,
                    kind: LedgerEntryKind::Debit,
                    amount: payment.amount,
                    reference: format!("PAY-{}", payment.transaction_ref),
                    description: format!("Payment for sale {}", payment.sale_id),
                    payment_id: Some(payment.id.clone()),
                })
            }
            _ => None,
        };

        let agent_guard = match &wallet_debit {
            Some(entry) => Some(self.ledger.lock_agent(&entry.agent_id).await),
            None => None,
        };

        let mut attempt = 1;
        let outcome = loop {
            let request = CompletionRequest {
                transaction_ref: &payment.transaction_ref,
                response: Some((source, body)),
                wallet_debit: wallet_debit.clone(),
                now: self.clock.now(),
            };

            match self.db.payments().complete(request).await {
                Ok(outcome) => break outcome,
                Err(e) if e.is_transient() && attempt < COMPLETION_ATTEMPTS => {
                    warn!(transaction_ref = %payment.transaction_ref, attempt, error = %e, "Completion conflicted, retrying");
                    tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(DbError::NotFound { entity, .. }) if entity == "Wallet" => {
                    let agent_id = payment.agent_id.clone().unwrap_or_default();
                    return Err(CoreError::WalletNotFound(agent_id).into());
                }
                Err(e) => return Err(e.into()),
            }
        };

        match outcome {
            CompletionOutcome::Applied { payment, sale, .. } => {
                drop(agent_guard);
                Ok(self.after_commit(&payment, sale).await)
            }
            CompletionOutcome::AlreadyCompleted { sale, .. } => Ok(ReconciliationResult::without_tokens(
                ReconciliationStatus::AlreadyCompleted,
                sale,
            )),
            CompletionOutcome::Refunded { sale, .. } => {
                Ok(ReconciliationResult::without_tokens(ReconciliationStatus::Refunded, sale))
            }
            CompletionOutcome::InsufficientBalance { balance } => Err(CoreError::InsufficientBalance {
                agent_id: payment.agent_id.clone().unwrap_or_default(),
                balance,
                requested: payment.amount,
            }
            .into()),
            CompletionOutcome::NotFound => Err(CoreError::PaymentNotFound(payment.transaction_ref.clone()).into()),
        }
    }

    // =========================================================================
    // Post-commit (best effort)
    // =========================================================================

    async fn after_commit(&self, payment: &Payment, sale: Sale) -> ReconciliationResult {
        let batch = match self.tokens.issue_for_payment(payment).await {
            Ok(batch) => batch,
            Err(e) => {
                error!(
                    transaction_ref = %payment.transaction_ref,
                    error = %e,
                    "Token issuance failed, left for retry"
                );
                TokenBatch::default()
            }
        };

        if !batch.issued.is_empty() {
            self.notify_tokens(&sale.id, &batch.issued).await;
        }

        self.deliver_account_details(&sale).await;

        ReconciliationResult {
            status: ReconciliationStatus::Completed,
            sale,
            issued_tokens: batch.issued,
            failed_devices: batch.failed_devices,
        }
    }

    async fn notify_tokens(&self, sale_id: &str, tokens: &[DeviceToken]) {
        let contact = match self.db.sales().contact(sale_id).await {
            Ok(Some(contact)) => contact,
            Ok(None) => {
                warn!(sale_id = %sale_id, "No customer contact, tokens not sent");
                return;
            }
            Err(e) => {
                error!(sale_id = %sale_id, error = %e, "Failed to load customer contact");
                return;
            }
        };

        if let Err(e) = self.notifier.send_tokens(&contact, tokens).await {
            error!(sale_id = %sale_id, error = %e, "Token notification failed");
        }
    }

    /// Sends the installment account details once per sale.
    async fn deliver_account_details(&self, sale: &Sale) {
        if sale.payment_method != PaymentMethod::Online || sale.delivered_account_details {
            return;
        }
        let Some(details) = &sale.account_details else {
            return;
        };

        let claimed = match self
            .db
            .sales()
            .claim_account_details_delivery(&sale.id, self.clock.now())
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(sale_id = %sale.id, error = %e, "Failed to claim account details delivery");
                return;
            }
        };
        if !claimed {
            return;
        }

        let sent = match self.db.sales().contact(&sale.id).await {
            Ok(Some(contact)) => self.notifier.send_account_details(&contact, details).await,
            Ok(None) => Err(EngineError::Internal(format!("sale {} has no customer contact", sale.id))),
            Err(e) => Err(e.into()),
        };

        match sent {
            Ok(()) => info!(sale_id = %sale.id, "Installment account details delivered"),
            Err(e) => {
                error!(sale_id = %sale.id, error = %e, "Account details delivery failed");
                if let Err(e) = self.db.sales().release_account_details_delivery(&sale.id).await {
                    error!(sale_id = %sale.id, error = %e, "Failed to release account details claim");
                }
            }
        }
    }

    async fn load_sale(&self, sale_id: &str) -> EngineResult<Sale> {
        self.db
            .sales()
            .get(sale_id)
            .await?
            .ok_or_else(|| CoreError::SaleNotFound(sale_id.to_string()).into())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{harness, seed_payment, seed_sale, Harness, SalePlan};
    use solarpay_core::{SaleStatus, MAX_REFERENCE_LEN};

    fn request(sale: &Sale, amount: i64, method: PaymentMethod) -> PaymentRequest {
        PaymentRequest {
            sale_id: sale.id.clone(),
            amount: Money::from_major(amount),
            transaction_ref: format!("SP-{}", new_id()),
            method,
            agent_id: sale.agent_id.clone(),
        }
    }

    async fn online_payment(h: &Harness, sale: &Sale, amount: i64) -> Payment {
        h.engine
            .initiate_payment(request(sale, amount, PaymentMethod::Online))
            .await
            .unwrap()
    }

    async fn reload_payment(h: &Harness, transaction_ref: &str) -> Payment {
        h.db.payments().get_by_transaction_ref(transaction_ref).await.unwrap().unwrap()
    }

    async fn reload_sale(h: &Harness, sale_id: &str) -> Sale {
        h.db.sales().get(sale_id).await.unwrap().unwrap()
    }

    // -------------------------------------------------------------------------
    // Initiation
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_initiate_online_payment_opens_order() {
        let h = harness().await;
        let (sale, _) = seed_sale(&h.db, h.clock.now(), SalePlan::installment(1)).await;

        let payment = online_payment(&h, &sale, 6_000).await;

        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(
            payment.gateway_order_ref.as_deref(),
            Some(format!("OREF-{}", payment.transaction_ref).as_str())
        );

        let orders = h.gateway.orders.lock().unwrap().clone();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].2, "2348031234567");
        assert_eq!(orders[0].3, format!("Payment for sale {}", sale.id));
    }

    #[tokio::test]
    async fn test_initiate_rejects_closed_sale() {
        let h = harness().await;
        let (sale, _) = seed_sale(&h.db, h.clock.now(), SalePlan::installment(0)).await;
        h.db.sales().cancel_stale(&sale.id, h.clock.now()).await.unwrap();

        let err = h
            .engine
            .initiate_payment(request(&sale, 6_000, PaymentMethod::Online))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Core(CoreError::InvalidSaleStatus { .. })));
    }

    #[tokio::test]
    async fn test_initiate_validates_input() {
        let h = harness().await;
        let (sale, _) = seed_sale(&h.db, h.clock.now(), SalePlan::installment(0)).await;

        let zero = request(&sale, 0, PaymentMethod::Online);
        assert!(h.engine.initiate_payment(zero).await.is_err());

        let mut long_ref = request(&sale, 6_000, PaymentMethod::Online);
        long_ref.transaction_ref = "x".repeat(MAX_REFERENCE_LEN + 1);
        assert!(h.engine.initiate_payment(long_ref).await.is_err());

        let wallet_without_agent = request(&sale, 6_000, PaymentMethod::Wallet);
        let err = h.engine.initiate_payment(wallet_without_agent).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Core(CoreError::Validation(ValidationError::Required { .. }))
        ));
    }

    #[tokio::test]
    async fn test_initiate_rejects_duplicate_reference() {
        let h = harness().await;
        let (sale, _) = seed_sale(&h.db, h.clock.now(), SalePlan::installment(0)).await;

        let first = request(&sale, 6_000, PaymentMethod::Online);
        let duplicate = first.clone();
        h.engine.initiate_payment(first).await.unwrap();

        let err = h.engine.initiate_payment(duplicate).await.unwrap_err();
        assert!(matches!(err, EngineError::Database(DbError::UniqueViolation { .. })));
    }

    #[tokio::test]
    async fn test_initiate_marks_payment_failed_when_gateway_rejects() {
        let h = harness().await;
        let (sale, _) = seed_sale(&h.db, h.clock.now(), SalePlan::installment(0)).await;
        h.gateway.reject_orders.store(true, std::sync::atomic::Ordering::SeqCst);

        let req = request(&sale, 6_000, PaymentMethod::Online);
        let transaction_ref = req.transaction_ref.clone();
        let err = h.engine.initiate_payment(req).await.unwrap_err();
        assert!(matches!(err, EngineError::GatewayRejected { status: 400, .. }));

        let payment = reload_payment(&h, &transaction_ref).await;
        assert_eq!(payment.status, PaymentStatus::Failed);
    }

    // -------------------------------------------------------------------------
    // Online reconciliation
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_successful_payment_advances_sale_and_issues_tokens() {
        let h = harness().await;
        let (sale, devices) = seed_sale(&h.db, h.clock.now(), SalePlan::installment(2)).await;
        let payment = online_payment(&h, &sale, 12_000).await;
        h.gateway.set_status(&payment.transaction_ref, OrderStatus::Successful);

        let result = h.engine.reconcile_payment(&payment.transaction_ref).await.unwrap();

        assert_eq!(result.status, ReconciliationStatus::Completed);
        assert_eq!(result.sale.status, SaleStatus::InInstallment);
        assert_eq!(result.sale.remaining_installments, 22);
        assert_eq!(result.sale.total_paid, Money::from_major(12_000));
        assert_eq!(result.issued_tokens.len(), 2);
        assert!(result.issued_tokens.iter().all(|t| t.duration_days == 60));
        assert!(result.failed_devices.is_empty());

        let stored = reload_payment(&h, &payment.transaction_ref).await;
        assert_eq!(stored.status, PaymentStatus::Completed);
        assert_eq!(stored.months_covered, Some(2));
        assert!(stored.tokens_settled_at.is_some());

        for device in &devices {
            let device = h.db.devices().get(&device.id).await.unwrap().unwrap();
            assert_eq!(device.count, 1);
        }

        assert_eq!(h.notifier.token_messages(), 1);
        assert_eq!(h.notifier.details_count(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_twice_applies_once() {
        let h = harness().await;
        let (sale, _) = seed_sale(&h.db, h.clock.now(), SalePlan::installment(1)).await;
        let payment = online_payment(&h, &sale, 6_000).await;
        h.gateway.set_status(&payment.transaction_ref, OrderStatus::Successful);

        let first = h.engine.reconcile_payment(&payment.transaction_ref).await.unwrap();
        let checks = h.gateway.checks();
        let token_calls = h.protocol.call_count();

        let second = h.engine.reconcile_payment(&payment.transaction_ref).await.unwrap();

        assert_eq!(first.status, ReconciliationStatus::Completed);
        assert_eq!(second.status, ReconciliationStatus::AlreadyCompleted);
        assert_eq!(second.sale.total_paid, Money::from_major(6_000));
        assert!(second.issued_tokens.is_empty());
        assert_eq!(h.gateway.checks(), checks);
        assert_eq!(h.protocol.call_count(), token_calls);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reconcile_applies_once() {
        let h = harness().await;
        let (sale, devices) = seed_sale(&h.db, h.clock.now(), SalePlan::installment(2)).await;
        let payment = online_payment(&h, &sale, 6_000).await;
        h.gateway.set_status(&payment.transaction_ref, OrderStatus::Successful);

        let mut handles = Vec::new();
        for _ in 0..6 {
            let engine = Arc::clone(&h.engine);
            let transaction_ref = payment.transaction_ref.clone();
            handles.push(tokio::spawn(async move { engine.reconcile_payment(&transaction_ref).await }));
        }

        let mut completed = 0;
        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert!(result.is_settled());
            if result.status == ReconciliationStatus::Completed {
                completed += 1;
            }
        }
        assert_eq!(completed, 1);

        let sale = reload_sale(&h, &sale.id).await;
        assert_eq!(sale.total_paid, Money::from_major(6_000));
        assert_eq!(sale.remaining_installments, 23);

        let tokens = h.db.devices().tokens_for_payment(&payment.id).await.unwrap();
        assert_eq!(tokens.len(), devices.len());
        assert_eq!(h.notifier.details_count(), 1);
    }

    #[tokio::test]
    async fn test_pending_gateway_changes_nothing() {
        let h = harness().await;
        let (sale, _) = seed_sale(&h.db, h.clock.now(), SalePlan::installment(1)).await;
        let payment = online_payment(&h, &sale, 6_000).await;

        let result = h.engine.reconcile_payment(&payment.transaction_ref).await.unwrap();

        assert_eq!(result.status, ReconciliationStatus::Pending);
        assert_eq!(result.sale.total_paid, Money::zero());
        assert_eq!(reload_payment(&h, &payment.transaction_ref).await.status, PaymentStatus::Pending);
        assert_eq!(h.protocol.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_gateway_leaves_payment_pending() {
        let h = harness().await;
        let (sale, _) = seed_sale(&h.db, h.clock.now(), SalePlan::installment(1)).await;
        let payment = online_payment(&h, &sale, 6_000).await;
        h.gateway.set_status(&payment.transaction_ref, OrderStatus::Successful);
        h.gateway.unreachable.store(true, std::sync::atomic::Ordering::SeqCst);

        let result = h.engine.reconcile_payment(&payment.transaction_ref).await.unwrap();

        assert_eq!(result.status, ReconciliationStatus::Pending);
        assert_eq!(reload_payment(&h, &payment.transaction_ref).await.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_failed_payment_can_still_complete() {
        let h = harness().await;
        let (sale, _) = seed_sale(&h.db, h.clock.now(), SalePlan::installment(1)).await;
        let payment = online_payment(&h, &sale, 6_000).await;

        h.gateway.set_status(&payment.transaction_ref, OrderStatus::Failed);
        let failed = h.engine.reconcile_payment(&payment.transaction_ref).await.unwrap();
        assert_eq!(failed.status, ReconciliationStatus::Failed);
        assert_eq!(reload_payment(&h, &payment.transaction_ref).await.status, PaymentStatus::Failed);

        h.gateway.set_status(&payment.transaction_ref, OrderStatus::Successful);
        let completed = h.engine.reconcile_payment(&payment.transaction_ref).await.unwrap();
        assert_eq!(completed.status, ReconciliationStatus::Completed);
        assert_eq!(completed.sale.total_paid, Money::from_major(6_000));
    }

    #[tokio::test]
    async fn test_success_on_cancelled_sale_is_refunded() {
        let h = harness().await;
        let (sale, _) = seed_sale(&h.db, h.clock.now(), SalePlan::installment(1)).await;
        let payment = online_payment(&h, &sale, 6_000).await;
        h.db.sales().cancel_stale(&sale.id, h.clock.now()).await.unwrap().unwrap();

        h.gateway.set_status(&payment.transaction_ref, OrderStatus::Successful);
        let result = h.engine.reconcile_payment(&payment.transaction_ref).await.unwrap();

        assert_eq!(result.status, ReconciliationStatus::Refunded);
        assert_eq!(result.sale.status, SaleStatus::Cancelled);
        assert_eq!(result.sale.total_paid, Money::zero());
        assert_eq!(reload_payment(&h, &payment.transaction_ref).await.status, PaymentStatus::Refunded);
        assert_eq!(h.protocol.call_count(), 0);

        let again = h.engine.reconcile_payment(&payment.transaction_ref).await.unwrap();
        assert_eq!(again.status, ReconciliationStatus::Refunded);
    }

    #[tokio::test]
    async fn test_unknown_payment_is_not_found() {
        let h = harness().await;
        let err = h.engine.reconcile_payment("SP-missing").await.unwrap_err();
        assert!(matches!(err, EngineError::Core(CoreError::PaymentNotFound(_))));
    }

    // -------------------------------------------------------------------------
    // Coverage and token durations
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_full_payment_completes_sale_with_forever_tokens() {
        let h = harness().await;
        let (sale, _) = seed_sale(&h.db, h.clock.now(), SalePlan::installment(1)).await;
        let payment = online_payment(&h, &sale, 144_000).await;
        h.gateway.set_status(&payment.transaction_ref, OrderStatus::Successful);

        let result = h.engine.reconcile_payment(&payment.transaction_ref).await.unwrap();

        assert_eq!(result.sale.status, SaleStatus::Completed);
        assert_eq!(result.sale.remaining_installments, 0);
        assert_eq!(result.issued_tokens[0].duration_days, -1);
        assert_eq!(reload_payment(&h, &payment.transaction_ref).await.months_covered, Some(-1));
    }

    #[tokio::test]
    async fn test_partial_month_issues_no_token() {
        let h = harness().await;
        let (sale, _) = seed_sale(&h.db, h.clock.now(), SalePlan::installment(1)).await;
        let payment = online_payment(&h, &sale, 3_000).await;
        h.gateway.set_status(&payment.transaction_ref, OrderStatus::Successful);

        let result = h.engine.reconcile_payment(&payment.transaction_ref).await.unwrap();

        assert_eq!(result.status, ReconciliationStatus::Completed);
        assert_eq!(result.sale.status, SaleStatus::InInstallment);
        assert_eq!(result.sale.remaining_installments, 24);
        assert!(result.issued_tokens.is_empty());
        assert_eq!(h.notifier.token_messages(), 0);

        // Nothing owed, so the payment counts as settled
        let stored = reload_payment(&h, &payment.transaction_ref).await;
        assert_eq!(stored.months_covered, Some(0));
        assert!(stored.tokens_settled_at.is_some());
    }

    #[tokio::test]
    async fn test_straddling_payment_buys_completed_month_only() {
        let h = harness().await;
        let (sale, _) = seed_sale(&h.db, h.clock.now(), SalePlan::installment(1)).await;

        let first = online_payment(&h, &sale, 3_000).await;
        h.gateway.set_status(&first.transaction_ref, OrderStatus::Successful);
        h.engine.reconcile_payment(&first.transaction_ref).await.unwrap();

        let second = online_payment(&h, &sale, 4_000).await;
        h.gateway.set_status(&second.transaction_ref, OrderStatus::Successful);
        let result = h.engine.reconcile_payment(&second.transaction_ref).await.unwrap();

        assert_eq!(result.sale.total_paid, Money::from_major(7_000));
        assert_eq!(result.sale.remaining_installments, 23);
        assert_eq!(result.issued_tokens.len(), 1);
        assert_eq!(result.issued_tokens[0].duration_days, 30);
    }

    #[tokio::test]
    async fn test_one_off_sale_gets_forever_token_and_no_account_details() {
        let h = harness().await;
        let (sale, _) = seed_sale(&h.db, h.clock.now(), SalePlan::one_off(1)).await;
        let payment = online_payment(&h, &sale, 50_000).await;
        h.gateway.set_status(&payment.transaction_ref, OrderStatus::Successful);

        let result = h.engine.reconcile_payment(&payment.transaction_ref).await.unwrap();

        assert_eq!(result.sale.status, SaleStatus::Completed);
        assert_eq!(result.issued_tokens.len(), 1);
        assert_eq!(result.issued_tokens[0].duration_days, -1);
        assert_eq!(h.notifier.details_count(), 0);
    }

    // -------------------------------------------------------------------------
    // Cash and wallet
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_cash_payment_is_confirmed_without_gateway() {
        let h = harness().await;
        let plan = SalePlan::installment(1).paid_by(PaymentMethod::Cash, Some("agent-3"));
        let (sale, _) = seed_sale(&h.db, h.clock.now(), plan).await;

        let payment = h
            .engine
            .initiate_payment(request(&sale, 6_000, PaymentMethod::Cash))
            .await
            .unwrap();
        assert!(payment.gateway_order_ref.is_none());
        assert!(h.gateway.orders.lock().unwrap().is_empty());

        let result = h.engine.reconcile_payment(&payment.transaction_ref).await.unwrap();

        assert_eq!(result.status, ReconciliationStatus::Completed);
        assert_eq!(result.issued_tokens.len(), 1);
        assert_eq!(h.gateway.checks(), 0);
        // Account details go to ONLINE sales only
        assert_eq!(h.notifier.details_count(), 0);
    }

    #[tokio::test]
    async fn test_wallet_payment_debits_exactly_once() {
        let h = harness().await;
        let ledger = h.engine.ledger();
        ledger.create_wallet("agent-7").await.unwrap();
        ledger
            .credit("agent-7", Money::from_major(10_000), "TOPUP-SEED", "Opening float")
            .await
            .unwrap();

        let plan = SalePlan::installment(1).paid_by(PaymentMethod::Wallet, Some("agent-7"));
        let (sale, _) = seed_sale(&h.db, h.clock.now(), plan).await;
        let payment = seed_payment(&h.db, &sale, 6_000, PaymentMethod::Wallet, h.clock.now()).await;

        let first = h.engine.reconcile_payment(&payment.transaction_ref).await.unwrap();
        let second = h.engine.reconcile_payment(&payment.transaction_ref).await.unwrap();

        assert_eq!(first.status, ReconciliationStatus::Completed);
        assert_eq!(second.status, ReconciliationStatus::AlreadyCompleted);
        assert_eq!(ledger.balance("agent-7").await.unwrap(), Money::from_major(4_000));

        let debit = h
            .db
            .wallets()
            .find_by_reference(&format!("PAY-{}", payment.transaction_ref))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(debit.kind, LedgerEntryKind::Debit);
        assert_eq!(debit.payment_id.as_deref(), Some(payment.id.as_str()));
    }

    #[tokio::test]
    async fn test_wallet_payment_with_insufficient_balance_changes_nothing() {
        let h = harness().await;
        let ledger = h.engine.ledger();
        ledger.create_wallet("agent-7").await.unwrap();
        ledger
            .credit("agent-7", Money::from_major(1_000), "TOPUP-SEED", "Opening float")
            .await
            .unwrap();

        let plan = SalePlan::installment(1).paid_by(PaymentMethod::Wallet, Some("agent-7"));
        let (sale, _) = seed_sale(&h.db, h.clock.now(), plan).await;
        let payment = seed_payment(&h.db, &sale, 6_000, PaymentMethod::Wallet, h.clock.now()).await;

        let err = h.engine.reconcile_payment(&payment.transaction_ref).await.unwrap_err();
        assert!(matches!(err, EngineError::Core(CoreError::InsufficientBalance { .. })));

        assert_eq!(ledger.balance("agent-7").await.unwrap(), Money::from_major(1_000));
        assert_eq!(reload_payment(&h, &payment.transaction_ref).await.status, PaymentStatus::Pending);
        assert_eq!(reload_sale(&h, &sale.id).await.total_paid, Money::zero());
    }

    #[tokio::test]
    async fn test_wallet_payment_without_wallet_is_rejected() {
        let h = harness().await;
        let plan = SalePlan::installment(0).paid_by(PaymentMethod::Wallet, Some("agent-9"));
        let (sale, _) = seed_sale(&h.db, h.clock.now(), plan).await;
        let payment = seed_payment(&h.db, &sale, 6_000, PaymentMethod::Wallet, h.clock.now()).await;

        let err = h.engine.reconcile_payment(&payment.transaction_ref).await.unwrap_err();
        assert!(matches!(err, EngineError::Core(CoreError::WalletNotFound(_))));
    }

    // -------------------------------------------------------------------------
    // Webhooks
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_webhook_records_body_and_reconciles() {
        let h = harness().await;
        let (sale, _) = seed_sale(&h.db, h.clock.now(), SalePlan::installment(1)).await;
        let payment = online_payment(&h, &sale, 6_000).await;
        h.gateway.set_status(&payment.transaction_ref, OrderStatus::Successful);

        let body = json!({ "data": { "tx_ref": payment.transaction_ref, "status": "successful" } });
        let result = h.engine.handle_webhook(body).await.unwrap();
        assert_eq!(result.status, ReconciliationStatus::Completed);

        let sources: Vec<String> = h
            .db
            .payments()
            .responses_for(&payment.id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.source)
            .collect();
        assert_eq!(sources, vec!["webhook".to_string(), "gateway_status".to_string()]);
    }

    #[tokio::test]
    async fn test_webhook_status_is_not_trusted() {
        let h = harness().await;
        let (sale, _) = seed_sale(&h.db, h.clock.now(), SalePlan::installment(1)).await;
        let payment = online_payment(&h, &sale, 6_000).await;

        let body = json!({ "data": { "tx_ref": payment.transaction_ref, "status": "successful" } });
        let result = h.engine.handle_webhook(body).await.unwrap();

        assert_eq!(result.status, ReconciliationStatus::Pending);
        assert_eq!(result.sale.total_paid, Money::zero());
    }

    #[tokio::test]
    async fn test_webhook_for_unknown_or_cash_payment_is_rejected() {
        let h = harness().await;
        let err = h
            .engine
            .handle_webhook(json!({ "data": { "tx_ref": "SP-nope" } }))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Core(CoreError::PaymentNotFound(_))));

        let plan = SalePlan::installment(0).paid_by(PaymentMethod::Cash, Some("agent-3"));
        let (sale, _) = seed_sale(&h.db, h.clock.now(), plan).await;
        let cash = seed_payment(&h.db, &sale, 6_000, PaymentMethod::Cash, h.clock.now()).await;

        let err = h
            .engine
            .handle_webhook(json!({ "data": { "tx_ref": cash.transaction_ref } }))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Core(CoreError::UnsupportedMethod { .. })));
        assert_eq!(reload_payment(&h, &cash.transaction_ref).await.status, PaymentStatus::Pending);
    }

    // -------------------------------------------------------------------------
    // Post-commit effects
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_account_details_sent_once_per_sale() {
        let h = harness().await;
        let (sale, _) = seed_sale(&h.db, h.clock.now(), SalePlan::installment(0)).await;

        for _ in 0..2 {
            let payment = online_payment(&h, &sale, 6_000).await;
            h.gateway.set_status(&payment.transaction_ref, OrderStatus::Successful);
            h.engine.reconcile_payment(&payment.transaction_ref).await.unwrap();
        }

        assert_eq!(h.notifier.details_count(), 1);
        assert!(reload_sale(&h, &sale.id).await.delivered_account_details);
    }

    #[tokio::test]
    async fn test_failed_account_details_delivery_is_retried_next_payment() {
        let h = harness().await;
        let (sale, _) = seed_sale(&h.db, h.clock.now(), SalePlan::installment(0)).await;
        h.notifier.fail_details.store(true, std::sync::atomic::Ordering::SeqCst);

        let first = online_payment(&h, &sale, 6_000).await;
        h.gateway.set_status(&first.transaction_ref, OrderStatus::Successful);
        let result = h.engine.reconcile_payment(&first.transaction_ref).await.unwrap();

        // The payment stands even though the message did not go out
        assert_eq!(result.status, ReconciliationStatus::Completed);
        assert!(!reload_sale(&h, &sale.id).await.delivered_account_details);

        h.notifier.fail_details.store(false, std::sync::atomic::Ordering::SeqCst);
        let second = online_payment(&h, &sale, 6_000).await;
        h.gateway.set_status(&second.transaction_ref, OrderStatus::Successful);
        h.engine.reconcile_payment(&second.transaction_ref).await.unwrap();

        assert_eq!(h.notifier.details_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_device_is_served_by_token_retry() {
        let h = harness().await;
        let (sale, devices) = seed_sale(&h.db, h.clock.now(), SalePlan::installment(2)).await;
        h.protocol.fail_device(&devices[0].id);

        let payment = online_payment(&h, &sale, 6_000).await;
        h.gateway.set_status(&payment.transaction_ref, OrderStatus::Successful);
        let result = h.engine.reconcile_payment(&payment.transaction_ref).await.unwrap();

        assert_eq!(result.status, ReconciliationStatus::Completed);
        assert_eq!(result.issued_tokens.len(), 1);
        assert_eq!(result.failed_devices, vec![devices[0].id.clone()]);
        assert!(reload_payment(&h, &payment.transaction_ref).await.tokens_settled_at.is_none());

        h.protocol.heal_device(&devices[0].id);
        let batch = h.engine.retry_token_issuance(&payment.transaction_ref).await.unwrap();

        assert_eq!(batch.issued.len(), 1);
        assert_eq!(batch.issued[0].device_id, devices[0].id);
        assert!(reload_payment(&h, &payment.transaction_ref).await.tokens_settled_at.is_some());
        assert_eq!(h.db.devices().tokens_for_payment(&payment.id).await.unwrap().len(), 2);
    }
}
