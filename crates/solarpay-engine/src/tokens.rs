//! # Token Issuance Coordinator
//!
//! Mints unlock tokens for the devices on a sale once a payment has been
//! committed.
//!
//! ## Issuance Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  issue_for_payment(payment)                                             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  tokenable devices of the sale ── line mode + months_covered ──► days  │
//! │       │                              (None → skip device this cycle)    │
//! │       ▼                                                                 │
//! │  JoinSet, at most N devices in flight (Semaphore)                       │
//! │       │                                                                 │
//! │       ▼  per device, under KeyedLocks[device_id]:                       │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │ 1. re-read device (fresh count)                                  │  │
//! │  │ 2. already has a token for this payment? ──► skip                │  │
//! │  │ 3. protocol.generate_token(device, days, count)   (with retry)   │  │
//! │  │ 4. UPDATE count WHERE count = old  +  INSERT token  (one tx)     │  │
//! │  │      counter moved underneath? ──► back to 1                     │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  TokenBatch { issued, failed_devices }                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A device that fails does not stop the others, and never rolls back the
//! payment. The payment is marked settled once every eligible device holds
//! its token, so re-running the batch later only touches what is missing.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::locks::KeyedLocks;
use crate::protocol::TokenProtocol;
use crate::retry::RetryPolicy;
use solarpay_core::token_policy::token_duration;
use solarpay_core::{CoreError, DeviceToken, MonthsCovered, Payment, PaymentStatus, ValidationError};
use solarpay_db::{Database, DbError};

/// Times a device is re-read after losing the counter compare-and-set.
const COUNTER_ATTEMPTS: u32 = 3;

/// Outcome of one issuance run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenBatch {
    /// Tokens minted by this run, in device order.
    pub issued: Vec<DeviceToken>,
    /// Devices that should have received a token but did not.
    pub failed_devices: Vec<String>,
}

impl TokenBatch {
    pub fn is_complete(&self) -> bool {
        self.failed_devices.is_empty()
    }
}

// =============================================================================
// Single-device Issuer
// =============================================================================

/// Everything one device task needs. Cheap to clone into spawned tasks.
#[derive(Clone)]
struct DeviceIssuer {
    db: Database,
    protocol: Arc<dyn TokenProtocol>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    locks: Arc<KeyedLocks>,
}

impl DeviceIssuer {
    /// Issues one token for `device_id`.
    ///
    /// Returns `None` when the device already holds a token for `payment_id`.
    async fn issue(
        &self,
        device_id: &str,
        duration_days: i64,
        payment_id: Option<&str>,
    ) -> EngineResult<Option<DeviceToken>> {
        let _guard = self.locks.lock(device_id).await;

        for attempt in 1..=COUNTER_ATTEMPTS {
            let device = self
                .db
                .devices()
                .get(device_id)
                .await?
                .ok_or_else(|| CoreError::DeviceNotFound(device_id.to_string()))?;

            if let Some(payment_id) = payment_id {
                let already = self
                    .db
                    .devices()
                    .tokens_for_payment(payment_id)
                    .await?
                    .iter()
                    .any(|token| token.device_id == device_id);
                if already {
                    debug!(device_id = %device_id, payment_id = %payment_id, "Device already tokened for payment");
                    return Ok(None);
                }
            }

            let counter = device.count;
            let code = self
                .retry
                .run("generate_token", || self.protocol.generate_token(&device, duration_days, counter))
                .await?;

            let recorded = self
                .db
                .devices()
                .record_issued_token(
                    device_id,
                    counter,
                    code.new_count,
                    &code.token,
                    duration_days,
                    payment_id,
                    self.clock.now(),
                )
                .await?;

            match recorded {
                Some(_) => {
                    return Ok(Some(DeviceToken {
                        device_id: device.id,
                        serial_number: device.serial_number,
                        device_key: device.key,
                        token: code.token,
                        duration_days,
                    }));
                }
                None => {
                    warn!(device_id = %device_id, attempt, "Device counter moved during issuance, retrying");
                }
            }
        }

        Err(DbError::Conflict(format!("device {} counter kept moving", device_id)).into())
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Issues device tokens for committed payments and for operators.
pub struct TokenIssuanceCoordinator {
    issuer: DeviceIssuer,
    workers: Arc<Semaphore>,
}

impl TokenIssuanceCoordinator {
    pub fn new(
        db: Database,
        protocol: Arc<dyn TokenProtocol>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        max_parallel_devices: usize,
    ) -> Self {
        TokenIssuanceCoordinator {
            issuer: DeviceIssuer {
                db,
                protocol,
                clock,
                retry,
                locks: Arc::new(KeyedLocks::new()),
            },
            workers: Arc::new(Semaphore::new(max_parallel_devices.max(1))),
        }
    }

    /// Issues the tokens a completed payment paid for.
    ///
    /// Durations come from the `months_covered` committed with the payment.
    /// Devices that already hold a token for this payment are skipped, so
    /// the call doubles as the retry path.
    pub async fn issue_for_payment(&self, payment: &Payment) -> EngineResult<TokenBatch> {
        if payment.status != PaymentStatus::Completed {
            debug!(transaction_ref = %payment.transaction_ref, status = %payment.status, "Payment not completed, no tokens");
            return Ok(TokenBatch::default());
        }

        let months = MonthsCovered::from_i64(payment.months_covered.unwrap_or(0));
        let devices = self.issuer.db.devices().tokenable_for_sale(&payment.sale_id).await?;

        let mut seen = HashSet::new();
        let mut jobs = Vec::new();
        for linked in devices {
            if !seen.insert(linked.device.id.clone()) {
                continue;
            }
            match token_duration(linked.payment_mode, months) {
                Some(duration) => jobs.push((linked.device.id, duration.to_days())),
                None => debug!(
                    device_id = %linked.device.id,
                    transaction_ref = %payment.transaction_ref,
                    "Payment covers no whole month, device skipped"
                ),
            }
        }

        let batch = self.run_batch(jobs, &payment.id).await;

        if batch.is_complete() {
            self.issuer
                .db
                .payments()
                .mark_tokens_settled(&payment.id, self.issuer.clock.now())
                .await?;
        }

        info!(
            transaction_ref = %payment.transaction_ref,
            issued = batch.issued.len(),
            failed = batch.failed_devices.len(),
            "Token batch finished"
        );
        Ok(batch)
    }

    /// Re-runs issuance for a payment by transaction reference.
    pub async fn retry_for_payment(&self, transaction_ref: &str) -> EngineResult<TokenBatch> {
        let payment = self
            .issuer
            .db
            .payments()
            .get_by_transaction_ref(transaction_ref)
            .await?
            .ok_or_else(|| CoreError::PaymentNotFound(transaction_ref.to_string()))?;

        self.issue_for_payment(&payment).await
    }

    /// Operator-issued token for one device, not tied to a payment.
    ///
    /// ## Errors
    /// - `DeviceNotFound`
    /// - `DeviceNotTokenable` if issuance is disabled for the device
    /// - validation error unless `duration_days` is positive or -1
    pub async fn issue_manual(&self, device_id: &str, duration_days: i64) -> EngineResult<DeviceToken> {
        if duration_days == 0 || duration_days < -1 {
            return Err(ValidationError::InvalidFormat {
                field: "duration_days".into(),
                reason: "must be a positive number of days or -1 for forever".into(),
            }
            .into());
        }

        let device = self
            .issuer
            .db
            .devices()
            .get(device_id)
            .await?
            .ok_or_else(|| CoreError::DeviceNotFound(device_id.to_string()))?;

        if !device.is_tokenable {
            return Err(CoreError::DeviceNotTokenable(device_id.to_string()).into());
        }

        let token = self
            .issuer
            .issue(device_id, duration_days, None)
            .await?
            .ok_or_else(|| EngineError::Internal(format!("manual issuance skipped device {}", device_id)))?;

        info!(device_id = %device_id, duration_days, "Manual token issued");
        Ok(token)
    }

    async fn run_batch(&self, jobs: Vec<(String, i64)>, payment_id: &str) -> TokenBatch {
        let mut set = JoinSet::new();
        let device_ids: Vec<String> = jobs.iter().map(|(id, _)| id.clone()).collect();

        for (index, (device_id, duration_days)) in jobs.into_iter().enumerate() {
            let issuer = self.issuer.clone();
            let workers = Arc::clone(&self.workers);
            let payment_id = payment_id.to_string();

            set.spawn(async move {
                let result = match workers.acquire_owned().await {
                    Ok(_permit) => issuer.issue(&device_id, duration_days, Some(&payment_id)).await,
                    Err(_) => Err(EngineError::ShuttingDown),
                };
                (index, device_id, result)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "Token issuance task panicked"),
            }
        }
        outcomes.sort_by_key(|(index, _, _)| *index);

        let mut batch = TokenBatch::default();
        let mut reported = HashSet::new();
        for (index, device_id, result) in outcomes {
            reported.insert(index);
            match result {
                Ok(Some(token)) => batch.issued.push(token),
                Ok(None) => {}
                Err(e) => {
                    error!(device_id = %device_id, payment_id = %payment_id, error = %e, "Token issuance failed");
                    batch.failed_devices.push(device_id);
                }
            }
        }

        // A panicked task never reported back; its device still needs a token
        for (index, device_id) in device_ids.into_iter().enumerate() {
            if !reported.contains(&index) {
                batch.failed_devices.push(device_id);
            }
        }
        batch
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
