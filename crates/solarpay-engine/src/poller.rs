//! # Pending Payment Poller
//!
//! Webhooks get lost. The poller asks the gateway about every recent
//! payment and top-up still PENDING, and retries token issuance for
//! completed payments whose devices are not all served.
//!
//! ```text
//! tick ──► pending payments (created within lookback) ──► reconcile_payment
//!      ──► pending top-ups  (created within lookback) ──► reconcile_top_up
//!      ──► completed, tokens unsettled               ──► retry_token_issuance
//! ```
//!
//! Gateway calls are spaced out so one pass never bursts the gateway.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::{window_start, PollerSettings, MAX_WINDOW_SECS};
use crate::error::{EngineError, EngineResult};
use crate::ledger::TopUpReconciliation;
use crate::reconcile::{ReconciliationEngine, ReconciliationStatus};
use solarpay_db::Database;

/// Counters for one poll pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub payments_checked: usize,
    pub payments_completed: usize,
    pub payments_failed: usize,
    pub top_ups_checked: usize,
    pub top_ups_credited: usize,
    pub token_retries: usize,
    pub errors: usize,
}

/// Periodic re-check of unsettled money.
pub struct PendingPaymentPoller {
    engine: Arc<ReconciliationEngine>,
    db: Database,
    clock: Arc<dyn Clock>,
    settings: PollerSettings,
}

/// Handle for stopping a running poller.
#[derive(Clone)]
pub struct PollerHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl PollerHandle {
    /// Stops the poll loop after the current pass.
    pub async fn shutdown(&self) -> EngineResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| EngineError::ChannelError("Poller channel closed".into()))
    }
}

impl PendingPaymentPoller {
    pub fn new(
        engine: Arc<ReconciliationEngine>,
        db: Database,
        clock: Arc<dyn Clock>,
        settings: PollerSettings,
    ) -> Self {
        PendingPaymentPoller {
            engine,
            db,
            clock,
            settings,
        }
    }

    /// One full pass. Individual failures are counted, not returned.
    pub async fn poll_once(&self) -> EngineResult<PollReport> {
        let since = window_start(self.clock.now(), "poller.lookback_secs", self.settings.lookback_secs)?;
        let mut report = PollReport::default();
        let mut first_call = true;

        // Payments
        let payments = self.db.payments().list_pending(since, self.settings.batch_size).await?;
        for payment in payments {
            self.space_out(&mut first_call).await;
            report.payments_checked += 1;

            match self.engine.reconcile_payment(&payment.transaction_ref).await {
                Ok(result) => match result.status {
                    ReconciliationStatus::Completed => report.payments_completed += 1,
                    ReconciliationStatus::Failed => report.payments_failed += 1,
                    _ => {}
                },
                Err(e) => {
                    report.errors += 1;
                    warn!(transaction_ref = %payment.transaction_ref, error = %e, "Poll reconcile failed");
                }
            }
        }

        // Top-ups
        let top_ups = self
            .db
            .wallets()
            .list_pending_top_ups(since, self.settings.batch_size)
            .await?;
        for top_up in top_ups {
            self.space_out(&mut first_call).await;
            report.top_ups_checked += 1;

            match self.engine.ledger().reconcile_top_up(&top_up.reference).await {
                Ok(TopUpReconciliation::Credited(_)) => report.top_ups_credited += 1,
                Ok(_) => {}
                Err(e) => {
                    report.errors += 1;
                    warn!(reference = %top_up.reference, error = %e, "Poll top-up reconcile failed");
                }
            }
        }

        // Token retries
        let unsettled = self.db.payments().list_unsettled(self.settings.batch_size).await?;
        for payment in unsettled {
            report.token_retries += 1;
            if let Err(e) = self.engine.retry_token_issuance(&payment.transaction_ref).await {
                report.errors += 1;
                warn!(transaction_ref = %payment.transaction_ref, error = %e, "Token retry failed");
            }
        }

        if report == PollReport::default() {
            debug!("Nothing pending");
        } else {
            info!(
                payments_checked = report.payments_checked,
                payments_completed = report.payments_completed,
                top_ups_credited = report.top_ups_credited,
                token_retries = report.token_retries,
                errors = report.errors,
                "Poll pass finished"
            );
        }
        Ok(report)
    }

    async fn space_out(&self, first_call: &mut bool) {
        if *first_call {
            *first_call = false;
        } else if self.settings.spacing_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.settings.spacing_ms)).await;
        }
    }

    /// Spawns the poll loop and returns its handle.
    pub fn start(self) -> PollerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        tokio::spawn(async move {
            self.run(shutdown_rx).await;
        });

        PollerHandle { shutdown_tx }
    }

    async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(interval_secs = self.settings.interval_secs, "Pending payment poller started");

        let period = Duration::from_secs(self.settings.interval_secs.clamp(1, MAX_WINDOW_SECS));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!(error = %e, "Poll pass failed");
                    }
                }

                _ = shutdown_rx.recv() => {
                    info!("Pending payment poller shutting down");
                    break;
                }
            }
        }

        info!("Pending payment poller stopped");
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::OrderStatus;
    use crate::reconcile::PaymentRequest;
    use crate::test_support::{harness, seed_sale, Harness, SalePlan};
    use solarpay_core::{new_id, Money, Payment, PaymentMethod, PaymentStatus};

    fn poller(h: &Harness) -> PendingPaymentPoller {
        PendingPaymentPoller::new(
            Arc::clone(&h.engine),
            h.db.clone(),
            h.clock.clone(),
            h.config.poller.clone(),
        )
    }

    async fn online_payment(h: &Harness, amount: i64, devices: usize) -> Payment {
        let (sale, _) = seed_sale(&h.db, h.clock.now(), SalePlan::installment(devices)).await;
        h.engine
            .initiate_payment(PaymentRequest {
                sale_id: sale.id,
                amount: Money::from_major(amount),
                transaction_ref: format!("SP-{}", new_id()),
                method: PaymentMethod::Online,
                agent_id: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_poll_settles_payments_and_top_ups() {
        let h = harness().await;
        let paid = online_payment(&h, 6_000, 1).await;
        let waiting = online_payment(&h, 6_000, 1).await;
        h.gateway.set_status(&paid.transaction_ref, OrderStatus::Successful);

        let ledger = h.engine.ledger();
        ledger.create_wallet("agent-7").await.unwrap();
        ledger
            .initiate_top_up("agent-7", Money::from_major(5_000), "TOPUP-1", None)
            .await
            .unwrap();
        h.gateway.set_status("TOPUP-1", OrderStatus::Successful);

        let report = poller(&h).poll_once().await.unwrap();

        assert_eq!(report.payments_checked, 2);
        assert_eq!(report.payments_completed, 1);
        assert_eq!(report.top_ups_credited, 1);
        assert_eq!(report.errors, 0);

        let waiting = h.db.payments().get(&waiting.id).await.unwrap().unwrap();
        assert_eq!(waiting.status, PaymentStatus::Pending);
        assert_eq!(ledger.balance("agent-7").await.unwrap(), Money::from_major(5_000));
    }

    #[tokio::test]
    async fn test_poll_skips_payments_older_than_lookback() {
        let h = harness().await;
        let payment = online_payment(&h, 6_000, 0).await;
        h.gateway.set_status(&payment.transaction_ref, OrderStatus::Successful);
        h.clock.advance(chrono::Duration::days(2));

        let report = poller(&h).poll_once().await.unwrap();

        assert_eq!(report.payments_checked, 0);
        assert_eq!(h.gateway.checks(), 0);
    }

    #[tokio::test]
    async fn test_poll_retries_unsettled_tokens() {
        let h = harness().await;
        let (sale, devices) = seed_sale(&h.db, h.clock.now(), SalePlan::installment(1)).await;
        h.protocol.fail_device(&devices[0].id);
        let payment = h
            .engine
            .initiate_payment(PaymentRequest {
                sale_id: sale.id.clone(),
                amount: Money::from_major(6_000),
                transaction_ref: format!("SP-{}", new_id()),
                method: PaymentMethod::Online,
                agent_id: None,
            })
            .await
            .unwrap();
        h.gateway.set_status(&payment.transaction_ref, OrderStatus::Successful);
        h.engine.reconcile_payment(&payment.transaction_ref).await.unwrap();

        h.protocol.heal_device(&devices[0].id);
        let report = poller(&h).poll_once().await.unwrap();

        assert_eq!(report.token_retries, 1);
        let payment = h.db.payments().get(&payment.id).await.unwrap().unwrap();
        assert!(payment.tokens_settled_at.is_some());
        assert_eq!(h.db.devices().tokens_for_payment(&payment.id).await.unwrap().len(), 1);

        let again = poller(&h).poll_once().await.unwrap();
        assert_eq!(again.token_retries, 0);
    }

    #[tokio::test]
    async fn test_oversized_lookback_is_a_config_error() {
        let h = harness().await;
        let payment = online_payment(&h, 6_000, 0).await;
        h.gateway.set_status(&payment.transaction_ref, OrderStatus::Successful);

        let mut settings = h.config.poller.clone();
        settings.lookback_secs = 20_000_000_000_000;
        let poller = PendingPaymentPoller::new(Arc::clone(&h.engine), h.db.clone(), h.clock.clone(), settings);

        let err = poller.poll_once().await.unwrap_err();
        assert!(err.is_config_error());
        assert_eq!(h.gateway.checks(), 0);
    }
}
