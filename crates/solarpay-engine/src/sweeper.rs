//! # Stale Sale Sweeper
//!
//! Cancels UNPAID sales nobody paid for within the timeout and puts their
//! reserved stock back.
//!
//! ## Schedule
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  every interval tick                                                    │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  job_runs["stale_sale_sweep"] younger than interval? ──► skip          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  find_stale_unpaid(now - timeout)                                       │
//! │       │                                                                 │
//! │       ▼  per sale, one transaction each:                                │
//! │  cancel_stale ── completed payment appeared? ──► untouched              │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  record_run(now, summary)                                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The last run is persisted, so a restarted daemon does not sweep again
//! before the interval has passed.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::config::{window, window_start, SweeperSettings};
use crate::error::{EngineError, EngineResult};
use solarpay_db::Database;

/// Job name in the `job_runs` table.
pub const SWEEP_JOB: &str = "stale_sale_sweep";

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub cancelled_sales: Vec<String>,
    pub restored_units: i64,
    pub failed_payments: u64,
}

impl SweepReport {
    pub fn cancelled_count(&self) -> usize {
        self.cancelled_sales.len()
    }
}

/// Cancels abandoned UNPAID sales.
pub struct StaleSaleSweeper {
    db: Database,
    clock: Arc<dyn Clock>,
    settings: SweeperSettings,
}

/// Handle for stopping a running sweeper.
#[derive(Clone)]
pub struct SweeperHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl SweeperHandle {
    /// Stops the sweep loop after the current pass.
    pub async fn shutdown(&self) -> EngineResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| EngineError::ChannelError("Sweeper channel closed".into()))
    }
}

impl StaleSaleSweeper {
    pub fn new(db: Database, clock: Arc<dyn Clock>, settings: SweeperSettings) -> Self {
        StaleSaleSweeper { db, clock, settings }
    }

    /// Cancels every sale that stayed UNPAID past the timeout.
    ///
    /// A sale that gains a completed payment between the scan and its
    /// cancellation is left alone.
    pub async fn sweep_stale_sales(&self) -> EngineResult<SweepReport> {
        let cutoff = window_start(
            self.clock.now(),
            "sweeper.unpaid_timeout_secs",
            self.settings.unpaid_timeout_secs,
        )?;

        let candidates = self
            .db
            .sales()
            .find_stale_unpaid(cutoff, self.settings.batch_limit)
            .await?;

        let mut report = SweepReport::default();
        for sale_id in candidates {
            match self.db.sales().cancel_stale(&sale_id, self.clock.now()).await {
                Ok(Some(cancelled)) => {
                    report.restored_units += cancelled.restored_units;
                    report.failed_payments += cancelled.failed_payments;
                    report.cancelled_sales.push(sale_id);
                }
                Ok(None) => debug!(sale_id = %sale_id, "Sale paid or closed since scan"),
                // Per-sale failure; the sale is picked up again next sweep
                Err(e) => error!(sale_id = %sale_id, error = %e, "Failed to cancel stale sale"),
            }
        }

        info!(
            cancelled = report.cancelled_count(),
            restored_units = report.restored_units,
            failed_payments = report.failed_payments,
            "Stale sale sweep finished"
        );
        Ok(report)
    }

    /// Sweeps unless the last recorded sweep is younger than the interval.
    pub async fn run_if_due(&self) -> EngineResult<Option<SweepReport>> {
        let now = self.clock.now();
        let interval = window("sweeper.interval_secs", self.settings.interval_secs)?;

        if let Some(last) = self.db.job_runs().last_run(SWEEP_JOB).await? {
            if now - last < interval {
                debug!(last_run = %last, "Sweep not due yet");
                return Ok(None);
            }
        }

        let report = self.sweep_stale_sales().await?;
        let summary = format!(
            "cancelled={} restored_units={} failed_payments={}",
            report.cancelled_count(),
            report.restored_units,
            report.failed_payments
        );
        self.db.job_runs().record_run(SWEEP_JOB, self.clock.now(), &summary).await?;
        Ok(Some(report))
    }

    /// Spawns the sweep loop and returns its handle.
    pub fn start(self) -> SweeperHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        tokio::spawn(async move {
            self.run(shutdown_rx).await;
        });

        SweeperHandle { shutdown_tx }
    }

    async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(interval_secs = self.settings.interval_secs, "Stale sale sweeper started");

        // Wake more often than the interval; run_if_due decides
        let tick = Duration::from_secs(self.settings.interval_secs.clamp(1, 60));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_if_due().await {
                        error!(error = %e, "Stale sale sweep failed");
                    }
                }

                _ = shutdown_rx.recv() => {
                    info!("Stale sale sweeper shutting down");
                    break;
                }
            }
        }

        info!("Stale sale sweeper stopped");
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::OrderStatus;
    use crate::test_support::{harness, seed_payment, seed_sale, Harness, SalePlan};
    use solarpay_core::{PaymentMethod, PaymentStatus, SaleStatus};

    fn sweeper(h: &Harness) -> StaleSaleSweeper {
        StaleSaleSweeper::new(h.db.clone(), h.clock.clone(), h.config.sweeper.clone())
    }

    async fn sale_status(h: &Harness, sale_id: &str) -> SaleStatus {
        h.db.sales().get(sale_id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_sweep_cancels_only_sales_past_timeout() {
        let h = harness().await;
        let (old, _) = seed_sale(&h.db, h.clock.now(), SalePlan::installment(0)).await;
        h.clock.advance(chrono::Duration::hours(5));
        let (fresh, _) = seed_sale(&h.db, h.clock.now(), SalePlan::installment(0)).await;
        h.clock.advance(chrono::Duration::hours(1));

        let report = sweeper(&h).sweep_stale_sales().await.unwrap();

        assert_eq!(report.cancelled_sales, vec![old.id.clone()]);
        assert_eq!(sale_status(&h, &old.id).await, SaleStatus::Cancelled);
        assert_eq!(sale_status(&h, &fresh.id).await, SaleStatus::Unpaid);
    }

    #[tokio::test]
    async fn test_sweep_restores_stock_and_fails_pending_payments() {
        let h = harness().await;
        let (sale, _) = seed_sale(&h.db, h.clock.now(), SalePlan::installment(0)).await;
        let batch = h.db.inventory().insert_batch("prod-shs-80", 10, h.clock.now()).await.unwrap();
        h.db.inventory().allocate(&sale.id, &batch.id, 3).await.unwrap();
        let payment = seed_payment(&h.db, &sale, 6_000, PaymentMethod::Online, h.clock.now()).await;

        h.clock.advance(chrono::Duration::hours(7));
        let report = sweeper(&h).sweep_stale_sales().await.unwrap();

        assert_eq!(report.cancelled_count(), 1);
        assert_eq!(report.restored_units, 3);
        assert_eq!(report.failed_payments, 1);

        let batch = h.db.inventory().get_batch(&batch.id).await.unwrap().unwrap();
        assert_eq!(batch.remaining_quantity, 10);

        let payment = h.db.payments().get(&payment.id).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Failed);
    }

    #[tokio::test]
    async fn test_sweep_never_cancels_sale_with_completed_payment() {
        let h = harness().await;
        // A short payment on a one-off sale completes but leaves it UNPAID
        let (sale, _) = seed_sale(&h.db, h.clock.now(), SalePlan::one_off(0)).await;
        let payment = seed_payment(&h.db, &sale, 10_000, PaymentMethod::Online, h.clock.now()).await;
        h.gateway.set_status(&payment.transaction_ref, OrderStatus::Successful);
        h.engine.reconcile_payment(&payment.transaction_ref).await.unwrap();
        assert_eq!(sale_status(&h, &sale.id).await, SaleStatus::Unpaid);

        h.clock.advance(chrono::Duration::days(2));
        let report = sweeper(&h).sweep_stale_sales().await.unwrap();

        assert!(report.cancelled_sales.is_empty());
        assert_eq!(sale_status(&h, &sale.id).await, SaleStatus::Unpaid);
    }

    #[tokio::test]
    async fn test_run_if_due_waits_for_interval() {
        let h = harness().await;
        let sweeper = sweeper(&h);

        assert!(sweeper.run_if_due().await.unwrap().is_some());
        assert!(sweeper.run_if_due().await.unwrap().is_none());

        h.clock.advance(chrono::Duration::hours(6));
        assert!(sweeper.run_if_due().await.unwrap().is_some());

        let last = h.db.job_runs().last_run(SWEEP_JOB).await.unwrap();
        assert_eq!(last, Some(h.clock.now()));
    }

    #[tokio::test]
    async fn test_oversized_timeout_is_a_config_error() {
        let h = harness().await;
        let (sale, _) = seed_sale(&h.db, h.clock.now(), SalePlan::installment(0)).await;

        let mut settings = h.config.sweeper.clone();
        settings.unpaid_timeout_secs = 20_000_000_000_000;
        let sweeper = StaleSaleSweeper::new(h.db.clone(), h.clock.clone(), settings);

        let err = sweeper.sweep_stale_sales().await.unwrap_err();
        assert!(err.is_config_error());
        assert_eq!(sale_status(&h, &sale.id).await, SaleStatus::Unpaid);

        let mut settings = h.config.sweeper.clone();
        settings.interval_secs = u64::MAX;
        let sweeper = StaleSaleSweeper::new(h.db.clone(), h.clock.clone(), settings);
        assert!(sweeper.run_if_due().await.unwrap_err().is_config_error());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let h = harness().await;
        let handle = sweeper(&h).start();
        tokio::task::yield_now().await;
        handle.shutdown().await.unwrap();
    }
}
