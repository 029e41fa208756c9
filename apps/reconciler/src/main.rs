//! # Solarpay Reconciler
//!
//! Background daemon for the reconciliation engine.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Reconciler Daemon                                │
//! │                                                                         │
//! │  reconciler.toml + env ───► EngineConfig ───► ReconciliationEngine     │
//! │                                                    │                    │
//! │                     ┌──────────────────────────────┤                    │
//! │                     ▼                              ▼                    │
//! │            StaleSaleSweeper              PendingPaymentPoller           │
//! │            (cancel UNPAID)               (re-check PENDING,             │
//! │                                           retry tokens)                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```bash
//! reconciler                      # platform config dir reconciler.toml
//! reconciler ./reconciler.toml    # explicit config file
//! RUST_LOG=solarpay_engine=debug reconciler
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use solarpay_db::Database;
use solarpay_engine::{
    EngineConfig, HttpTokenProtocol, OgaranyaGateway, PendingPaymentPoller, ReconciliationEngine,
    StaleSaleSweeper, SystemClock, TracingNotifier,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!("Starting Solarpay reconciler...");

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = EngineConfig::load(config_path).context("loading reconciler config")?;
    info!(
        db_path = %config.database.path.display(),
        gateway = %config.gateway.base_url,
        sweep_interval_secs = config.sweeper.interval_secs,
        poll_interval_secs = config.poller.interval_secs,
        "Configuration loaded"
    );

    // Open database (migrations run on connect)
    let db = Database::new(config.database.db_config())
        .await
        .context("opening database")?;
    info!("Database ready");

    // External seams
    let gateway = Arc::new(OgaranyaGateway::new(&config.gateway).context("building gateway client")?);
    let protocol = Arc::new(HttpTokenProtocol::new(&config.token_service).context("building token client")?);
    let clock = Arc::new(SystemClock);

    let engine = Arc::new(ReconciliationEngine::assemble(
        db.clone(),
        &config,
        gateway,
        protocol,
        Arc::new(TracingNotifier),
        clock.clone(),
    ));

    // Background jobs
    let sweeper = StaleSaleSweeper::new(db.clone(), clock.clone(), config.sweeper.clone()).start();
    let poller = PendingPaymentPoller::new(engine, db.clone(), clock, config.poller.clone()).start();

    shutdown_signal().await;

    if let Err(e) = poller.shutdown().await {
        tracing::warn!(error = %e, "Poller already stopped");
    }
    if let Err(e) = sweeper.shutdown().await {
        tracing::warn!(error = %e, "Sweeper already stopped");
    }

    db.close().await;
    info!("Reconciler shutdown complete");
    Ok(())
}

/// Waits for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping background jobs...");
}
