//! # solarpay-engine: Reconciliation Engine for Solarpay
//!
//! Turns gateway confirmations, cash confirmations and wallet debits into
//! sale progress, device unlock tokens and agent ledger movements.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Reconciliation Engine                            │
//! │                                                                         │
//! │  triggers:  webhook ─┐   operator re-check ─┐   PendingPaymentPoller ─┐ │
//! │                      ▼                      ▼                         ▼ │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 ReconciliationEngine (reconcile.rs)              │  │
//! │  │   KeyedLocks[transaction_ref] ──► gateway check ──► complete()   │  │
//! │  └─────────┬───────────────────────────────┬────────────────────────┘  │
//! │            │ after commit                  │ WALLET debits             │
//! │            ▼                               ▼                           │
//! │  ┌──────────────────────┐       ┌──────────────────────┐               │
//! │  │ TokenIssuance        │       │ WalletLedger         │               │
//! │  │ Coordinator          │       │ credit / debit       │               │
//! │  │ per-device CAS       │       │ top-ups              │               │
//! │  └─────────┬────────────┘       └──────────┬───────────┘               │
//! │            ▼                               ▼                           │
//! │  ┌──────────────────────┐       ┌──────────────────────┐               │
//! │  │ TokenProtocol        │       │ PaymentGateway       │               │
//! │  │ (HTTP token service) │       │ (Ogaranya)           │               │
//! │  └──────────────────────┘       └──────────────────────┘               │
//! │                                                                         │
//! │  StaleSaleSweeper: cancels UNPAID sales past the timeout               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Orchestration
//! - [`reconcile`] - Payment initiation, webhooks and reconciliation
//! - [`tokens`] - Device token issuance
//! - [`ledger`] - Agent wallets and top-ups
//! - [`sweeper`] - Stale sale cancellation
//! - [`poller`] - Periodic re-check of pending money
//!
//! ### External Seams
//! - [`gateway`] - Payment gateway trait and webhook parsing
//! - [`ogaranya`] - Ogaranya HTTP client
//! - [`protocol`] - Token service trait and HTTP client
//! - [`notify`] - Customer notifications
//!
//! ### Support
//! - [`config`] - `reconciler.toml` loading
//! - [`error`] - Engine error types
//! - [`retry`] - Exponential backoff for external calls
//! - [`locks`] - Per-key async mutexes
//! - [`clock`] - Injectable time source
//!
//! ## Usage
//!
//! ```rust,ignore
//! use solarpay_engine::{EngineConfig, ReconciliationEngine, SystemClock, TracingNotifier};
//!
//! let config = EngineConfig::load_or_default(None);
//! let db = Database::new(config.database.db_config()).await?;
//! let engine = ReconciliationEngine::assemble(db, &config, gateway, protocol,
//!     Arc::new(TracingNotifier), Arc::new(SystemClock));
//!
//! let result = engine.reconcile_payment("SP-0001").await?;
//! println!("{}: {} tokens", result.status, result.issued_tokens.len());
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod locks;
pub mod notify;
pub mod ogaranya;
pub mod poller;
pub mod protocol;
pub mod reconcile;
pub mod retry;
pub mod sweeper;
pub mod tokens;

#[cfg(test)]
mod test_support;

// =============================================================================
// Re-exports
// =============================================================================

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use gateway::{GatewayStatus, OrderHandle, OrderStatus, PaymentGateway, WebhookEvent};
pub use ledger::{TopUpReconciliation, WalletLedger};
pub use notify::{Notifier, TracingNotifier};
pub use ogaranya::OgaranyaGateway;
pub use poller::{PendingPaymentPoller, PollReport, PollerHandle};
pub use protocol::{HttpTokenProtocol, IssuedCode, TokenProtocol};
pub use reconcile::{PaymentRequest, ReconciliationEngine, ReconciliationResult, ReconciliationStatus};
pub use retry::RetryPolicy;
pub use sweeper::{StaleSaleSweeper, SweepReport, SweeperHandle};
pub use tokens::{TokenBatch, TokenIssuanceCoordinator};
