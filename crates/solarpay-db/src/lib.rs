//! # solarpay-db: Database Layer for Solarpay
//!
//! SQLite persistence for sales, payments, devices, tokens and agent wallets,
//! using sqlx for async operations.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Solarpay Data Flow                               │
//! │                                                                         │
//! │  ReconciliationEngine / WalletLedger / StaleSaleSweeper                │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   solarpay-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │               │    │  (embedded)  │  │   │
//! │  │   │               │    │ SaleRepo      │    │              │  │   │
//! │  │   │ SqlitePool    │◄───│ PaymentRepo   │    │ 001_initial  │  │   │
//! │  │   │ WAL, FKs,     │    │ DeviceRepo    │    │  _schema.sql │  │   │
//! │  │   │ busy_timeout  │    │ WalletRepo    │    │              │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database                             │   │
//! │  │   solarpay.db (path from reconciler.toml)                       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Repository implementations
//!
//! ## Usage
//!
//! ```rust,ignore
//! use solarpay_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("solarpay.db")).await?;
//! let payment = db.payments().get_by_transaction_ref("SP-001").await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

// Repository re-exports for convenience
pub use repository::device::{DeviceRepository, TokenableDevice};
pub use repository::inventory::InventoryRepository;
pub use repository::job::JobRunRepository;
pub use repository::payment::{CompletionOutcome, CompletionRequest, PaymentRepository};
pub use repository::sale::{CancelledSale, SaleRepository};
pub use repository::wallet::{LedgerEntry, LedgerWrite, WalletRepository};
