//! # Repository Module
//!
//! Database repository implementations for Solarpay.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Engine                                                                 │
//! │    │  db.payments().complete(request)                                  │
//! │    ▼                                                                    │
//! │  PaymentRepository ──► one SQLite transaction:                         │
//! │    ├── guarded PENDING/FAILED → COMPLETED                              │
//! │    ├── optional wallet debit (wallet::apply_entry_in)                  │
//! │    ├── installment calculator on the locked sale row                   │
//! │    └── audit row                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Rows are read into private `*Row` structs (`sqlx::FromRow`) and converted
//! into solarpay-core types, so column layout never leaks out of this crate.
//!
//! ## Available Repositories
//!
//! - [`SaleRepository`](sale::SaleRepository) - Sales, line items, customers, stale-sale cancellation
//! - [`PaymentRepository`](payment::PaymentRepository) - Payments, audit trail, completion unit
//! - [`DeviceRepository`](device::DeviceRepository) - Devices, counters, tokens
//! - [`WalletRepository`](wallet::WalletRepository) - Wallets, ledger, top-ups
//! - [`InventoryRepository`](inventory::InventoryRepository) - Batches and allocations
//! - [`JobRunRepository`](job::JobRunRepository) - Scheduled job bookkeeping

pub mod device;
pub mod inventory;
pub mod job;
pub mod payment;
pub mod sale;
pub mod wallet;

use crate::error::{DbError, DbResult};

/// Narrows a stored INTEGER to `u32`.
pub(crate) fn to_u32(field: &str, value: i64) -> DbResult<u32> {
    u32::try_from(value).map_err(|_| DbError::CorruptValue {
        field: field.to_string(),
        value: value.to_string(),
    })
}
