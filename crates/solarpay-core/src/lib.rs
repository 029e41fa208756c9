//! # solarpay-core: Pure Business Logic for Solarpay
//!
//! Installment sales of solar hardware: what a payment is worth, how long the
//! resulting unlock tokens last, and which inputs are acceptable. Nothing in
//! here performs I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Solarpay Architecture                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │         reconciler daemon / webhook intake / operators          │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │  solarpay-engine: reconciliation, tokens, wallet, sweeper       │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ solarpay-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌─────────────┐  ┌────────────┐  ┌──────────┐ │   │
//! │  │   │   types   │  │ installment │  │token_policy│  │validation│ │   │
//! │  │   │   Sale    │  │ apply_      │  │ months →   │  │ amounts  │ │   │
//! │  │   │  Payment  │  │  payment    │  │  days      │  │ refs     │ │   │
//! │  │   └───────────┘  └─────────────┘  └────────────┘  └──────────┘ │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 solarpay-db (Database Layer)                    │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (Sale, Payment, Device, Wallet, ...)
//! - [`money`] - Money type with integer arithmetic
//! - [`installment`] - Installment calculator
//! - [`token_policy`] - Token duration derivation
//! - [`error`] - Domain error types
//! - [`validation`] - Input validation
//!
//! ## Example Usage
//!
//! ```rust
//! use solarpay_core::installment::{apply_payment, SaleSnapshot};
//! use solarpay_core::token_policy::{token_duration, TokenDuration};
//! use solarpay_core::{Money, PaymentMode};
//!
//! let sale = SaleSnapshot {
//!     total_price: Money::from_major(144_000),
//!     total_paid: Money::from_major(6_000),
//!     total_monthly_payment: Money::from_major(6_000),
//!     total_installment_duration: 24,
//!     remaining_installments: 23,
//!     total_miscellaneous_price: Money::zero(),
//! };
//!
//! let outcome = apply_payment(&sale, Money::from_major(12_000));
//! let duration = token_duration(PaymentMode::Installment, outcome.months_covered);
//! assert_eq!(duration, Some(TokenDuration::Days(60)));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod installment;
pub mod money;
pub mod token_policy;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use installment::{apply_payment, InstallmentOutcome, MonthsCovered, SaleSnapshot};
pub use money::Money;
pub use token_policy::{token_duration, TokenDuration};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Longest accepted transaction/wallet reference.
///
/// Matches the gateway's reference column width.
pub const MAX_REFERENCE_LEN: usize = 100;

/// Largest page returned by history queries.
pub const MAX_PAGE_SIZE: u32 = 100;
