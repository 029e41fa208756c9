//! # Error Types
//!
//! Domain-specific error types for solarpay-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  solarpay-core errors (this file)                                      │
//! │  ├── CoreError        - Business rule violations                       │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  solarpay-db errors                                                    │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  solarpay-engine errors                                                │
//! │  └── EngineError      - Fatal / transient classification for callers  │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → EngineError → caller              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use crate::money::Money;

// =============================================================================
// Core Error
// =============================================================================

/// Business rule violations.
///
/// Every variant is fatal: retrying the same request gives the same answer.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No payment carries this transaction reference.
    #[error("Payment not found: {0}")]
    PaymentNotFound(String),

    /// Sale not found.
    #[error("Sale not found: {0}")]
    SaleNotFound(String),

    /// Device not found.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Agent has no wallet.
    #[error("Wallet not found for agent {0}")]
    WalletNotFound(String),

    /// No top-up carries this reference.
    #[error("Top-up not found: {0}")]
    TopUpNotFound(String),

    /// A debit would take the wallet below zero.
    ///
    /// ## When This Occurs
    /// - Agent pays for a sale from a wallet that was not topped up
    /// - Two debits race and the second one loses
    ///
    /// ```text
    /// debit(agent-7, 5_000) with balance 3_000
    ///      │
    ///      ▼
    /// InsufficientBalance { agent_id: "agent-7", balance: 3_000, requested: 5_000 }
    /// ```
    #[error("Insufficient wallet balance for agent {agent_id}: balance {balance}, requested {requested}")]
    InsufficientBalance {
        agent_id: String,
        balance: Money,
        requested: Money,
    },

    /// Operation not allowed for the sale's current status.
    #[error("Sale {sale_id} is {current_status}, cannot perform operation")]
    InvalidSaleStatus {
        sale_id: String,
        current_status: String,
    },

    /// Device exists but cannot receive tokens.
    #[error("Device {0} is not tokenable")]
    DeviceNotTokenable(String),

    /// Payment method does not support the requested flow.
    #[error("Payment {transaction_ref} uses method {method}, which does not support {operation}")]
    UnsupportedMethod {
        transaction_ref: String,
        method: String,
        operation: String,
    },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Invalid format.
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================
