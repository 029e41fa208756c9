//! # Engine Error Types
//!
//! Error types for reconciliation, token issuance and wallet operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Engine Error Categories                            │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │    Gateway      │  │     Token Service       │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Gateway        │  │  TokenProtocol          │ │
//! │  │  ConfigLoad     │  │  GatewayTimeout │  │                         │ │
//! │  │  ConfigSave     │  │  GatewayRejected│  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Business     │  │    Database     │  │      Internal           │ │
//! │  │   (fatal)       │  │                 │  │                         │ │
//! │  │  Core(..)       │  │  Database       │  │  ShuttingDown           │ │
//! │  │                 │  │                 │  │  ChannelError           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use solarpay_core::{CoreError, ValidationError};
use solarpay_db::DbError;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine error type covering every failure the reconciler can surface.
///
/// Callers branch on [`is_fatal`](EngineError::is_fatal) and
/// [`is_retryable`](EngineError::is_retryable) rather than on variants.
#[derive(Debug, Error)]
pub enum EngineError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid engine configuration.
    #[error("Invalid engine configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Gateway Errors
    // =========================================================================
    /// Transport-level gateway failure (connection refused, reset, 5xx).
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// Gateway did not answer in time.
    #[error("Gateway timeout after {0} seconds")]
    GatewayTimeout(u64),

    /// Gateway answered but refused the request.
    #[error("Gateway rejected request ({status}): {message}")]
    GatewayRejected { status: u16, message: String },

    /// Gateway answered with a body we could not interpret.
    #[error("Unexpected gateway response: {0}")]
    InvalidResponse(String),

    // =========================================================================
    // Token Service Errors
    // =========================================================================
    /// Token generation failed for a device.
    #[error("Token protocol error for device {device_id}: {message}")]
    TokenProtocol { device_id: String, message: String },

    // =========================================================================
    // Business Errors
    // =========================================================================
    /// Business rule violation (not found, insufficient balance, ...).
    #[error(transparent)]
    Core(#[from] CoreError),

    // =========================================================================
    // Database Errors
    // =========================================================================
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Serialization of an audit payload failed.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Background task is shutting down.
    #[error("Engine is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Internal engine error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<ValidationError> for EngineError {
    fn from(err: ValidationError) -> Self {
        EngineError::Core(CoreError::Validation(err))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EngineError::GatewayTimeout(0)
        } else if err.is_decode() {
            EngineError::InvalidResponse(err.to_string())
        } else {
            EngineError::Gateway(err.to_string())
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::SerializationFailed(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        EngineError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for EngineError {
    fn from(err: toml::ser::Error) -> Self {
        EngineError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl EngineError {
    /// Returns true if the same call may succeed later.
    ///
    /// ## Retryable Errors
    /// - Gateway transport failures and timeouts
    /// - Gateway 429 and 5xx answers
    /// - Token service failures
    /// - Optimistic conflicts and busy database
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Gateway(_)
            | EngineError::GatewayTimeout(_)
            | EngineError::TokenProtocol { .. } => true,
            EngineError::GatewayRejected { status, .. } => *status == 429 || *status >= 500,
            EngineError::Database(db) => db.is_transient(),
            _ => false,
        }
    }

    /// Returns true for errors that must be surfaced immediately.
    ///
    /// ## Fatal Errors
    /// - Missing payment, sale, device, wallet or top-up
    /// - Insufficient wallet balance
    /// - Invalid input
    pub fn is_fatal(&self) -> bool {
        match self {
            EngineError::Core(_) => true,
            EngineError::Database(DbError::NotFound { .. } | DbError::UniqueViolation { .. }) => true,
            other => other.is_config_error(),
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidConfig(_)
                | EngineError::ConfigLoadFailed(_)
                | EngineError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if the gateway did not answer in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, EngineError::GatewayTimeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solarpay_core::Money;

    #[test]
    fn test_retryable_errors() {
        assert!(EngineError::Gateway("connection reset".into()).is_retryable());
        assert!(EngineError::GatewayTimeout(30).is_retryable());
        assert!(EngineError::GatewayRejected {
            status: 503,
            message: "maintenance".into()
        }
        .is_retryable());
        assert!(EngineError::Database(DbError::Conflict("balance moved".into())).is_retryable());

        assert!(!EngineError::GatewayRejected {
            status: 400,
            message: "bad msisdn".into()
        }
        .is_retryable());
        assert!(!EngineError::InvalidConfig("bad config".into()).is_retryable());
        assert!(!EngineError::Core(CoreError::PaymentNotFound("SP-1".into())).is_retryable());
    }

    #[test]
    fn test_fatal_errors() {
        let short = EngineError::Core(CoreError::InsufficientBalance {
            agent_id: "agent-7".into(),
            balance: Money::from_major(3_000),
            requested: Money::from_major(5_000),
        });
        assert!(short.is_fatal());
        assert!(EngineError::Database(DbError::not_found("Sale", "s-1")).is_fatal());
        assert!(EngineError::InvalidConfig("x".into()).is_fatal());
        assert!(!EngineError::GatewayTimeout(10).is_fatal());
    }

    #[test]
    fn test_validation_converts_to_core() {
        let err: EngineError = ValidationError::MustBePositive {
            field: "amount".into(),
        }
        .into();
        assert!(matches!(err, EngineError::Core(CoreError::Validation(_))));
        assert!(err.to_string().contains("amount"));
    }
}
