//! # Validation Module
//!
//! Input checks applied before anything touches the database or the
//! payment gateway.
//!
//! ## Validation Layers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Layer 1: Engine entry points (reconcile, initiate, credit, debit)     │
//! │  └── THIS MODULE: amounts, references, phone numbers                   │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Database (SQLite)                                            │
//! │  ├── UNIQUE(transaction_ref), UNIQUE(reference)                        │
//! │  └── CHECK(amount > 0), foreign keys                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use solarpay_core::validation::{validate_amount, validate_reference};
//! use solarpay_core::Money;
//!
//! validate_amount(Money::from_major(6_000)).unwrap();
//! validate_reference("transaction_ref", "SP-2024-0001").unwrap();
//! ```

use crate::error::ValidationError;
use crate::money::Money;
use crate::MAX_REFERENCE_LEN;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Phone number sent to the gateway when the payer has none on file.
pub const FALLBACK_MSISDN: &str = "2348000000000";

// =============================================================================
// Amounts
// =============================================================================

/// Payment, credit and debit amounts must be strictly positive.
pub fn validate_amount(amount: Money) -> ValidationResult<()> {
    if !amount.is_positive() {
        return Err(ValidationError::MustBePositive {
            field: "amount".to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// References
// =============================================================================

/// Validates an idempotency key (transaction ref, wallet reference).
///
/// ## Rules
/// - Not empty after trimming
/// - At most [`MAX_REFERENCE_LEN`] characters
/// - Printable ASCII without whitespace (it is embedded in gateway URLs)
pub fn validate_reference(field: &str, reference: &str) -> ValidationResult<()> {
    let trimmed = reference.trim();

    if trimmed.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if trimmed.len() > MAX_REFERENCE_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_REFERENCE_LEN,
        });
    }

    if trimmed != reference || !reference.chars().all(|c| c.is_ascii_graphic()) {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: "must be printable ASCII without spaces".to_string(),
        });
    }

    Ok(())
}

// =============================================================================
// Phone Numbers
// =============================================================================

/// Normalizes a Nigerian phone number to gateway MSISDN form (`234XXXXXXXXXX`).
///
/// ```rust
/// use solarpay_core::validation::normalize_msisdn;
///
/// assert_eq!(normalize_msisdn("0803 123 4567").unwrap(), "2348031234567");
/// assert_eq!(normalize_msisdn("+2348031234567").unwrap(), "2348031234567");
/// assert!(normalize_msisdn("12345").is_err());
/// ```
pub fn normalize_msisdn(phone: &str) -> ValidationResult<String> {
    let digits: String = phone
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '+'))
        .collect();

    if digits.is_empty() {
        return Err(ValidationError::Required {
            field: "phone".to_string(),
        });
    }

    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ValidationError::InvalidFormat {
            field: "phone".to_string(),
            reason: "must contain only digits".to_string(),
        });
    }

    let normalized = if digits.len() == 11 && digits.starts_with('0') {
        format!("234{}", &digits[1..])
    } else {
        digits
    };

    if normalized.len() != 13 || !normalized.starts_with("234") {
        return Err(ValidationError::InvalidFormat {
            field: "phone".to_string(),
            reason: "expected 234 followed by 10 digits".to_string(),
        });
    }

    Ok(normalized)
}

/// MSISDN for a payer, falling back to [`FALLBACK_MSISDN`] when the stored
/// number is missing or unusable.
pub fn msisdn_or_fallback(phone: Option<&str>) -> String {
    phone
        .and_then(|p| normalize_msisdn(p).ok())
        .unwrap_or_else(|| FALLBACK_MSISDN.to_string())
}

// =============================================================================
// Pagination
// =============================================================================

/// Clamps a requested page size to `1..=max`.
pub fn clamp_page_size(requested: u32, max: u32) -> u32 {
    requested.clamp(1, max.max(1))
}

// =============================================================================
// Unit Tests
// =============================================================================
