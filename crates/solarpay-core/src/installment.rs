//! # Installment Calculator
//!
//! Derives what a single payment does to a sale's schedule.
//!
//! ## Coverage Math
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  current_paid = total_paid - miscellaneous_fees                        │
//! │  new_paid     = current_paid + payment                                 │
//! │                                                                         │
//! │  new_paid >= total_price ?                                             │
//! │     └── yes ──► COMPLETED, 0 remaining, Unlimited (forever tokens)     │
//! │                                                                         │
//! │  monthly <= 0 ?  (one-off sale that is still short)                    │
//! │     └── yes ──► UNPAID, remaining unchanged, 0 months                  │
//! │                                                                         │
//! │  total_months    = floor(new_paid / monthly)                           │
//! │  previous_months = floor(current_paid / monthly)                       │
//! │  this_payment    = total_months - previous_months                      │
//! │  remaining       = max(0, duration - total_months)                     │
//! │                                                                         │
//! │  0 < total_price - new_paid <= monthly  ──► remaining = min(rem, 1)    │
//! │                                                                         │
//! │  remaining == 0 ? COMPLETED : IN_INSTALLMENT                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Drift
//! Coverage is recomputed from cumulative totals on every payment, so a
//! payment that straddles a month boundary buys the month it completes and
//! nothing for the partial remainder. Overpayment carries forward only
//! through `total_paid`.
//!
//! ## Example
//! ```rust
//! use solarpay_core::installment::{apply_payment, MonthsCovered, SaleSnapshot};
//! use solarpay_core::{Money, SaleStatus};
//!
//! let sale = SaleSnapshot {
//!     total_price: Money::from_major(144_000),
//!     total_paid: Money::zero(),
//!     total_monthly_payment: Money::from_major(6_000),
//!     total_installment_duration: 24,
//!     remaining_installments: 24,
//!     total_miscellaneous_price: Money::zero(),
//! };
//!
//! let outcome = apply_payment(&sale, Money::from_major(6_000));
//! assert_eq!(outcome.new_status, SaleStatus::InInstallment);
//! assert_eq!(outcome.new_remaining_duration, 23);
//! assert_eq!(outcome.months_covered, MonthsCovered::Months(1));
//! ```

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::money::Money;
use crate::types::SaleStatus;

// =============================================================================
// Inputs & Outputs
// =============================================================================

/// The financial state of a sale at the moment a payment is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SaleSnapshot {
    pub total_price: Money,
    pub total_paid: Money,
    pub total_monthly_payment: Money,
    pub total_installment_duration: u32,
    pub remaining_installments: u32,
    pub total_miscellaneous_price: Money,
}

/// How much token time a payment buys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
pub enum MonthsCovered {
    /// The sale is fully paid; tokens never expire.
    Unlimited,
    /// Whole months bought by this payment. May be zero.
    Months(u32),
}

impl MonthsCovered {
    /// Storage encoding: `-1` for unlimited.
    pub const fn as_i64(&self) -> i64 {
        match self {
            MonthsCovered::Unlimited => -1,
            MonthsCovered::Months(m) => *m as i64,
        }
    }

    /// Inverse of [`as_i64`](Self::as_i64). Any negative value is unlimited.
    pub fn from_i64(value: i64) -> Self {
        if value < 0 {
            MonthsCovered::Unlimited
        } else {
            MonthsCovered::Months(u32::try_from(value).unwrap_or(u32::MAX))
        }
    }

    pub const fn is_zero(&self) -> bool {
        matches!(self, MonthsCovered::Months(0))
    }
}

/// Result of applying one payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct InstallmentOutcome {
    pub new_status: SaleStatus,
    pub new_remaining_duration: u32,
    pub months_covered: MonthsCovered,
    /// `total_paid + amount`, fees included.
    pub new_total_paid: Money,
}

// =============================================================================
// Calculator
// =============================================================================

/// Applies `amount` to `sale` and returns the new schedule.
///
/// Pure and deterministic. Callers persist the outcome; this function never
/// looks at the stored status, so a COMPLETED/CANCELLED check belongs to the
/// caller.
pub fn apply_payment(sale: &SaleSnapshot, amount: Money) -> InstallmentOutcome {
    let current_paid = sale.total_paid - sale.total_miscellaneous_price;
    let new_paid = current_paid + amount;
    let new_total_paid = sale.total_paid + amount;
    let monthly = sale.total_monthly_payment;

    if new_paid >= sale.total_price {
        return InstallmentOutcome {
            new_status: SaleStatus::Completed,
            new_remaining_duration: 0,
            months_covered: MonthsCovered::Unlimited,
            new_total_paid,
        };
    }

    if !monthly.is_positive() {
        // new_paid < total_price here, so a one-off sale stays unpaid
        return InstallmentOutcome {
            new_status: SaleStatus::Unpaid,
            new_remaining_duration: sale.remaining_installments,
            months_covered: MonthsCovered::Months(0),
            new_total_paid,
        };
    }

    let total_months = new_paid.whole_multiples_of(monthly);
    let previous_months = current_paid.whole_multiples_of(monthly);
    let this_payment = (total_months - previous_months).max(0);

    let mut remaining = (i64::from(sale.total_installment_duration) - total_months).max(0);

    let remaining_balance = sale.total_price - new_paid;
    if remaining_balance.is_positive() && remaining_balance <= monthly {
        remaining = remaining.min(1);
    }

    let new_status = if remaining == 0 {
        SaleStatus::Completed
    } else {
        SaleStatus::InInstallment
    };

    InstallmentOutcome {
        new_status,
        new_remaining_duration: u32::try_from(remaining).unwrap_or(u32::MAX),
        months_covered: MonthsCovered::Months(u32::try_from(this_payment).unwrap_or(u32::MAX)),
        new_total_paid,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
