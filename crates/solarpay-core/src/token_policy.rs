//! # Token Duration Policy
//!
//! Maps a payment's coverage onto the validity of the tokens it buys.
//!
//! ```text
//! line item mode   months covered     token duration
//! ──────────────   ──────────────     ──────────────
//! ONE_OFF          (any)              Forever
//! INSTALLMENT      Unlimited          Forever
//! INSTALLMENT      Months(n), n > 0   n × 30 days
//! INSTALLMENT      Months(0)          no token this cycle
//! ```

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::installment::MonthsCovered;
use crate::types::PaymentMode;

/// Days granted per covered month.
pub const DAYS_PER_MONTH: u32 = 30;

/// Validity requested from the token protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
pub enum TokenDuration {
    Forever,
    Days(u32),
}

impl TokenDuration {
    /// Protocol encoding: `-1` for forever.
    pub const fn to_days(&self) -> i64 {
        match self {
            TokenDuration::Forever => -1,
            TokenDuration::Days(d) => *d as i64,
        }
    }

    /// Parses an operator-supplied day count. Negative means forever.
    pub fn from_days(days: i64) -> Self {
        if days < 0 {
            TokenDuration::Forever
        } else {
            TokenDuration::Days(u32::try_from(days).unwrap_or(u32::MAX))
        }
    }
}

/// Duration for a line item's devices, or `None` when this payment buys no
/// time for them.
pub fn token_duration(mode: PaymentMode, months: MonthsCovered) -> Option<TokenDuration> {
    match (mode, months) {
        (PaymentMode::OneOff, _) => Some(TokenDuration::Forever),
        (PaymentMode::Installment, MonthsCovered::Unlimited) => Some(TokenDuration::Forever),
        (PaymentMode::Installment, MonthsCovered::Months(0)) => None,
        (PaymentMode::Installment, MonthsCovered::Months(n)) => {
            Some(TokenDuration::Days(n.saturating_mul(DAYS_PER_MONTH)))
        }
    }
}
