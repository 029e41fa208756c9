//! # Money Module
//!
//! Provides the `Money` type for handling monetary values safely.
//!
//! ## Why Integer Money?
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  INSTALLMENT MATH NEEDS EXACT DIVISION                                  │
//! │                                                                         │
//! │  months covered = floor(paid / monthly)                                │
//! │                                                                         │
//! │  With floats:  5999.999999 / 6000 → 0 months   ❌ customer short-changed│
//! │  With kobo:    600000 / 600000    → 1 month    ✅                       │
//! │                                                                         │
//! │  Every amount is stored as a count of kobo (1/100 NGN).                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use solarpay_core::money::Money;
//!
//! let monthly = Money::from_minor(600_000); // ₦6,000.00
//! let paid = Money::from_major(18_000);     // ₦18,000.00
//! assert_eq!(paid.whole_multiples_of(monthly), 3);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Mul, Sub, SubAssign};
use ts_rs::TS;

// =============================================================================
// Money Type
// =============================================================================

/// A monetary value in the smallest currency unit (kobo).
///
/// ## Design Decisions
/// - **i64 (signed)**: Balances can be compared and subtracted without
///   wrapping; negative values only appear in intermediate arithmetic
/// - **Single field tuple struct**: Zero-cost abstraction over i64
///
/// ## Where Money Flows
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │  Payment.amount ──► Installment calculator ──► Sale.total_paid         │
/// │                                                                         │
/// │  Wallet.balance ──► credit/debit ──► WalletTransaction.new_balance     │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Money(i64);

impl Money {
    /// Creates a Money value from kobo (the smallest currency unit).
    ///
    /// ## Example
    /// ```rust
    /// use solarpay_core::money::Money;
    ///
    /// let price = Money::from_minor(1_440_050); // ₦14,400.50
    /// assert_eq!(price.minor(), 1_440_050);
    /// ```
    #[inline]
    pub const fn from_minor(minor: i64) -> Self {
        Money(minor)
    }

    /// Creates a Money value from whole naira.
    #[inline]
    pub const fn from_major(major: i64) -> Self {
        Money(major * 100)
    }

    /// Returns the value in kobo.
    #[inline]
    pub const fn minor(&self) -> i64 {
        self.0
    }

    /// Returns the whole naira portion (truncated toward zero).
    #[inline]
    pub const fn major(&self) -> i64 {
        self.0 / 100
    }

    /// Returns the kobo portion (always 0-99).
    #[inline]
    pub const fn minor_part(&self) -> i64 {
        (self.0 % 100).abs()
    }

    /// Returns zero money value.
    #[inline]
    pub const fn zero() -> Self {
        Money(0)
    }

    /// Checks if the value is zero.
    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Checks if the value is positive (greater than zero).
    #[inline]
    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }

    /// Checks if the value is negative (less than zero).
    #[inline]
    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Number of whole `unit`s contained in this amount, rounded toward
    /// negative infinity.
    ///
    /// ## Floor Semantics
    /// ```text
    /// 17_999.99 / 6_000 →  2
    /// 18_000.00 / 6_000 →  3
    /// -1.00     / 6_000 → -1   (floor, not truncation)
    /// ```
    ///
    /// Returns 0 when `unit` is not positive.
    #[inline]
    pub const fn whole_multiples_of(&self, unit: Money) -> i64 {
        if unit.0 <= 0 {
            return 0;
        }
        self.0.div_euclid(unit.0)
    }

    /// Adds two amounts, returning `None` on overflow.
    #[inline]
    pub const fn checked_add(self, other: Money) -> Option<Money> {
        match self.0.checked_add(other.0) {
            Some(v) => Some(Money(v)),
            None => None,
        }
    }

    /// Subtracts two amounts, returning `None` on overflow.
    #[inline]
    pub const fn checked_sub(self, other: Money) -> Option<Money> {
        match self.0.checked_sub(other.0) {
            Some(v) => Some(Money(v)),
            None => None,
        }
    }
}

// =============================================================================
// Trait Implementations
// =============================================================================

/// Renders as naira with two decimals (`NGN 6000.00`). Debug/log output only;
/// customer-facing messages format amounts themselves.
impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        write!(f, "{}NGN {}.{:02}", sign, self.major().abs(), self.minor_part())
    }
}

impl Default for Money {
    fn default() -> Self {
        Money::zero()
    }
}

impl Add for Money {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Money(self.0 + other.0)
    }
}

impl AddAssign for Money {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.0 += other.0;
    }
}

impl Sub for Money {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Money(self.0 - other.0)
    }
}

impl SubAssign for Money {
    #[inline]
    fn sub_assign(&mut self, other: Self) {
        self.0 -= other.0;
    }
}

/// Multiplication by a count (months, quantity).
impl Mul<i64> for Money {
    type Output = Self;

    #[inline]
    fn mul(self, count: i64) -> Self {
        Money(self.0 * count)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_minor_and_major() {
        let money = Money::from_minor(1_440_050);
        assert_eq!(money.minor(), 1_440_050);
        assert_eq!(money.major(), 14_400);
        assert_eq!(money.minor_part(), 50);

        assert_eq!(Money::from_major(6_000).minor(), 600_000);
    }

    #[test]
    fn test_display() {
        assert_eq!(Money::from_minor(600_000).to_string(), "NGN 6000.00");
        assert_eq!(Money::from_minor(5).to_string(), "NGN 0.05");
        assert_eq!(Money::from_minor(-150).to_string(), "-NGN 1.50");
    }

    #[test]
    fn test_arithmetic() {
        let a = Money::from_major(1_000);
        let b = Money::from_major(250);

        assert_eq!((a + b).minor(), 125_000);
        assert_eq!((a - b).minor(), 75_000);
        assert_eq!((b * 4).minor(), 100_000);

        let mut c = a;
        c += b;
        c -= Money::from_major(50);
        assert_eq!(c, Money::from_major(1_200));
    }

    #[test]
    fn test_whole_multiples_floors() {
        let monthly = Money::from_major(6_000);
        assert_eq!(Money::from_major(18_000).whole_multiples_of(monthly), 3);
        assert_eq!(Money::from_minor(1_799_999).whole_multiples_of(monthly), 2);
        assert_eq!(Money::zero().whole_multiples_of(monthly), 0);
        assert_eq!(Money::from_minor(-1).whole_multiples_of(monthly), -1);
    }

    #[test]
    fn test_whole_multiples_of_non_positive_unit() {
        assert_eq!(Money::from_major(10).whole_multiples_of(Money::zero()), 0);
        assert_eq!(
            Money::from_major(10).whole_multiples_of(Money::from_minor(-5)),
            0
        );
    }

    #[test]
    fn test_checked_ops() {
        assert_eq!(
            Money::from_minor(i64::MAX).checked_add(Money::from_minor(1)),
            None
        );
        assert_eq!(
            Money::from_minor(10).checked_sub(Money::from_minor(3)),
            Some(Money::from_minor(7))
        );
    }

    #[test]
    fn test_serializes_as_plain_integer() {
        let json = serde_json::to_string(&Money::from_minor(4200)).unwrap();
        assert_eq!(json, "4200");
    }
}
