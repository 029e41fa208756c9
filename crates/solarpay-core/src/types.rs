//! # Domain Types
//!
//! Core domain types used throughout Solarpay.
//!
//! ## Type Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │      Sale       │   │    Payment      │   │     Device      │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  total_price    │◄──│  sale_id (FK)   │   │  serial_number  │       │
//! │  │  total_paid     │   │  transaction_ref│   │  key material   │       │
//! │  │  remaining_inst │   │  status         │   │  count (mono)   │       │
//! │  │  status         │   │  months_covered │   │  is_tokenable   │       │
//! │  └────────┬────────┘   └─────────────────┘   └────────┬────────┘       │
//! │           │ line items                                 │ tokens         │
//! │  ┌────────▼────────┐                          ┌────────▼────────┐       │
//! │  │  SaleLineItem   │── device_ids ───────────►│     Token       │       │
//! │  │  payment_mode   │                          │  duration_days  │       │
//! │  └─────────────────┘                          └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │     Wallet      │──►│WalletTransaction│   │  WalletTopUp    │       │
//! │  │  balance cache  │   │  prev/new bal   │   │  gateway order  │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity
//! Every entity is keyed by a UUID v4 string. Business keys (serial number,
//! transaction reference, wallet reference) are unique but never used as
//! foreign keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

use crate::installment::SaleSnapshot;
use crate::money::Money;

/// Generates a new entity identifier.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// =============================================================================
// Sale Status
// =============================================================================

/// Lifecycle state of an installment sale.
///
/// ```text
///            payment              final payment
///  UNPAID ───────────► IN_INSTALLMENT ───────────► COMPLETED
///    │  └──────────── full payment ──────────────────▲
///    │
///    └── sweeper timeout ──► CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaleStatus {
    /// Created at checkout, nothing paid yet.
    #[default]
    Unpaid,
    /// At least one installment paid, balance outstanding.
    InInstallment,
    /// Fully paid. Terminal.
    Completed,
    /// Abandoned before any payment cleared. Terminal.
    Cancelled,
}

impl SaleStatus {
    /// COMPLETED and CANCELLED never transition again.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, SaleStatus::Completed | SaleStatus::Cancelled)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            SaleStatus::Unpaid => "unpaid",
            SaleStatus::InInstallment => "in_installment",
            SaleStatus::Completed => "completed",
            SaleStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SaleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Payment Mode / Method / Status
// =============================================================================

/// How a sale (or a single line item) is paid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMode {
    /// Paid in full up front. Tokens never expire.
    OneOff,
    /// Paid monthly. Tokens last as long as the months covered.
    Installment,
}

/// Channel through which a payment is collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    /// Bank transfer / mobile money through the payment gateway.
    Online,
    /// Cash collected by a field agent.
    Cash,
    /// Debited from the selling agent's wallet.
    Wallet,
}

impl PaymentMethod {
    pub const fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Online => "online",
            PaymentMethod::Cash => "cash",
            PaymentMethod::Wallet => "wallet",
        }
    }
}

/// Settlement state of a single payment.
///
/// ```text
///  PENDING ──► COMPLETED   (terminal)
///     │   └──► REFUNDED    (terminal, sale was cancelled)
///     └──────► FAILED ──► COMPLETED | REFUNDED  (retry with same reference)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Completed | PaymentStatus::Refunded)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Sale
// =============================================================================

/// Bank account a customer pays monthly installments into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct InstallmentAccountDetails {
    pub bank_name: String,
    pub account_name: String,
    pub account_number: String,
}

/// An installment (or one-off) sale of energy hardware.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Sale {
    pub id: String,
    pub customer_id: String,
    /// Agent who closed the sale, if any.
    pub agent_id: Option<String>,
    pub status: SaleStatus,
    /// Immutable after creation.
    pub payment_mode: PaymentMode,
    pub payment_method: PaymentMethod,
    pub total_price: Money,
    /// Includes miscellaneous fees. Never decreases.
    pub total_paid: Money,
    /// Zero for one-off sales.
    pub total_monthly_payment: Money,
    pub installment_starting_price: Money,
    /// Months in the plan. Zero for one-off sales.
    pub total_installment_duration: u32,
    pub remaining_installments: u32,
    /// Fees counted in `total_paid` but excluded from coverage math.
    pub total_miscellaneous_price: Money,
    pub account_details: Option<InstallmentAccountDetails>,
    /// Whether `account_details` has been sent to the customer.
    pub delivered_account_details: bool,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl Sale {
    /// Financial fields the installment calculator reads.
    pub fn snapshot(&self) -> SaleSnapshot {
        SaleSnapshot {
            total_price: self.total_price,
            total_paid: self.total_paid,
            total_monthly_payment: self.total_monthly_payment,
            total_installment_duration: self.total_installment_duration,
            remaining_installments: self.remaining_installments,
            total_miscellaneous_price: self.total_miscellaneous_price,
        }
    }

    /// Outstanding balance, ignoring miscellaneous fees.
    pub fn outstanding(&self) -> Money {
        let covered = self.total_paid - self.total_miscellaneous_price;
        let remaining = self.total_price - covered;
        if remaining.is_negative() {
            Money::zero()
        } else {
            remaining
        }
    }
}

/// A product line within a sale.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SaleLineItem {
    pub id: String,
    pub sale_id: String,
    pub product_id: String,
    pub payment_mode: PaymentMode,
    pub quantity: u32,
    pub total_price: Money,
    pub monthly_payment: Money,
    pub installment_starting_price: Money,
    pub installment_duration: u32,
    /// Physical devices handed over for this line.
    pub device_ids: Vec<String>,
}

// =============================================================================
// Device & Token
// =============================================================================

/// A physical unit that can be unlocked with tokens.
///
/// `count` is the protocol counter. Only the token issuance path advances it,
/// one step per issued token.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Device {
    pub id: String,
    pub serial_number: String,
    pub key: String,
    pub starting_code: Option<String>,
    pub time_divider: Option<String>,
    pub restricted_digit_mode: bool,
    pub count: i64,
    pub is_tokenable: bool,
    pub hardware_model: Option<String>,
    pub firmware_version: Option<String>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

/// An issued unlock code. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Token {
    pub id: String,
    pub device_id: String,
    pub value: String,
    /// Validity in days; `-1` unlocks the device permanently.
    pub duration_days: i64,
    /// Payment that paid for this token. `None` for operator-issued tokens.
    pub payment_id: Option<String>,
    #[ts(as = "String")]
    pub issued_at: DateTime<Utc>,
}

/// A token paired with the device details a customer needs to enter it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct DeviceToken {
    pub device_id: String,
    pub serial_number: String,
    pub device_key: String,
    pub token: String,
    pub duration_days: i64,
}

// =============================================================================
// Payment
// =============================================================================

/// One attempt to pay towards a sale.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Payment {
    pub id: String,
    pub sale_id: String,
    pub amount: Money,
    /// Idempotency key; unique across all payments.
    pub transaction_ref: String,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    /// Paying agent for wallet payments.
    pub agent_id: Option<String>,
    pub gateway_order_id: Option<String>,
    pub gateway_order_ref: Option<String>,
    /// Short code the customer sends the payment SMS to.
    pub sms_number: Option<String>,
    pub sms_message: Option<String>,
    /// Months bought, recorded when the payment completes. `-1` = fully paid.
    pub months_covered: Option<i64>,
    /// Set once every tokenable device received its token.
    #[ts(as = "Option<String>")]
    pub tokens_settled_at: Option<DateTime<Utc>>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// A raw gateway or webhook body kept for audit.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PaymentResponse {
    pub id: String,
    pub payment_id: String,
    /// "gateway_status", "webhook", ...
    pub source: String,
    /// JSON text exactly as received.
    pub body: String,
    #[ts(as = "String")]
    pub recorded_at: DateTime<Utc>,
}

// =============================================================================
// Wallet
// =============================================================================

/// Direction of a wallet ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerEntryKind {
    Credit,
    Debit,
}

impl LedgerEntryKind {
    /// Balance after applying `amount` in this direction.
    pub fn apply(&self, balance: Money, amount: Money) -> Money {
        match self {
            LedgerEntryKind::Credit => balance + amount,
            LedgerEntryKind::Debit => balance - amount,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            LedgerEntryKind::Credit => "credit",
            LedgerEntryKind::Debit => "debit",
        }
    }
}

/// Settlement state of wallet transactions and top-ups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

/// An agent's wallet. `balance` is a cache of the ledger fold.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Wallet {
    pub id: String,
    pub agent_id: String,
    pub balance: Money,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

/// Immutable ledger row: `new_balance = previous_balance ± amount`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct WalletTransaction {
    pub id: String,
    pub wallet_id: String,
    pub agent_id: String,
    pub kind: LedgerEntryKind,
    pub amount: Money,
    pub previous_balance: Money,
    pub new_balance: Money,
    /// Idempotency key; unique across all wallet transactions.
    pub reference: String,
    pub description: String,
    pub status: LedgerStatus,
    pub payment_id: Option<String>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

impl WalletTransaction {
    /// Checks the before/after snapshot arithmetic.
    pub fn is_consistent(&self) -> bool {
        self.kind.apply(self.previous_balance, self.amount) == self.new_balance
    }
}

/// A gateway order that credits an agent wallet once settled.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct WalletTopUp {
    pub id: String,
    pub agent_id: String,
    pub amount: Money,
    pub reference: String,
    pub gateway_order_id: Option<String>,
    pub gateway_order_ref: Option<String>,
    pub status: LedgerStatus,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub completed_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Inventory & Customers
// =============================================================================

/// A received lot of stock for one product.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct InventoryBatch {
    pub id: String,
    pub product_id: String,
    pub remaining_quantity: i64,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

/// Stock reserved from a batch at checkout.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SaleBatchAllocation {
    pub id: String,
    pub sale_id: String,
    pub batch_id: String,
    pub quantity: i64,
}

/// Where customer notifications go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CustomerContact {
    pub customer_id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

// =============================================================================
// Unit Tests
// =============================================================================
