//! # Payment Gateway Seam
//!
//! The engine only knows the gateway through [`PaymentGateway`]. Payloads are
//! validated into typed values at this boundary; the raw JSON travels along
//! solely for the payment audit trail.
//!
//! ```text
//! ┌────────────────────┐  create_order   ┌──────────────────────────┐
//! │ ReconciliationEngine│ ─────────────► │ PaymentGateway            │
//! │ WalletLedger        │  check_status  │  OgaranyaGateway (HTTP)   │
//! │                     │ ◄───────────── │  scripted fakes in tests  │
//! └────────────────────┘  GatewayStatus  └──────────────────────────┘
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use solarpay_core::Money;

// =============================================================================
// Gateway Types
// =============================================================================

/// Settlement state reported by the gateway for one order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Successful,
    Pending,
    Failed,
}

impl OrderStatus {
    /// Maps a gateway status string. Unknown strings are treated as pending
    /// so they are polled again rather than acted on.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "SUCCESSFUL" | "SUCCESS" | "COMPLETED" | "PAID" => OrderStatus::Successful,
            "FAILED" | "FAILURE" | "DECLINED" | "CANCELLED" | "EXPIRED" => OrderStatus::Failed,
            _ => OrderStatus::Pending,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatus::Successful => write!(f, "SUCCESSFUL"),
            OrderStatus::Pending => write!(f, "PENDING"),
            OrderStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// A gateway order created for a payment or a wallet top-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderHandle {
    pub order_id: String,
    /// Reference used for status checks.
    pub order_reference: String,
    /// Short code the payer dials or texts, when the channel has one.
    pub sms_number: Option<String>,
    /// Payment instructions for the payer.
    pub message: Option<String>,
}

/// Result of a status check.
#[derive(Debug, Clone)]
pub struct GatewayStatus {
    pub status: OrderStatus,
    pub raw: Value,
}

// =============================================================================
// Gateway Trait
// =============================================================================

/// External payment gateway.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Opens an order for `amount` against the payer's phone number.
    async fn create_order(
        &self,
        amount: Money,
        phone: &str,
        description: &str,
        reference: &str,
    ) -> EngineResult<OrderHandle>;

    /// Current settlement state of an order.
    async fn check_status(&self, order_reference: &str) -> EngineResult<GatewayStatus>;
}

// =============================================================================
// Webhook Intake
// =============================================================================

/// A payment notification pushed by the gateway.
///
/// ```json
/// { "data": { "tx_ref": "SP-...", "status": "successful" } }
/// ```
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub transaction_ref: String,
    pub reported_status: OrderStatus,
    pub raw: Value,
}

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    data: WebhookData,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    tx_ref: String,
    #[serde(default)]
    status: Option<String>,
}

impl WebhookEvent {
    /// Validates a raw webhook body.
    ///
    /// ## Errors
    /// `InvalidResponse` if the body has no `data.tx_ref`.
    pub fn parse(raw: Value) -> EngineResult<Self> {
        let envelope: WebhookEnvelope = serde_json::from_value(raw.clone())
            .map_err(|e| EngineError::InvalidResponse(format!("webhook payload: {e}")))?;

        if envelope.data.tx_ref.trim().is_empty() {
            return Err(EngineError::InvalidResponse("webhook payload: empty tx_ref".into()));
        }

        Ok(WebhookEvent {
            transaction_ref: envelope.data.tx_ref,
            reported_status: envelope
                .data
                .status
                .as_deref()
                .map(OrderStatus::parse)
                .unwrap_or(OrderStatus::Pending),
            raw,
        })
    }
}
