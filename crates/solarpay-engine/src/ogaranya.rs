//! # Ogaranya Gateway Client
//!
//! HTTP client for the Ogaranya merchant API.
//!
//! ## Endpoints
//! ```text
//! POST {base}/{merchant}/pay/NG                          create order
//! GET  {base}/{merchant}/payment/{order_ref}/status/NG   order status
//! ```
//!
//! ## Request Signing
//! Every request carries two headers:
//! - `Token`: the merchant token
//! - `Public_key`: `hex(sha512(token || private_key))`
//!
//! ## Envelope
//! ```json
//! { "status": "success", "message": "...", "data": { ... } }
//! ```
//! Anything other than `"success"` at the top level is a rejection, whatever
//! the HTTP status said.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha512};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::GatewaySettings;
use crate::error::{EngineError, EngineResult};
use crate::gateway::{GatewayStatus, OrderHandle, OrderStatus, PaymentGateway};
use solarpay_core::Money;

/// Ogaranya merchant API client.
#[derive(Clone)]
pub struct OgaranyaGateway {
    client: reqwest::Client,
    base_url: String,
    merchant_id: String,
    token: String,
    public_key: String,
    timeout_secs: u64,
}

impl std::fmt::Debug for OgaranyaGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OgaranyaGateway")
            .field("base_url", &self.base_url)
            .field("merchant_id", &self.merchant_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Value,
}

impl OgaranyaGateway {
    /// Creates a client from merchant settings.
    pub fn new(settings: &GatewaySettings) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| EngineError::InvalidConfig(format!("Failed to build HTTP client: {}", e)))?;

        Ok(OgaranyaGateway {
            client,
            base_url: settings.base_url.clone(),
            merchant_id: settings.merchant_id.clone(),
            token: settings.token.clone(),
            public_key: public_key(&settings.token, &settings.private_key),
            timeout_secs: settings.timeout_secs,
        })
    }

    /// Build the full URL for a merchant endpoint.
    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.merchant_id,
            path.trim_start_matches('/')
        )
    }

    fn signed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("Content-Type", "application/json")
            .header("Token", &self.token)
            .header("Public_key", &self.public_key)
    }

    /// Sends a request and unwraps the `{status, data}` envelope.
    async fn send(&self, request: reqwest::RequestBuilder) -> EngineResult<Envelope> {
        let response = self
            .signed(request)
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e))?;

        let status = response.status();

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(self.map_status_error(status.as_u16(), &error_text));
        }

        let envelope = response
            .json::<Envelope>()
            .await
            .map_err(|e| EngineError::InvalidResponse(format!("Failed to parse Ogaranya response: {}", e)))?;

        if !envelope.status.eq_ignore_ascii_case("success") {
            return Err(EngineError::GatewayRejected {
                status: status.as_u16(),
                message: envelope.message.unwrap_or(envelope.status),
            });
        }

        Ok(envelope)
    }

    /// Map HTTP status codes to EngineError.
    fn map_status_error(&self, status: u16, error_text: &str) -> EngineError {
        match status {
            500..=599 => EngineError::Gateway(format!("Ogaranya server error ({}): {}", status, error_text)),
            _ => EngineError::GatewayRejected {
                status,
                message: error_text.to_string(),
            },
        }
    }

    /// Map reqwest errors to EngineError.
    fn map_reqwest_error(&self, e: reqwest::Error) -> EngineError {
        if e.is_timeout() {
            EngineError::GatewayTimeout(self.timeout_secs)
        } else if e.is_connect() {
            EngineError::Gateway(format!("Failed to connect to {}: {}", self.base_url, e))
        } else {
            EngineError::Gateway(format!("Ogaranya request failed: {}", e))
        }
    }
}

#[async_trait]
impl PaymentGateway for OgaranyaGateway {
    async fn create_order(
        &self,
        amount: Money,
        phone: &str,
        description: &str,
        reference: &str,
    ) -> EngineResult<OrderHandle> {
        let body = serde_json::json!({
            "amount": format_amount(amount),
            "msisdn": phone,
            "desc": description,
            "reference": reference,
        });

        debug!(reference = %reference, amount = %amount, "Creating Ogaranya order");
        let envelope = self.send(self.client.post(self.url("pay/NG")).json(&body)).await?;
        let handle = parse_order(&envelope.data)?;

        info!(
            reference = %reference,
            order_id = %handle.order_id,
            order_reference = %handle.order_reference,
            "Ogaranya order created"
        );
        Ok(handle)
    }

    async fn check_status(&self, order_reference: &str) -> EngineResult<GatewayStatus> {
        let path = format!("payment/{}/status/NG", order_reference);
        let envelope = self.send(self.client.get(self.url(&path))).await?;

        let status = envelope
            .data
            .get("status")
            .and_then(Value::as_str)
            .map(OrderStatus::parse)
            .ok_or_else(|| EngineError::InvalidResponse("status response has no data.status".into()))?;

        debug!(order_reference = %order_reference, %status, "Ogaranya order status");

        let raw = serde_json::json!({
            "status": envelope.status,
            "message": envelope.message,
            "data": envelope.data,
        });
        Ok(GatewayStatus { status, raw })
    }
}

// =============================================================================
// Wire Helpers
// =============================================================================

/// `hex(sha512(token || private_key))`.
pub fn public_key(token: &str, private_key: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(token.as_bytes());
    hasher.update(private_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Amount in naira with two decimals, as the order endpoint expects.
pub fn format_amount(amount: Money) -> String {
    let sign = if amount.is_negative() { "-" } else { "" };
    format!("{}{}.{:02}", sign, amount.major().abs(), amount.minor_part())
}

fn parse_order(data: &Value) -> EngineResult<OrderHandle> {
    let order_id = string_field(data, "order_id")
        .ok_or_else(|| EngineError::InvalidResponse("order response has no data.order_id".into()))?;
    let order_reference = string_field(data, "order_reference")
        .ok_or_else(|| EngineError::InvalidResponse("order response has no data.order_reference".into()))?;

    Ok(OrderHandle {
        order_id,
        order_reference,
        sms_number: string_field(data, "msisdn_to_send_to"),
        message: string_field(data, "message"),
    })
}

/// Reads a field that the gateway sends either as a string or a number.
fn string_field(data: &Value, key: &str) -> Option<String> {
    match data.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
