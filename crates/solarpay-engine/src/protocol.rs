//! # Token Protocol Seam
//!
//! Token encoding is owned by an external service. The engine hands it a
//! device's key material, a duration and the device's current counter, and
//! gets back an opaque code plus the counter value the device will hold once
//! the code is entered.
//!
//! ```text
//! (device, duration_days, count) ──► TokenProtocol ──► (token, new_count)
//!                                                        new_count > count
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::TokenServiceSettings;
use crate::error::{EngineError, EngineResult};
use solarpay_core::Device;

/// One code produced by the token service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCode {
    pub token: String,
    pub new_count: i64,
}

/// External token-generation protocol.
#[async_trait]
pub trait TokenProtocol: Send + Sync {
    /// Encodes a token of `duration_days` (-1 = forever) for `device`,
    /// starting from `counter`.
    async fn generate_token(&self, device: &Device, duration_days: i64, counter: i64) -> EngineResult<IssuedCode>;
}

// =============================================================================
// HTTP Token Service
// =============================================================================

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    key: &'a str,
    starting_code: Option<&'a str>,
    time_divider: Option<&'a str>,
    restricted_digit_mode: bool,
    duration_days: i64,
    count: i64,
}

/// Token service reached over HTTP.
///
/// ```json
/// POST {url}
/// { "key": "...", "starting_code": "...", "time_divider": "1",
///   "restricted_digit_mode": false, "duration_days": 30, "count": 4 }
///
/// 200 { "token": "123 456 789", "new_count": 5 }
/// ```
#[derive(Debug, Clone)]
pub struct HttpTokenProtocol {
    client: reqwest::Client,
    url: String,
}

impl HttpTokenProtocol {
    pub fn new(settings: &TokenServiceSettings) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| EngineError::InvalidConfig(format!("Failed to build HTTP client: {}", e)))?;

        Ok(HttpTokenProtocol {
            client,
            url: settings.url.clone(),
        })
    }
}

#[async_trait]
impl TokenProtocol for HttpTokenProtocol {
    async fn generate_token(&self, device: &Device, duration_days: i64, counter: i64) -> EngineResult<IssuedCode> {
        let failed = |message: String| EngineError::TokenProtocol {
            device_id: device.id.clone(),
            message,
        };

        let request = GenerateRequest {
            key: &device.key,
            starting_code: device.starting_code.as_deref(),
            time_divider: device.time_divider.as_deref(),
            restricted_digit_mode: device.restricted_digit_mode,
            duration_days,
            count: counter,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(failed(format!("token service returned {}: {}", status.as_u16(), error_text)));
        }

        let code: IssuedCode = response
            .json()
            .await
            .map_err(|e| failed(format!("unreadable token response: {}", e)))?;

        if code.new_count <= counter {
            return Err(EngineError::InvalidResponse(format!(
                "token service did not advance counter for device {}: {} -> {}",
                device.id, counter, code.new_count
            )));
        }

        debug!(device_id = %device.id, counter, new_count = code.new_count, "Token encoded");
        Ok(code)
    }
}
