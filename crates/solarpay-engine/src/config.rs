//! # Engine Configuration
//!
//! Configuration management for the reconciler.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     SOLARPAY_GATEWAY_TOKEN=...                                         │
//! │     SOLARPAY_UNPAID_TIMEOUT_SECS=21600                                 │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/reconciler/reconciler.toml (Linux)                       │
//! │     ~/Library/Application Support/com.solarpay.reconciler/ (macOS)     │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [database]
//! path = "/var/lib/solarpay/solarpay.db"
//!
//! [gateway]
//! base_url = "https://api.ogaranya.com/v1"
//! merchant_id = "1234"
//! token = "..."
//! private_key = "..."
//!
//! [token_service]
//! url = "http://127.0.0.1:7070/tokens"
//!
//! [sweeper]
//! interval_secs = 21600
//! unpaid_timeout_secs = 21600
//!
//! [poller]
//! interval_secs = 300
//! ```

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};

// =============================================================================
// Database Settings
// =============================================================================

/// Where the reconciler keeps its SQLite database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a writer waits on a locked database (seconds).
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_secs: u64,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./solarpay.db")
}

fn default_max_connections() -> u32 {
    5
}

fn default_busy_timeout() -> u64 {
    30
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_database_path(),
            max_connections: default_max_connections(),
            busy_timeout_secs: default_busy_timeout(),
        }
    }
}

impl DatabaseSettings {
    /// Pool configuration for these settings.
    pub fn db_config(&self) -> solarpay_db::DbConfig {
        solarpay_db::DbConfig::new(&self.path)
            .max_connections(self.max_connections)
            .busy_timeout(Duration::from_secs(self.busy_timeout_secs))
    }
}

// =============================================================================
// Gateway Settings
// =============================================================================

/// Ogaranya merchant credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_gateway_url")]
    pub base_url: String,

    #[serde(default)]
    pub merchant_id: String,

    #[serde(default)]
    pub token: String,

    #[serde(default)]
    pub private_key: String,

    /// Per-request timeout (seconds).
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

fn default_gateway_url() -> String {
    "https://api.ogaranya.com/v1".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for GatewaySettings {
    fn default() -> Self {
        GatewaySettings {
            base_url: default_gateway_url(),
            merchant_id: String::new(),
            token: String::new(),
            private_key: String::new(),
            timeout_secs: default_request_timeout(),
        }
    }
}

// =============================================================================
// Token Service Settings
// =============================================================================

/// Endpoint of the service that encodes device tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenServiceSettings {
    #[serde(default = "default_token_service_url")]
    pub url: String,

    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

fn default_token_service_url() -> String {
    "http://127.0.0.1:7070/tokens".to_string()
}

impl Default for TokenServiceSettings {
    fn default() -> Self {
        TokenServiceSettings {
            url: default_token_service_url(),
            timeout_secs: default_request_timeout(),
        }
    }
}

// =============================================================================
// Retry Settings
// =============================================================================

/// Bounded exponential backoff for gateway and token calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    5_000
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

// =============================================================================
// Scheduler Settings
// =============================================================================

/// Stale-sale sweeper schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperSettings {
    #[serde(default = "default_six_hours")]
    pub interval_secs: u64,

    /// Age after which an UNPAID sale is cancelled.
    #[serde(default = "default_six_hours")]
    pub unpaid_timeout_secs: u64,

    /// Sales cancelled per pass.
    #[serde(default = "default_sweep_limit")]
    pub batch_limit: u32,
}

fn default_six_hours() -> u64 {
    6 * 60 * 60
}

fn default_sweep_limit() -> u32 {
    500
}

impl Default for SweeperSettings {
    fn default() -> Self {
        SweeperSettings {
            interval_secs: default_six_hours(),
            unpaid_timeout_secs: default_six_hours(),
            batch_limit: default_sweep_limit(),
        }
    }
}

/// Upper bound for every scheduler window and interval (ten years).
pub const MAX_WINDOW_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// `secs` as a signed duration, or a config error naming `field`.
pub(crate) fn window(field: &str, secs: u64) -> EngineResult<TimeDelta> {
    i64::try_from(secs)
        .ok()
        .filter(|_| secs <= MAX_WINDOW_SECS)
        .and_then(TimeDelta::try_seconds)
        .ok_or_else(|| EngineError::InvalidConfig(format!("{} is out of range: {}", field, secs)))
}

/// `now - secs`, or a config error naming `field` when it does not fit.
pub(crate) fn window_start(now: DateTime<Utc>, field: &str, secs: u64) -> EngineResult<DateTime<Utc>> {
    let span = window(field, secs)?;
    now.checked_sub_signed(span)
        .ok_or_else(|| EngineError::InvalidConfig(format!("{} reaches before the calendar: {}", field, secs)))
}

/// Pending-payment poller schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerSettings {
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,

    /// Only payments created within this window are polled.
    #[serde(default = "default_lookback")]
    pub lookback_secs: u64,

    #[serde(default = "default_poll_batch")]
    pub batch_size: u32,

    /// Pause between two gateway checks (milliseconds).
    #[serde(default = "default_spacing")]
    pub spacing_ms: u64,
}

fn default_poll_interval() -> u64 {
    5 * 60
}

fn default_lookback() -> u64 {
    24 * 60 * 60
}

fn default_poll_batch() -> u32 {
    50
}

fn default_spacing() -> u64 {
    1_000
}

impl Default for PollerSettings {
    fn default() -> Self {
        PollerSettings {
            interval_secs: default_poll_interval(),
            lookback_secs: default_lookback(),
            batch_size: default_poll_batch(),
            spacing_ms: default_spacing(),
        }
    }
}

/// Token issuance concurrency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSettings {
    /// Devices issued in parallel for one payment.
    #[serde(default = "default_parallel_devices")]
    pub max_parallel_devices: usize,
}

fn default_parallel_devices() -> usize {
    4
}

impl Default for TokenSettings {
    fn default() -> Self {
        TokenSettings {
            max_parallel_devices: default_parallel_devices(),
        }
    }
}

// =============================================================================
// Main Engine Configuration
// =============================================================================

/// Complete reconciler configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub gateway: GatewaySettings,

    #[serde(default)]
    pub token_service: TokenServiceSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub sweeper: SweeperSettings,

    #[serde(default)]
    pub poller: PollerSettings,

    #[serde(default)]
    pub tokens: TokenSettings,
}

impl EngineConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (reconciler.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> EngineResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading reconciler config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load reconciler config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> EngineResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| EngineError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Reconciler config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> EngineResult<()> {
        if !self.gateway.base_url.starts_with("http://") && !self.gateway.base_url.starts_with("https://") {
            return Err(EngineError::InvalidConfig(format!(
                "gateway.base_url must start with http:// or https://, got: {}",
                self.gateway.base_url
            )));
        }

        if !self.token_service.url.starts_with("http://") && !self.token_service.url.starts_with("https://") {
            return Err(EngineError::InvalidConfig(format!(
                "token_service.url must start with http:// or https://, got: {}",
                self.token_service.url
            )));
        }

        if self.retry.max_attempts == 0 {
            return Err(EngineError::InvalidConfig("retry.max_attempts must be at least 1".into()));
        }

        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(EngineError::InvalidConfig(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms".into(),
            ));
        }

        if self.sweeper.interval_secs == 0 || self.poller.interval_secs == 0 {
            return Err(EngineError::InvalidConfig("scheduler intervals must be greater than 0".into()));
        }

        for (field, secs) in [
            ("sweeper.interval_secs", self.sweeper.interval_secs),
            ("sweeper.unpaid_timeout_secs", self.sweeper.unpaid_timeout_secs),
            ("poller.interval_secs", self.poller.interval_secs),
            ("poller.lookback_secs", self.poller.lookback_secs),
        ] {
            if secs > MAX_WINDOW_SECS {
                return Err(EngineError::InvalidConfig(format!(
                    "{} must not exceed {} seconds, got: {}",
                    field, MAX_WINDOW_SECS, secs
                )));
            }
        }

        if self.sweeper.batch_limit == 0 || self.poller.batch_size == 0 {
            return Err(EngineError::InvalidConfig("batch sizes must be greater than 0".into()));
        }

        if self.tokens.max_parallel_devices == 0 {
            return Err(EngineError::InvalidConfig(
                "tokens.max_parallel_devices must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Returns true when merchant credentials are present.
    pub fn has_gateway_credentials(&self) -> bool {
        !self.gateway.merchant_id.is_empty() && !self.gateway.token.is_empty() && !self.gateway.private_key.is_empty()
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("SOLARPAY_DATABASE_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = PathBuf::from(path);
        }

        if let Ok(url) = std::env::var("SOLARPAY_GATEWAY_BASE_URL") {
            debug!(url = %url, "Overriding gateway URL from environment");
            self.gateway.base_url = url;
        }

        if let Ok(id) = std::env::var("SOLARPAY_GATEWAY_MERCHANT_ID") {
            self.gateway.merchant_id = id;
        }

        if let Ok(token) = std::env::var("SOLARPAY_GATEWAY_TOKEN") {
            self.gateway.token = token;
        }

        if let Ok(key) = std::env::var("SOLARPAY_GATEWAY_PRIVATE_KEY") {
            self.gateway.private_key = key;
        }

        if let Ok(url) = std::env::var("SOLARPAY_TOKEN_SERVICE_URL") {
            debug!(url = %url, "Overriding token service URL from environment");
            self.token_service.url = url;
        }

        if let Some(secs) = env_u64("SOLARPAY_SWEEP_INTERVAL_SECS") {
            self.sweeper.interval_secs = secs;
        }

        if let Some(secs) = env_u64("SOLARPAY_UNPAID_TIMEOUT_SECS") {
            self.sweeper.unpaid_timeout_secs = secs;
        }

        if let Some(secs) = env_u64("SOLARPAY_POLL_INTERVAL_SECS") {
            self.poller.interval_secs = secs;
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "solarpay", "reconciler")
            .map(|dirs| dirs.config_dir().join("reconciler.toml"))
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = name, value = %raw, "Ignoring non-numeric environment override");
            None
        }
    }
}
