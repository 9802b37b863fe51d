//! Runtime configuration.
//!
//! Values come from an optional JSON file (`ORDER_SYNC_CONFIG`, default
//! `order-sync.json`) and are then overridden by environment variables. A
//! missing file is not an error; every setting has a default.

use serde::{Deserialize, Serialize};
use std::env;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Error, Result};

const CONFIG_PATH_ENV: &str = "ORDER_SYNC_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "order-sync.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub api: ApiConfig,
    pub channel: ChannelConfig,
    pub cache: CacheConfig,
    pub checkout: CheckoutConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub request_timeout_ms: u64,
    pub connectivity_timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            auth_token: None,
            request_timeout_ms: 30_000,
            connectivity_timeout_ms: 10_000,
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connectivity_timeout(&self) -> Duration {
        Duration::from_millis(self.connectivity_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelConfig {
    pub admin_room: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff_ms: u64,
    pub default_alert_duration_ms: u64,
    pub max_alert_duration_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            admin_room: "admin".to_string(),
            max_reconnect_attempts: 5,
            reconnect_backoff_ms: 2_000,
            default_alert_duration_ms: 5_000,
            max_alert_duration_ms: 10_000,
        }
    }
}

impl ChannelConfig {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// Delay between a mutation settling and the reconciling refetch.
    pub staleness_window_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            staleness_window_ms: 1_000,
        }
    }
}

impl CacheConfig {
    pub fn staleness_window(&self) -> Duration {
        Duration::from_millis(self.staleness_window_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckoutConfig {
    /// Candidate query parameter names for the order id on the gateway
    /// return redirect, highest priority first.
    pub gateway_return_params: Vec<String>,
    /// Hosts the checkout may redirect the browser to.
    pub allowed_gateway_hosts: Vec<String>,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            gateway_return_params: ["orderId", "order_id", "extraData", "requestId"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            allowed_gateway_hosts: ["momo.vn", "test-payment.momo.vn", "payment.momo.vn"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    /// Directory for rolling log files; console only when unset.
    pub directory: Option<PathBuf>,
    pub filter: String,
    pub max_log_files: usize,
    /// Write the rolling file as JSON lines instead of text.
    pub json_files: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            filter: "info,order_sync_core=debug".to_string(),
            max_log_files: 10,
            json_files: false,
        }
    }
}

impl Config {
    /// Load from the configured file, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        let mut config = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<Config>(&raw)
                .map_err(|e| Error::Config(format!("Failed to parse {path}: {e}")))?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path, "No config file, using defaults");
                Config::default()
            }
            Err(e) => return Err(Error::Config(format!("Cannot read {path}: {e}"))),
        };

        config.apply_env_overrides();
        info!(
            base_url = %config.api.base_url,
            admin_room = %config.channel.admin_room,
            "Configuration loaded"
        );
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
            env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
        }

        if let Ok(v) = env::var("ORDER_API_BASE_URL") {
            self.api.base_url = v;
        }
        if let Ok(v) = env::var("ORDER_API_TOKEN") {
            self.api.auth_token = Some(v).filter(|t| !t.trim().is_empty());
        }
        if let Ok(v) = env::var("ORDER_ADMIN_ROOM") {
            self.channel.admin_room = v;
        }
        if let Some(v) = parse_env("ORDER_STALENESS_WINDOW_MS") {
            self.cache.staleness_window_ms = v;
        }
        if let Some(v) = parse_env("ORDER_MAX_RECONNECT_ATTEMPTS") {
            self.channel.max_reconnect_attempts = v;
        }
        if let Some(v) = parse_env("ORDER_RECONNECT_BACKOFF_MS") {
            self.channel.reconnect_backoff_ms = v;
        }
        if let Ok(v) = env::var("ORDER_LOG_DIR") {
            self.logging.directory = Some(PathBuf::from(v));
        }
    }
}
