use crate::onchain::query::QueryLimits;

use alloy::primitives::Address;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required env var: {0}")]
    MissingEnv(String),
    #[error("invalid account address: {0}")]
    InvalidAccount(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// WebSocket RPC endpoint - overridden by env TOKENWATCH_WS_URL
    #[serde(default)]
    pub ws_url: String,
    /// Monitored account - overridden by env TOKENWATCH_ACCOUNT
    #[serde(default)]
    pub account: String,
    /// How often to re-read the chain id and token registry.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Historical lookback window in blocks.
    #[serde(default = "default_lookback_blocks")]
    pub lookback_blocks: u64,
    /// Max records held in the feed.
    #[serde(default = "default_feed_capacity")]
    pub feed_capacity: usize,
    /// Latest historical matches kept per user-added token.
    #[serde(default = "default_custom_limit")]
    pub custom_token_limit: usize,
    /// Latest historical matches kept for the designated stablecoin.
    #[serde(default = "default_high_volume_limit")]
    pub high_volume_token_limit: usize,
    /// Per-token historical query timeout.
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// JSON file holding the watched tokens.
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,
    /// Always watch the chain's designated USDT contract.
    #[serde(default = "default_true")]
    pub include_designated: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Webhook for alerts - overridden by env TOKENWATCH_WEBHOOK_URL.
    /// Empty means alerts go to the log only.
    #[serde(default)]
    pub webhook_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DashboardConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_dashboard_bind")]
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_poll_interval() -> u64 {
    15
}
fn default_lookback_blocks() -> u64 {
    1000
}
fn default_feed_capacity() -> usize {
    50
}
fn default_custom_limit() -> usize {
    5
}
fn default_high_volume_limit() -> usize {
    10
}
fn default_query_timeout() -> u64 {
    20
}
fn default_registry_path() -> PathBuf {
    PathBuf::from("tokens.json")
}
fn default_true() -> bool {
    true
}
fn default_dashboard_bind() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            ws_url: String::new(),
            account: String::new(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            lookback_blocks: default_lookback_blocks(),
            feed_capacity: default_feed_capacity(),
            custom_token_limit: default_custom_limit(),
            high_volume_token_limit: default_high_volume_limit(),
            query_timeout_secs: default_query_timeout(),
        }
    }
}

impl MonitorConfig {
    pub fn query_limits(&self) -> QueryLimits {
        QueryLimits {
            lookback_blocks: self.lookback_blocks,
            custom_token_limit: self.custom_token_limit,
            high_volume_token_limit: self.high_volume_token_limit,
            timeout: Duration::from_secs(self.query_timeout_secs),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
            include_designated: true,
        }
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_dashboard_bind(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.apply_env();
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Defaults plus environment (no file needed).
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("TOKENWATCH_WS_URL") {
            self.chain.ws_url = url;
        }
        if let Ok(account) = std::env::var("TOKENWATCH_ACCOUNT") {
            self.chain.account = account;
        }
        if let Ok(hook) = std::env::var("TOKENWATCH_WEBHOOK_URL") {
            self.notifications.webhook_url = hook;
        }
    }

    pub fn ws_url(&self) -> Result<&str, ConfigError> {
        if self.chain.ws_url.is_empty() {
            return Err(ConfigError::MissingEnv("TOKENWATCH_WS_URL".to_string()));
        }
        Ok(&self.chain.ws_url)
    }

    /// The configured account, if any. An unparseable value is an error.
    pub fn account(&self) -> Result<Option<Address>, ConfigError> {
        let raw = self.chain.account.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        Address::from_str(raw)
            .map(Some)
            .map_err(|_| ConfigError::InvalidAccount(raw.to_string()))
    }
}
