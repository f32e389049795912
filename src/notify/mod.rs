//! User alerts for newly received transfers.
//!
//! The monitor only talks to `NotificationSink`: it asks for permission once
//! when it starts listening and dispatches one alert per new live transfer.

use crate::onchain::types::{TransferRecord, WatchedToken};

use alloy::primitives::utils::format_units;
use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook returned status {0}")]
    Status(reqwest::StatusCode),
}

/// Permission state of a notification sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Not asked yet.
    Default,
    Granted,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
}

impl Notification {
    /// "USDT Received!" / "Received 12.50 USDT from 0x1234...abcd"
    pub fn for_transfer(record: &TransferRecord, token: &WatchedToken) -> Self {
        Self {
            title: format!("{} Received!", token.symbol),
            body: format!(
                "Received {} {} from {}",
                format_token_amount(record.raw_amount, token.decimals),
                token.symbol,
                short_address(&record.from_address)
            ),
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn permission(&self) -> Permission;

    async fn request_permission(&self) -> Permission;

    async fn dispatch(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes alerts to the log. Always permitted.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn permission(&self) -> Permission {
        Permission::Granted
    }

    async fn request_permission(&self) -> Permission {
        Permission::Granted
    }

    async fn dispatch(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(title = %notification.title, body = %notification.body, "notification");
        Ok(())
    }
}

/// POSTs alerts as JSON to a webhook.
///
/// Permission starts at `Default` and is granted on request when the sink is
/// enabled with a non-empty URL.
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
    enabled: bool,
    permission: Mutex<Permission>,
}

impl WebhookNotifier {
    pub fn new(url: String, enabled: bool) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            url,
            enabled,
            permission: Mutex::new(Permission::Default),
        })
    }

    fn current(&self) -> Permission {
        self.permission
            .lock()
            .map(|p| *p)
            .unwrap_or(Permission::Denied)
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn permission(&self) -> Permission {
        self.current()
    }

    async fn request_permission(&self) -> Permission {
        let granted = if self.enabled && !self.url.is_empty() {
            Permission::Granted
        } else {
            Permission::Denied
        };
        if let Ok(mut p) = self.permission.lock() {
            *p = granted;
        }
        info!(permission = ?granted, "webhook notification permission");
        granted
    }

    async fn dispatch(&self, notification: &Notification) -> Result<(), NotifyError> {
        let resp = self.http.post(&self.url).json(notification).send().await?;
        if !resp.status().is_success() {
            warn!(status = %resp.status(), "webhook rejected notification");
            return Err(NotifyError::Status(resp.status()));
        }
        Ok(())
    }
}

/// Human-readable amount with K/M abbreviation.
///
/// The raw integer is scaled exactly; floating point is only used for the
/// final rounding.
pub fn format_token_amount(raw: U256, decimals: u8) -> String {
    let scaled = match format_units(raw, decimals) {
        Ok(s) => s,
        Err(_) => return raw.to_string(),
    };
    let num: f64 = scaled.parse().unwrap_or(0.0);
    if num >= 1_000_000.0 {
        format!("{:.2}M", num / 1_000_000.0)
    } else if num >= 1_000.0 {
        format!("{:.2}K", num / 1_000.0)
    } else {
        format!("{num:.4}")
    }
}

/// `0x1234...abcd`
pub fn short_address(address: &Address) -> String {
    let full = address.to_checksum(None);
    format!("{}...{}", &full[..6], &full[full.len() - 4..])
}

/// Sink that records dispatches, for tests.
#[cfg(test)]
pub(crate) struct RecordingNotifier {
    pub permission: Mutex<Permission>,
    /// Whether a request moves `Default` to `Granted`; false models a dismissed prompt.
    pub grant_on_request: bool,
    pub requests: Mutex<usize>,
    pub sent: Mutex<Vec<Notification>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub(crate) fn new(permission: Permission) -> Self {
        Self {
            permission: Mutex::new(permission),
            grant_on_request: true,
            requests: Mutex::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn dismissing() -> Self {
        Self {
            grant_on_request: false,
            ..Self::new(Permission::Default)
        }
    }

    pub(crate) fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn requests(&self) -> usize {
        *self.requests.lock().unwrap()
    }
}

#[cfg(test)]
#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn permission(&self) -> Permission {
        *self.permission.lock().unwrap()
    }

    async fn request_permission(&self) -> Permission {
        *self.requests.lock().unwrap() += 1;
        let mut p = self.permission.lock().unwrap();
        if *p == Permission::Default && self.grant_on_request {
            *p = Permission::Granted;
        }
        *p
    }

    async fn dispatch(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}
