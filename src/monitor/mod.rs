//! Transfer monitor: session model, published view, and the controller task.
//!
//! The session provider pushes `Session`s into a `MonitorHandle`; the
//! controller reconciles subscriptions and history against each one and
//! publishes a `MonitorView` through a watch channel after every change.

mod controller;

pub use controller::MonitorController;

use crate::onchain::types::{TransferRecord, WatchedToken};
use crate::onchain::LedgerError;

use alloy::primitives::Address;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Shown when the historical sync cannot read the chain head.
pub const HISTORY_ERROR: &str = "Failed to fetch transaction history";
/// Shown when a live subscription cannot be opened.
pub const SUBSCRIBE_ERROR: &str = "Failed to start transaction monitoring";
/// Shown when the node closes a live subscription.
pub const STREAM_ENDED_ERROR: &str = "Live transaction monitoring interrupted";

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("monitoring not configured: {0}")]
    Configuration(&'static str),
    #[error("historical sync failed: {0}")]
    Query(#[source] LedgerError),
    #[error("failed to open live subscription for {symbol}: {source}")]
    Subscription {
        symbol: String,
        #[source]
        source: LedgerError,
    },
    #[error("monitor task has stopped")]
    Closed,
}

/// What the account/session provider currently reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub account: Option<Address>,
    pub chain_id: Option<u64>,
    pub connected: bool,
    /// Active tokens for `chain_id`.
    pub tokens: Vec<WatchedToken>,
}

impl Session {
    pub fn connected(account: Address, chain_id: u64, tokens: Vec<WatchedToken>) -> Self {
        Self {
            account: Some(account),
            chain_id: Some(chain_id),
            connected: true,
            tokens,
        }
    }

    pub fn disconnected() -> Self {
        Self::default()
    }

    /// `(account, chain)` when both are known and the session is connected.
    pub fn identity(&self) -> Option<(Address, u64)> {
        if !self.connected {
            return None;
        }
        Some((self.account?, self.chain_id?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    Idle,
    Syncing,
    Live,
    Degraded,
}

impl std::fmt::Display for MonitorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorState::Idle => write!(f, "idle"),
            MonitorState::Syncing => write!(f, "syncing"),
            MonitorState::Live => write!(f, "live"),
            MonitorState::Degraded => write!(f, "degraded"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum MonitorCommand {
    Session(Session),
    Refresh,
    Shutdown,
}

/// Read-only snapshot published after every controller mutation.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorView {
    pub state: MonitorState,
    pub is_listening: bool,
    pub last_error: Option<String>,
    pub account: Option<Address>,
    pub chain_id: Option<u64>,
    pub monitored_tokens: usize,
    pub open_subscriptions: usize,
    pub feed: Vec<TransferRecord>,
}

impl Default for MonitorView {
    fn default() -> Self {
        Self {
            state: MonitorState::Idle,
            is_listening: false,
            last_error: None,
            account: None,
            chain_id: None,
            monitored_tokens: 0,
            open_subscriptions: 0,
            feed: Vec::new(),
        }
    }
}

/// Cloneable front end to a running controller.
#[derive(Clone)]
pub struct MonitorHandle {
    commands: mpsc::UnboundedSender<MonitorCommand>,
    view: watch::Receiver<MonitorView>,
}

impl MonitorHandle {
    pub fn update_session(&self, session: Session) -> Result<(), MonitorError> {
        self.send(MonitorCommand::Session(session))
    }

    pub fn refresh(&self) -> Result<(), MonitorError> {
        self.send(MonitorCommand::Refresh)
    }

    pub fn shutdown(&self) -> Result<(), MonitorError> {
        self.send(MonitorCommand::Shutdown)
    }

    /// Latest published view.
    pub fn view(&self) -> MonitorView {
        self.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<MonitorView> {
        self.view.clone()
    }

    fn send(&self, command: MonitorCommand) -> Result<(), MonitorError> {
        self.commands.send(command).map_err(|_| MonitorError::Closed)
    }
}
