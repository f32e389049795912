//! On-chain access for ERC-20 transfer monitoring.
//!
//! - `ledger`: the `Ledger`/`TokenInspector` traits and the alloy WebSocket
//!   implementation
//! - `query`: bounded historical transfer lookups with per-token isolation
//! - `abi`: Transfer topic and hand decoding of logs
//! - `types`: watched tokens and transfer records

pub mod abi;
pub mod ledger;
pub mod query;
pub mod types;

#[cfg(test)]
pub(crate) mod mock;

pub use ledger::{AlloyLedger, Ledger, TokenInspector, TransferStream};
pub use query::{HistoricalBatch, TokenFailure, TransferQuery};
pub use types::{TokenClass, TokenKey, TransferRecord, WatchedToken};

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("rpc transport error: {0}")]
    Transport(#[from] alloy::transports::TransportError),
    #[error("contract call failed: {0}")]
    Contract(#[from] alloy::contract::Error),
    #[error("block {0} not found")]
    BlockNotFound(u64),
    #[error("invalid block range {from}..{to}")]
    InvalidRange { from: u64, to: u64 },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Rpc(String),
}
