//! Token and transfer types shared by the query, subscription and store paths.

use alloy::primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize, Serializer};

/// Sentinel contract address used for a chain's native asset stream.
pub const NATIVE_ASSET: Address = Address::ZERO;

/// How heavily a watched token is expected to trade.
///
/// Drives the per-token historical lookback limit: the designated
/// stablecoin for each chain sees far more traffic than a user-added token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenClass {
    #[default]
    Custom,
    HighVolume,
}

impl std::fmt::Display for TokenClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenClass::Custom => write!(f, "custom"),
            TokenClass::HighVolume => write!(f, "high_volume"),
        }
    }
}

/// A token contract the account has configured for monitoring.
/// Identity is `(contract_address, chain_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedToken {
    pub contract_address: Address,
    pub chain_id: u64,
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
    pub is_active: bool,
    #[serde(default)]
    pub class: TokenClass,
    /// Epoch millis when the token was added to the registry.
    #[serde(default)]
    pub added_at: u64,
}

impl WatchedToken {
    pub fn key(&self) -> TokenKey {
        TokenKey {
            contract: self.contract_address,
            chain_id: self.chain_id,
        }
    }
}

/// Identity of a watched token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenKey {
    pub contract: Address,
    pub chain_id: u64,
}

impl std::fmt::Display for TokenKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.contract, self.chain_id)
    }
}

/// A decoded ERC-20 `Transfer` log, before block time is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferLog {
    pub contract: Address,
    pub transaction_hash: B256,
    pub block_number: u64,
    pub from: Address,
    pub to: Address,
    pub value: U256,
}

/// An inbound transfer as held in the feed. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferRecord {
    pub transaction_hash: B256,
    pub contract_address: Address,
    pub from_address: Address,
    pub to_address: Address,
    #[serde(serialize_with = "serialize_decimal")]
    pub raw_amount: U256,
    /// Epoch millis, from block time when it could be resolved.
    pub timestamp: u64,
    pub block_number: u64,
    pub chain_id: u64,
}

impl TransferRecord {
    pub fn from_log(log: &TransferLog, chain_id: u64, timestamp: u64) -> Self {
        Self {
            transaction_hash: log.transaction_hash,
            contract_address: log.contract,
            from_address: log.from,
            to_address: log.to,
            raw_amount: log.value,
            timestamp,
            block_number: log.block_number,
            chain_id,
        }
    }

    /// Deduplication identity: one transaction can move several watched
    /// tokens, and each of those is a distinct record.
    pub fn id(&self) -> TransferId {
        TransferId {
            transaction_hash: self.transaction_hash,
            contract: self.contract_address,
            chain_id: self.chain_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId {
    pub transaction_hash: B256,
    pub contract: Address,
    pub chain_id: u64,
}

fn serialize_decimal<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&value.to_string())
}

/// ERC-20 metadata answered by a candidate token contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenMetadata {
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
}

/// Current wall-clock time in epoch millis.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
