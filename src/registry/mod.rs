//! Watched-token registry.
//!
//! A JSON file holding the user's tokens, keyed by `(contract, chain)`.
//! Candidates are validated against the chain before they are stored: a
//! contract that cannot answer `symbol`, `name` and `decimals` never reaches
//! the monitor. The designated stablecoin per supported chain is built in.

use crate::onchain::ledger::TokenInspector;
use crate::onchain::types::{now_millis, TokenClass, TokenKey, WatchedToken};

use alloy::primitives::{address, Address};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("invalid contract address: {0}")]
    InvalidAddress(String),
    #[error("token already added for this network")]
    Duplicate,
    #[error("not a valid ERC20 token or network error: {0}")]
    Validation(String),
    #[error("failed to read or write registry: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse registry: {0}")]
    Json(#[from] serde_json::Error),
}

/// (chain_id, USDT contract, decimals)
const DESIGNATED_STABLECOINS: &[(u64, Address, u8)] = &[
    (1, address!("dAC17F958D2ee523a2206206994597C13D831ec7"), 6),
    (11155111, address!("7169D38820dfd117C3FA1f22a697dBA58d90BA06"), 6),
    (137, address!("c2132D05D31c914a87C6611C10748AEb04B58e8F"), 6),
    (56, address!("55d398326f99059fF775485246999027B3197955"), 18),
];

/// The designated high-volume stablecoin for a chain, if it has one.
pub fn designated_token(chain_id: u64) -> Option<WatchedToken> {
    DESIGNATED_STABLECOINS
        .iter()
        .find(|(chain, _, _)| *chain == chain_id)
        .map(|(chain, contract, decimals)| WatchedToken {
            contract_address: *contract,
            chain_id: *chain,
            symbol: "USDT".to_string(),
            name: "Tether USD".to_string(),
            decimals: *decimals,
            is_active: true,
            class: TokenClass::HighVolume,
            added_at: 0,
        })
}

pub fn chain_name(chain_id: u64) -> String {
    match chain_id {
        1 => "Ethereum".to_string(),
        11155111 => "Sepolia".to_string(),
        137 => "Polygon".to_string(),
        56 => "BSC".to_string(),
        other => format!("Chain {other}"),
    }
}

pub struct TokenRegistry {
    path: PathBuf,
    tokens: Vec<WatchedToken>,
    include_designated: bool,
}

impl TokenRegistry {
    /// Load the registry file. A missing file is an empty registry.
    pub fn load(path: &Path, include_designated: bool) -> Result<Self, RegistryError> {
        let tokens = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let tokens: Vec<WatchedToken> = serde_json::from_str(&contents)?;
            debug!(path = %path.display(), tokens = tokens.len(), "token registry loaded");
            tokens
        } else {
            debug!(path = %path.display(), "no token registry file, starting empty");
            Vec::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            tokens,
            include_designated,
        })
    }

    pub fn save(&self) -> Result<(), RegistryError> {
        let json = serde_json::to_string_pretty(&self.tokens)?;
        std::fs::write(&self.path, json)?;
        debug!(path = %self.path.display(), tokens = self.tokens.len(), "token registry saved");
        Ok(())
    }

    pub fn tokens(&self) -> &[WatchedToken] {
        &self.tokens
    }

    /// User-added tokens on a chain, active or not.
    pub fn chain_tokens(&self, chain_id: u64) -> Vec<WatchedToken> {
        self.tokens
            .iter()
            .filter(|t| t.chain_id == chain_id)
            .cloned()
            .collect()
    }

    /// Tokens the monitor should watch on a chain.
    pub fn active_tokens(&self, chain_id: u64) -> Vec<WatchedToken> {
        let mut active: Vec<WatchedToken> = self
            .tokens
            .iter()
            .filter(|t| t.chain_id == chain_id && t.is_active)
            .cloned()
            .collect();

        if self.include_designated {
            if let Some(usdt) = designated_token(chain_id) {
                if !self.tokens.iter().any(|t| t.key() == usdt.key()) {
                    active.push(usdt);
                }
            }
        }
        active
    }

    /// Validate and add a token, then persist.
    pub async fn add_token(
        &mut self,
        inspector: &dyn TokenInspector,
        address: &str,
        chain_id: u64,
    ) -> Result<WatchedToken, RegistryError> {
        let contract = Address::from_str(address.trim())
            .map_err(|_| RegistryError::InvalidAddress(address.to_string()))?;
        let key = TokenKey { contract, chain_id };

        if self.find(&key).is_some() {
            return Err(RegistryError::Duplicate);
        }

        let metadata = inspector.token_metadata(contract).await.map_err(|e| {
            warn!(contract = %contract, chain_id = chain_id, error = %e, "token validation failed");
            RegistryError::Validation(e.to_string())
        })?;

        let token = WatchedToken {
            contract_address: contract,
            chain_id,
            symbol: metadata.symbol,
            name: metadata.name,
            decimals: metadata.decimals,
            is_active: true,
            class: TokenClass::Custom,
            added_at: now_millis(),
        };

        info!(
            token = %token.symbol,
            contract = %contract,
            chain = %chain_name(chain_id),
            decimals = token.decimals,
            "token added"
        );
        self.tokens.push(token.clone());
        self.save()?;
        Ok(token)
    }

    /// Remove a token. Returns whether it was present.
    pub fn remove_token(&mut self, key: &TokenKey) -> Result<bool, RegistryError> {
        let before = self.tokens.len();
        self.tokens.retain(|t| t.key() != *key);
        let removed = self.tokens.len() != before;
        if removed {
            info!(key = %key, "token removed");
            self.save()?;
        }
        Ok(removed)
    }

    /// Flip a token's monitoring flag. Returns the new flag, or `None` if unknown.
    pub fn toggle_token(&mut self, key: &TokenKey) -> Result<Option<bool>, RegistryError> {
        let Some(token) = self.tokens.iter_mut().find(|t| t.key() == *key) else {
            return Ok(None);
        };
        token.is_active = !token.is_active;
        let active = token.is_active;
        info!(key = %key, active = active, "token toggled");
        self.save()?;
        Ok(Some(active))
    }

    pub fn find(&self, key: &TokenKey) -> Option<&WatchedToken> {
        self.tokens.iter().find(|t| t.key() == *key)
    }
}
