//! The boundary to the chain client.
//!
//! `Ledger` is everything the monitoring engine needs from a node: chain
//! head, a bounded transfer-log query, block timestamps and a push
//! subscription. `TokenInspector` covers the calls the registry makes when
//! validating a candidate token. `AlloyLedger` implements both over a
//! WebSocket provider.

use crate::onchain::abi::{self, IERC20Metadata, TRANSFER_TOPIC};
use crate::onchain::types::{TokenMetadata, TransferLog};
use crate::onchain::LedgerError;

use alloy::eips::BlockNumberOrTag;
use alloy::primitives::Address;
use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{Filter, Log};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{debug, info};

/// Stream of decoded transfer logs pushed by a live subscription.
pub type TransferStream = BoxStream<'static, TransferLog>;

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Current chain head.
    async fn block_number(&self) -> Result<u64, LedgerError>;

    /// Transfer logs emitted by `contract` to `recipient` within
    /// `[from_block, to_block]`, in chain order.
    async fn transfer_logs(
        &self,
        contract: Address,
        recipient: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferLog>, LedgerError>;

    /// Block timestamp in seconds.
    async fn block_timestamp(&self, block_number: u64) -> Result<u64, LedgerError>;

    /// Open a push subscription for transfers of `contract` to `recipient`.
    async fn subscribe_transfers(
        &self,
        contract: Address,
        recipient: Address,
    ) -> Result<TransferStream, LedgerError>;
}

#[async_trait]
pub trait TokenInspector: Send + Sync {
    async fn chain_id(&self) -> Result<u64, LedgerError>;

    /// Ask a contract for its ERC-20 `symbol`, `name` and `decimals`.
    async fn token_metadata(&self, contract: Address) -> Result<TokenMetadata, LedgerError>;
}

/// Ledger backed by an alloy WebSocket provider.
#[derive(Clone)]
pub struct AlloyLedger {
    provider: DynProvider,
}

impl AlloyLedger {
    pub async fn connect(ws_url: &str) -> Result<Self, LedgerError> {
        let provider = ProviderBuilder::new()
            .connect_ws(WsConnect::new(ws_url))
            .await?
            .erased();
        info!(url = %ws_url, "ledger WebSocket connected");
        Ok(Self { provider })
    }

    fn transfer_filter(contract: Address, recipient: Address) -> Filter {
        Filter::new()
            .address(contract)
            .event_signature(TRANSFER_TOPIC)
            .topic2(recipient.into_word())
    }
}

fn decode_log(log: &Log) -> Option<TransferLog> {
    let decoded = abi::decode_transfer(
        log.address(),
        log.topics(),
        &log.data().data,
        log.transaction_hash,
        log.block_number,
    );
    if decoded.is_none() {
        debug!(
            contract = %log.address(),
            tx = ?log.transaction_hash,
            "skipping non-conforming transfer log"
        );
    }
    decoded
}

#[async_trait]
impl Ledger for AlloyLedger {
    async fn block_number(&self) -> Result<u64, LedgerError> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn transfer_logs(
        &self,
        contract: Address,
        recipient: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferLog>, LedgerError> {
        let filter = Self::transfer_filter(contract, recipient)
            .from_block(from_block)
            .to_block(to_block);
        let logs = self.provider.get_logs(&filter).await?;
        Ok(logs.iter().filter_map(decode_log).collect())
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<u64, LedgerError> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(block_number))
            .await?
            .ok_or(LedgerError::BlockNotFound(block_number))?;
        Ok(block.header.timestamp)
    }

    async fn subscribe_transfers(
        &self,
        contract: Address,
        recipient: Address,
    ) -> Result<TransferStream, LedgerError> {
        let filter = Self::transfer_filter(contract, recipient);
        let sub = self.provider.subscribe_logs(&filter).await?;
        let stream = sub
            .into_stream()
            .filter_map(|log| async move { decode_log(&log) })
            .boxed();
        Ok(stream)
    }
}

#[async_trait]
impl TokenInspector for AlloyLedger {
    async fn chain_id(&self) -> Result<u64, LedgerError> {
        Ok(self.provider.get_chain_id().await?)
    }

    async fn token_metadata(&self, contract: Address) -> Result<TokenMetadata, LedgerError> {
        let token = IERC20Metadata::new(contract, self.provider.clone());
        let symbol = token.symbol().call().await?;
        let name = token.name().call().await?;
        let decimals = token.decimals().call().await?;
        Ok(TokenMetadata {
            symbol,
            name,
            decimals,
        })
    }
}
