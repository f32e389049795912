//! In-memory ledger for tests.

use crate::onchain::ledger::{Ledger, TokenInspector, TransferStream};
use crate::onchain::types::{TokenClass, TokenMetadata, TransferLog, WatchedToken};
use crate::onchain::LedgerError;

use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::watch;

pub(crate) fn token(byte: u8, symbol: &str) -> WatchedToken {
    WatchedToken {
        contract_address: Address::repeat_byte(byte),
        chain_id: 1,
        symbol: symbol.to_string(),
        name: format!("{symbol} Token"),
        decimals: 18,
        is_active: true,
        class: TokenClass::Custom,
        added_at: 0,
    }
}

pub(crate) fn transfer_log(
    contract: u8,
    tx: u8,
    block: u64,
    to: Address,
    value: u64,
) -> TransferLog {
    TransferLog {
        contract: Address::repeat_byte(contract),
        transaction_hash: B256::repeat_byte(tx),
        block_number: block,
        from: Address::repeat_byte(0x22),
        to,
        value: U256::from(value),
    }
}

#[derive(Default)]
struct MockState {
    head: u64,
    head_fails: bool,
    logs: Vec<TransferLog>,
    block_times: HashMap<u64, u64>,
    failing_queries: HashSet<Address>,
    failing_subscriptions: HashSet<Address>,
    subscribe_calls: HashMap<Address, usize>,
    query_calls: HashMap<Address, usize>,
    live: HashMap<Address, Vec<fmpsc::UnboundedSender<TransferLog>>>,
    metadata: HashMap<Address, TokenMetadata>,
    chain_id: u64,
}

pub(crate) struct MockLedger {
    state: Mutex<MockState>,
    /// Contracts whose log queries block until released.
    held: watch::Sender<HashSet<Address>>,
}

impl MockLedger {
    pub(crate) fn new(head: u64) -> Self {
        Self {
            state: Mutex::new(MockState {
                head,
                chain_id: 1,
                ..Default::default()
            }),
            held: watch::channel(HashSet::new()).0,
        }
    }

    pub(crate) fn hold_queries_for(&self, contract: Address) {
        self.held.send_modify(|held| {
            held.insert(contract);
        });
    }

    pub(crate) fn release_queries_for(&self, contract: Address) {
        self.held.send_modify(|held| {
            held.remove(&contract);
        });
    }

    pub(crate) fn push_log(&self, log: TransferLog) {
        self.state.lock().unwrap().logs.push(log);
    }

    pub(crate) fn set_block_time(&self, block: u64, secs: u64) {
        self.state.lock().unwrap().block_times.insert(block, secs);
    }

    pub(crate) fn fail_head(&self, fail: bool) {
        self.state.lock().unwrap().head_fails = fail;
    }

    pub(crate) fn fail_queries_for(&self, contract: Address) {
        self.state.lock().unwrap().failing_queries.insert(contract);
    }

    pub(crate) fn fail_subscriptions_for(&self, contract: Address) {
        self.state.lock().unwrap().failing_subscriptions.insert(contract);
    }

    pub(crate) fn allow_subscriptions_for(&self, contract: Address) {
        self.state.lock().unwrap().failing_subscriptions.remove(&contract);
    }

    pub(crate) fn set_metadata(&self, contract: Address, metadata: TokenMetadata) {
        self.state.lock().unwrap().metadata.insert(contract, metadata);
    }

    pub(crate) fn subscribe_calls(&self, contract: Address) -> usize {
        self.state
            .lock()
            .unwrap()
            .subscribe_calls
            .get(&contract)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn query_calls(&self, contract: Address) -> usize {
        self.state
            .lock()
            .unwrap()
            .query_calls
            .get(&contract)
            .copied()
            .unwrap_or(0)
    }

    /// Push a log to every open subscription on `log.contract`.
    pub(crate) fn emit(&self, log: TransferLog) {
        let mut state = self.state.lock().unwrap();
        if let Some(senders) = state.live.get_mut(&log.contract) {
            senders.retain(|tx| tx.unbounded_send(log.clone()).is_ok());
        }
    }

    /// Push streams on `contract` whose receiving side is still alive.
    pub(crate) fn open_streams(&self, contract: Address) -> usize {
        self.state
            .lock()
            .unwrap()
            .live
            .get(&contract)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Close every push stream on `contract`, as a dropped node connection would.
    pub(crate) fn close_stream(&self, contract: Address) {
        self.state.lock().unwrap().live.remove(&contract);
    }
}

#[async_trait]
impl Ledger for MockLedger {
    async fn block_number(&self) -> Result<u64, LedgerError> {
        let state = self.state.lock().unwrap();
        if state.head_fails {
            return Err(LedgerError::Rpc("connection refused".to_string()));
        }
        Ok(state.head)
    }

    async fn transfer_logs(
        &self,
        contract: Address,
        recipient: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferLog>, LedgerError> {
        let mut gate = self.held.subscribe();
        let _ = gate.wait_for(|held| !held.contains(&contract)).await;

        let mut state = self.state.lock().unwrap();
        *state.query_calls.entry(contract).or_default() += 1;
        if state.failing_queries.contains(&contract) {
            return Err(LedgerError::Rpc("execution reverted".to_string()));
        }
        Ok(state
            .logs
            .iter()
            .filter(|l| {
                l.contract == contract
                    && l.to == recipient
                    && l.block_number >= from_block
                    && l.block_number <= to_block
            })
            .cloned()
            .collect())
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<u64, LedgerError> {
        self.state
            .lock()
            .unwrap()
            .block_times
            .get(&block_number)
            .copied()
            .ok_or(LedgerError::BlockNotFound(block_number))
    }

    async fn subscribe_transfers(
        &self,
        contract: Address,
        _recipient: Address,
    ) -> Result<TransferStream, LedgerError> {
        let mut state = self.state.lock().unwrap();
        *state.subscribe_calls.entry(contract).or_default() += 1;
        if state.failing_subscriptions.contains(&contract) {
            return Err(LedgerError::Rpc("subscription rejected".to_string()));
        }
        let (tx, rx) = fmpsc::unbounded();
        state.live.entry(contract).or_default().push(tx);
        Ok(rx.boxed())
    }
}

#[async_trait]
impl TokenInspector for MockLedger {
    async fn chain_id(&self) -> Result<u64, LedgerError> {
        Ok(self.state.lock().unwrap().chain_id)
    }

    async fn token_metadata(&self, contract: Address) -> Result<TokenMetadata, LedgerError> {
        self.state
            .lock()
            .unwrap()
            .metadata
            .get(&contract)
            .cloned()
            .ok_or_else(|| LedgerError::Rpc("execution reverted".to_string()))
    }
}
