//! Live transfer subscriptions, one per watched contract.
//!
//! The manager owns an explicit table `TokenKey -> handle`. Each handle owns
//! the forwarding task that drains the node's push stream, attaches block
//! time, and sends `LiveEvent`s to the monitor. Tearing down a subscription
//! is aborting its task, so there is no listener bookkeeping anywhere else.

use crate::onchain::ledger::{Ledger, TransferStream};
use crate::onchain::types::{now_millis, TokenKey, TransferRecord, WatchedToken};
use crate::onchain::LedgerError;

use alloy::primitives::Address;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Opaque handle for one open subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[cfg(test)]
impl SubscriptionId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// Events pushed from subscription tasks to the monitor.
#[derive(Debug, Clone)]
pub enum LiveEvent {
    /// An inbound transfer observed on an open subscription.
    Transfer {
        subscription: SubscriptionId,
        record: TransferRecord,
    },
    /// The node closed the push stream on its own.
    Ended {
        subscription: SubscriptionId,
        key: TokenKey,
    },
}

struct SubscriptionHandle {
    id: SubscriptionId,
    symbol: String,
    task: JoinHandle<()>,
}

pub struct SubscriptionManager {
    ledger: Arc<dyn Ledger>,
    event_tx: mpsc::UnboundedSender<LiveEvent>,
    active: HashMap<TokenKey, SubscriptionHandle>,
    next_id: u64,
}

impl SubscriptionManager {
    pub fn new(ledger: Arc<dyn Ledger>, event_tx: mpsc::UnboundedSender<LiveEvent>) -> Self {
        Self {
            ledger,
            event_tx,
            active: HashMap::new(),
            next_id: 0,
        }
    }

    /// Open a subscription for transfers of `token` to `recipient`.
    ///
    /// A token that is already subscribed keeps its existing handle.
    pub async fn subscribe(
        &mut self,
        token: &WatchedToken,
        recipient: Address,
    ) -> Result<SubscriptionId, LedgerError> {
        let key = token.key();
        if let Some(existing) = self.active.get(&key) {
            debug!(token = %token.symbol, id = %existing.id, "already subscribed");
            return Ok(existing.id);
        }

        let stream = self
            .ledger
            .subscribe_transfers(token.contract_address, recipient)
            .await?;

        let id = SubscriptionId(self.next_id);
        self.next_id += 1;

        let task = tokio::spawn(forward_transfers(
            self.ledger.clone(),
            stream,
            id,
            key,
            recipient,
            self.event_tx.clone(),
        ));

        info!(
            token = %token.symbol,
            contract = %token.contract_address,
            chain_id = token.chain_id,
            id = %id,
            "live subscription opened"
        );
        self.active.insert(
            key,
            SubscriptionHandle {
                id,
                symbol: token.symbol.clone(),
                task,
            },
        );
        Ok(id)
    }

    #[cfg(test)]
    pub(crate) fn event_sender(&self) -> mpsc::UnboundedSender<LiveEvent> {
        self.event_tx.clone()
    }

    /// Close one subscription. Unknown or already-closed handles are a no-op.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        match self.key_for(id) {
            Some(key) => self.unsubscribe_token(&key),
            None => {
                debug!(id = %id, "unsubscribe for unknown subscription ignored");
                false
            }
        }
    }

    /// Close the subscription for a token, if any.
    pub fn unsubscribe_token(&mut self, key: &TokenKey) -> bool {
        match self.active.remove(key) {
            Some(handle) => {
                release(key, handle);
                true
            }
            None => false,
        }
    }

    /// Close every subscription. Returns how many were open.
    pub fn unsubscribe_all(&mut self) -> usize {
        let count = self.active.len();
        for (key, handle) in self.active.drain() {
            release(&key, handle);
        }
        if count > 0 {
            info!(closed = count, "all live subscriptions closed");
        }
        count
    }

    /// Drop a table entry whose stream already ended, if it is still current.
    pub fn forget(&mut self, id: SubscriptionId) -> Option<String> {
        let key = self.key_for(id)?;
        self.active.remove(&key).map(|h| h.symbol)
    }

    /// Whether `id` is still an open entry in the table.
    pub fn is_current(&self, id: SubscriptionId) -> bool {
        self.active.values().any(|h| h.id == id)
    }

    pub fn key_for(&self, id: SubscriptionId) -> Option<TokenKey> {
        self.active
            .iter()
            .find(|(_, h)| h.id == id)
            .map(|(k, _)| *k)
    }

    pub fn is_subscribed(&self, key: &TokenKey) -> bool {
        self.active.contains_key(key)
    }

    pub fn open_count(&self) -> usize {
        self.active.len()
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}

fn release(key: &TokenKey, handle: SubscriptionHandle) {
    if handle.task.is_finished() {
        debug!(token = %handle.symbol, key = %key, id = %handle.id, "subscription already closed");
    } else {
        handle.task.abort();
        debug!(token = %handle.symbol, key = %key, id = %handle.id, "subscription closed");
    }
}

async fn forward_transfers(
    ledger: Arc<dyn Ledger>,
    mut stream: TransferStream,
    id: SubscriptionId,
    key: TokenKey,
    recipient: Address,
    event_tx: mpsc::UnboundedSender<LiveEvent>,
) {
    while let Some(log) = stream.next().await {
        if log.to != recipient {
            debug!(id = %id, to = %log.to, "ignoring transfer to another address");
            continue;
        }

        let timestamp = match ledger.block_timestamp(log.block_number).await {
            Ok(secs) => secs.saturating_mul(1000),
            Err(e) => {
                debug!(block = log.block_number, error = %e, "block timestamp lookup failed, using wall clock");
                now_millis()
            }
        };

        let record = TransferRecord::from_log(&log, key.chain_id, timestamp);
        if event_tx
            .send(LiveEvent::Transfer {
                subscription: id,
                record,
            })
            .is_err()
        {
            // Monitor is gone.
            return;
        }
    }

    warn!(id = %id, key = %key, "live subscription stream ended");
    let _ = event_tx.send(LiveEvent::Ended { subscription: id, key });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onchain::mock::{token, transfer_log, MockLedger};

    fn manager(ledger: &Arc<MockLedger>) -> (SubscriptionManager, mpsc::UnboundedReceiver<LiveEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SubscriptionManager::new(ledger.clone(), tx), rx)
    }

    #[tokio::test]
    async fn test_one_subscription_per_token() {
        let ledger = Arc::new(MockLedger::new(100));
        let (mut subs, _rx) = manager(&ledger);
        let account = Address::repeat_byte(0xaa);
        let tok = token(0x11, "AAA");

        let first = subs.subscribe(&tok, account).await.unwrap();
        let second = subs.subscribe(&tok, account).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(subs.open_count(), 1);
        assert_eq!(ledger.subscribe_calls(tok.contract_address), 1);
    }

    #[tokio::test]
    async fn test_forwards_inbound_transfers_with_block_time() {
        let ledger = Arc::new(MockLedger::new(100));
        let (mut subs, mut rx) = manager(&ledger);
        let account = Address::repeat_byte(0xaa);
        let id = subs.subscribe(&token(0x11, "AAA"), account).await.unwrap();
        ledger.set_block_time(101, 1_700_000_000);

        ledger.emit(transfer_log(0x11, 7, 101, Address::repeat_byte(0xbb), 1));
        ledger.emit(transfer_log(0x11, 8, 101, account, 42));

        match rx.recv().await.unwrap() {
            LiveEvent::Transfer { subscription, record } => {
                assert_eq!(subscription, id);
                assert_eq!(record.transaction_hash.0[0], 8);
                assert_eq!(record.timestamp, 1_700_000_000_000);
                assert_eq!(record.chain_id, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_oversized_block_time_saturates() {
        let ledger = Arc::new(MockLedger::new(100));
        let (mut subs, mut rx) = manager(&ledger);
        let account = Address::repeat_byte(0xaa);
        subs.subscribe(&token(0x11, "AAA"), account).await.unwrap();
        ledger.set_block_time(101, u64::MAX);

        ledger.emit(transfer_log(0x11, 8, 101, account, 42));

        match rx.recv().await.unwrap() {
            LiveEvent::Transfer { record, .. } => assert_eq!(record.timestamp, u64::MAX),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let ledger = Arc::new(MockLedger::new(100));
        let (mut subs, _rx) = manager(&ledger);
        let id = subs
            .subscribe(&token(0x11, "AAA"), Address::ZERO)
            .await
            .unwrap();

        assert!(subs.unsubscribe(id));
        assert!(!subs.unsubscribe(id));
        assert!(!subs.is_current(id));
        assert_eq!(subs.open_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_all() {
        let ledger = Arc::new(MockLedger::new(100));
        let (mut subs, _rx) = manager(&ledger);
        subs.subscribe(&token(0x11, "AAA"), Address::ZERO).await.unwrap();
        subs.subscribe(&token(0x12, "BBB"), Address::ZERO).await.unwrap();

        assert_eq!(subs.unsubscribe_all(), 2);
        assert_eq!(subs.unsubscribe_all(), 0);
        assert_eq!(subs.open_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_open_leaves_table_unchanged() {
        let ledger = Arc::new(MockLedger::new(100));
        let (mut subs, _rx) = manager(&ledger);
        ledger.fail_subscriptions_for(Address::repeat_byte(0x12));

        subs.subscribe(&token(0x11, "AAA"), Address::ZERO).await.unwrap();
        assert!(subs.subscribe(&token(0x12, "BBB"), Address::ZERO).await.is_err());
        assert_eq!(subs.open_count(), 1);
    }

    #[tokio::test]
    async fn test_reports_stream_end() {
        let ledger = Arc::new(MockLedger::new(100));
        let (mut subs, mut rx) = manager(&ledger);
        let tok = token(0x11, "AAA");
        let id = subs.subscribe(&tok, Address::ZERO).await.unwrap();

        ledger.close_stream(tok.contract_address);

        match rx.recv().await.unwrap() {
            LiveEvent::Ended { subscription, key } => {
                assert_eq!(subscription, id);
                assert_eq!(key, tok.key());
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(subs.forget(id).as_deref(), Some("AAA"));
        assert_eq!(subs.forget(id), None);
    }
}
