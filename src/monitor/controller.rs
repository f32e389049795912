//! The monitor state machine.
//!
//! One task owns the store, the subscription table and the session, and
//! handles one event at a time: session commands, live events, and
//! historical results. Every session change bumps `epoch`; a historical
//! result issued under an older epoch is dropped on arrival. A live event
//! whose subscription is no longer in the table is dropped the same way.

use super::{
    MonitorCommand, MonitorError, MonitorHandle, MonitorState, MonitorView, Session,
    HISTORY_ERROR, STREAM_ENDED_ERROR, SUBSCRIBE_ERROR,
};
use crate::config::MonitorConfig;
use crate::notify::{Notification, NotificationSink, Permission};
use crate::onchain::ledger::Ledger;
use crate::onchain::query::{HistoricalBatch, TransferQuery};
use crate::onchain::types::{TokenKey, TransferRecord, WatchedToken};
use crate::onchain::LedgerError;
use crate::store::{RecordSource, TransferStore};
use crate::subscriptions::{LiveEvent, SubscriptionManager};

use alloy::primitives::Address;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Upper bound on a sink's permission prompt.
const PERMISSION_TIMEOUT: Duration = Duration::from_secs(10);

struct HistoryResult {
    epoch: u64,
    result: Result<HistoricalBatch, LedgerError>,
}

pub struct MonitorController {
    query: TransferQuery,
    subscriptions: SubscriptionManager,
    store: TransferStore,
    notifier: Arc<dyn NotificationSink>,

    session: Session,
    tokens: BTreeMap<TokenKey, WatchedToken>,
    epoch: u64,
    state: MonitorState,
    last_error: Option<String>,
    /// Active tokens without a working subscription, with the reason.
    failed: HashMap<TokenKey, String>,
    permission_requested: bool,

    commands: mpsc::UnboundedReceiver<MonitorCommand>,
    live_rx: mpsc::UnboundedReceiver<LiveEvent>,
    history_tx: mpsc::UnboundedSender<HistoryResult>,
    history_rx: mpsc::UnboundedReceiver<HistoryResult>,
    view_tx: watch::Sender<MonitorView>,
}

impl MonitorController {
    pub fn new(
        config: &MonitorConfig,
        ledger: Arc<dyn Ledger>,
        notifier: Arc<dyn NotificationSink>,
    ) -> (Self, MonitorHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (live_tx, live_rx) = mpsc::unbounded_channel();
        let (history_tx, history_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(MonitorView::default());

        let controller = Self {
            query: TransferQuery::new(ledger.clone(), config.query_limits()),
            subscriptions: SubscriptionManager::new(ledger, live_tx),
            store: TransferStore::new(config.feed_capacity),
            notifier,
            session: Session::default(),
            tokens: BTreeMap::new(),
            epoch: 0,
            state: MonitorState::Idle,
            last_error: None,
            failed: HashMap::new(),
            permission_requested: false,
            commands: cmd_rx,
            live_rx,
            history_tx,
            history_rx,
            view_tx,
        };
        let handle = MonitorHandle {
            commands: cmd_tx,
            view: view_rx,
        };
        (controller, handle)
    }

    /// Run the controller in a background task. Returns immediately.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Process events until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        info!("monitor controller started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(MonitorCommand::Session(session)) => self.apply_session(session).await,
                    Some(MonitorCommand::Refresh) => {
                        if let Err(e) = self.refresh().await {
                            info!(error = %e, "refresh ignored");
                        }
                    }
                    Some(MonitorCommand::Shutdown) | None => break,
                },
                Some(event) = self.live_rx.recv() => self.handle_live(event).await,
                Some(result) = self.history_rx.recv() => self.handle_history(result),
            }
        }
        self.teardown();
        info!("monitor controller stopped");
    }

    /// Reconcile subscriptions, the feed and the history query against a new session.
    async fn apply_session(&mut self, next: Session) {
        let next_tokens = active_tokens(&next);
        let prev_identity = self.session.identity();
        let next_identity = next.identity();

        if !next.connected {
            self.permission_requested = false;
        }

        let tokens_changed = !next_tokens.keys().eq(self.tokens.keys());
        if prev_identity == next_identity && !tokens_changed {
            debug!("session unchanged");
            self.session = next;
            self.tokens = next_tokens;
            return;
        }
        self.epoch += 1;

        if prev_identity != next_identity {
            let closed = self.subscriptions.unsubscribe_all();
            self.failed.clear();
            if prev_identity.is_some() {
                info!(closed = closed, "account or chain changed, subscriptions torn down");
            }
        } else {
            let removed: Vec<TokenKey> = self
                .tokens
                .keys()
                .filter(|k| !next_tokens.contains_key(k))
                .copied()
                .collect();
            for key in removed {
                self.subscriptions.unsubscribe_token(&key);
                self.failed.remove(&key);
            }
        }

        self.session = next;
        self.tokens = next_tokens;

        match next_identity {
            Some((account, chain_id)) if !self.tokens.is_empty() => {
                info!(
                    account = %account,
                    chain_id = chain_id,
                    tokens = self.tokens.len(),
                    epoch = self.epoch,
                    "session ready"
                );
                self.start_cycle(account).await;
            }
            _ => {
                self.subscriptions.unsubscribe_all();
                self.failed.clear();
                if self.tokens.is_empty() {
                    self.store.clear();
                }
                self.last_error = None;
                self.set_state(MonitorState::Idle);
                self.publish();
            }
        }
    }

    /// Re-run the historical sync and reopen any missing subscriptions.
    async fn refresh(&mut self) -> Result<(), MonitorError> {
        let account = match self.session.identity() {
            Some((account, _)) if !self.tokens.is_empty() => account,
            _ => return Err(MonitorError::Configuration("no account, chain or active tokens")),
        };
        self.epoch += 1;
        info!(epoch = self.epoch, "manual refresh");
        self.start_cycle(account).await;
        Ok(())
    }

    async fn start_cycle(&mut self, account: Address) {
        self.set_state(MonitorState::Syncing);
        self.publish();

        self.spawn_history(account);
        self.open_subscriptions(account).await;
        self.request_permission_once().await;

        if self.failed.is_empty() {
            self.last_error = None;
            self.set_state(MonitorState::Live);
        } else {
            self.set_state(MonitorState::Degraded);
        }
        self.publish();
    }

    fn spawn_history(&self, account: Address) {
        let query = self.query.clone();
        let tokens: Vec<WatchedToken> = self.tokens.values().cloned().collect();
        let epoch = self.epoch;
        let tx = self.history_tx.clone();
        tokio::spawn(async move {
            let result = query.fetch_recent(&tokens, account).await;
            let _ = tx.send(HistoryResult { epoch, result });
        });
    }

    /// Open a subscription for every active token that has none.
    async fn open_subscriptions(&mut self, account: Address) {
        let missing: Vec<WatchedToken> = self
            .tokens
            .values()
            .filter(|t| !self.subscriptions.is_subscribed(&t.key()))
            .cloned()
            .collect();

        for token in missing {
            match self.subscriptions.subscribe(&token, account).await {
                Ok(_) => {
                    self.failed.remove(&token.key());
                }
                Err(source) => {
                    let err = MonitorError::Subscription {
                        symbol: token.symbol.clone(),
                        source,
                    };
                    warn!(token = %token.symbol, contract = %token.contract_address, error = %err, "subscription failed");
                    self.failed.insert(token.key(), err.to_string());
                    self.last_error = Some(SUBSCRIBE_ERROR.to_string());
                }
            }
        }
    }

    async fn request_permission_once(&mut self) {
        if self.permission_requested || self.subscriptions.open_count() == 0 {
            return;
        }
        self.permission_requested = true;
        let notifier = self.notifier.clone();
        let request = async move {
            if notifier.permission().await == Permission::Default {
                Some(notifier.request_permission().await)
            } else {
                None
            }
        };
        match tokio::time::timeout(PERMISSION_TIMEOUT, request).await {
            Ok(Some(permission)) => info!(permission = ?permission, "notification permission requested"),
            Ok(None) => {}
            Err(_) => warn!("notification permission request timed out"),
        }
    }

    fn handle_history(&mut self, HistoryResult { epoch, result }: HistoryResult) {
        if epoch != self.epoch {
            debug!(epoch = epoch, current = self.epoch, "stale historical result dropped");
            return;
        }
        let Some((account, chain_id)) = self.session.identity() else {
            return;
        };

        match result {
            Ok(batch) => {
                // Records of a previous account or chain are kept until now.
                let dropped = self
                    .store
                    .retain(|r| r.chain_id == chain_id && r.to_address == account);
                let added = self.store.insert_batch(batch.records, RecordSource::Historical);
                info!(
                    added = added,
                    dropped = dropped,
                    failed_tokens = batch.failures.len(),
                    feed = self.store.len(),
                    "historical transfers merged"
                );
                if self.failed.is_empty() {
                    self.last_error = None;
                    self.set_state(MonitorState::Live);
                }
            }
            Err(e) => {
                let err = MonitorError::Query(e);
                warn!(error = %err, "historical sync failed");
                self.last_error = Some(HISTORY_ERROR.to_string());
                self.set_state(MonitorState::Degraded);
            }
        }
        self.publish();
    }

    async fn handle_live(&mut self, event: LiveEvent) {
        match event {
            LiveEvent::Transfer {
                subscription,
                record,
            } => {
                if !self.subscriptions.is_current(subscription) {
                    debug!(id = %subscription, tx = %record.transaction_hash, "event from closed subscription dropped");
                    return;
                }
                let key = TokenKey {
                    contract: record.contract_address,
                    chain_id: record.chain_id,
                };
                let Some(token) = self.tokens.get(&key).cloned() else {
                    debug!(key = %key, "event for unwatched token dropped");
                    return;
                };
                if !self.store.insert(record.clone(), RecordSource::Live) {
                    return;
                }
                info!(
                    token = %token.symbol,
                    tx = %record.transaction_hash,
                    from = %record.from_address,
                    block = record.block_number,
                    "transfer received"
                );
                self.notify(&record, &token);
                self.publish();
            }
            LiveEvent::Ended { subscription, key } => {
                let Some(symbol) = self.subscriptions.forget(subscription) else {
                    debug!(id = %subscription, "end of closed subscription ignored");
                    return;
                };
                warn!(token = %symbol, key = %key, "live subscription lost");
                self.failed.insert(key, STREAM_ENDED_ERROR.to_string());
                self.last_error = Some(STREAM_ENDED_ERROR.to_string());
                self.set_state(MonitorState::Degraded);
                self.publish();
            }
        }
    }

    /// Alerts are delivered from their own task, off the controller loop.
    fn notify(&self, record: &TransferRecord, token: &WatchedToken) {
        let notifier = self.notifier.clone();
        let notification = Notification::for_transfer(record, token);
        tokio::spawn(async move {
            if notifier.permission().await != Permission::Granted {
                return;
            }
            if let Err(e) = notifier.dispatch(&notification).await {
                warn!(error = %e, title = %notification.title, "notification dispatch failed");
            }
        });
    }

    fn teardown(&mut self) {
        self.epoch += 1;
        let closed = self.subscriptions.unsubscribe_all();
        self.failed.clear();
        self.set_state(MonitorState::Idle);
        self.publish();
        info!(closed = closed, "monitor torn down");
    }

    fn set_state(&mut self, next: MonitorState) {
        if self.state != next {
            info!(from = %self.state, to = %next, "monitor state changed");
            self.state = next;
        }
    }

    fn publish(&self) {
        let open = self.subscriptions.open_count();
        self.view_tx.send_replace(MonitorView {
            state: self.state,
            is_listening: open > 0,
            last_error: self.last_error.clone(),
            account: self.session.account,
            chain_id: self.session.chain_id,
            monitored_tokens: self.tokens.len(),
            open_subscriptions: open,
            feed: self.store.snapshot(),
        });
    }
}

/// Active tokens on the session's chain, one per identity. With the chain
/// unknown the provider's list is taken as is.
fn active_tokens(session: &Session) -> BTreeMap<TokenKey, WatchedToken> {
    session
        .tokens
        .iter()
        .filter(|t| t.is_active && session.chain_id.map_or(true, |c| c == t.chain_id))
        .map(|t| (t.key(), t.clone()))
        .collect()
}
