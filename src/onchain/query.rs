//! Bounded historical transfer lookups.
//!
//! One query per watched token over the last `lookback_blocks` blocks,
//! keeping only the latest few matches. A token whose query fails (RPC
//! error, non-conforming contract, timeout) contributes nothing and is
//! reported in `HistoricalBatch::failures`; its siblings are unaffected.

use crate::onchain::ledger::Ledger;
use crate::onchain::types::{now_millis, TokenClass, TransferRecord, WatchedToken};
use crate::onchain::LedgerError;

use alloy::primitives::Address;
use futures::future::join_all;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Limits applied to historical lookups.
#[derive(Debug, Clone, Copy)]
pub struct QueryLimits {
    pub lookback_blocks: u64,
    pub custom_token_limit: usize,
    pub high_volume_token_limit: usize,
    pub timeout: Duration,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            lookback_blocks: 1000,
            custom_token_limit: 5,
            high_volume_token_limit: 10,
            timeout: Duration::from_secs(20),
        }
    }
}

impl QueryLimits {
    pub fn limit_for(&self, class: TokenClass) -> usize {
        match class {
            TokenClass::Custom => self.custom_token_limit,
            TokenClass::HighVolume => self.high_volume_token_limit,
        }
    }
}

/// A per-token query failure, isolated from the rest of the batch.
#[derive(Debug, Clone)]
pub struct TokenFailure {
    pub contract: Address,
    pub symbol: String,
    pub error: String,
}

/// Joined result of one historical fan-out.
#[derive(Debug, Clone, Default)]
pub struct HistoricalBatch {
    pub from_block: u64,
    pub to_block: u64,
    pub records: Vec<TransferRecord>,
    pub failures: Vec<TokenFailure>,
}

/// `[max(0, head - window), head]`
pub fn lookback_range(head: u64, window: u64) -> (u64, u64) {
    (head.saturating_sub(window), head)
}

/// Historical query client over a `Ledger`.
#[derive(Clone)]
pub struct TransferQuery {
    ledger: Arc<dyn Ledger>,
    limits: QueryLimits,
}

impl TransferQuery {
    pub fn new(ledger: Arc<dyn Ledger>, limits: QueryLimits) -> Self {
        Self { ledger, limits }
    }

    /// Latest `limit` transfers of `token` to `recipient` in `[from_block, to_block]`.
    pub async fn fetch_transfers(
        &self,
        token: &WatchedToken,
        recipient: Address,
        from_block: u64,
        to_block: u64,
        limit: usize,
    ) -> Result<Vec<TransferRecord>, LedgerError> {
        if from_block > to_block {
            return Err(LedgerError::InvalidRange {
                from: from_block,
                to: to_block,
            });
        }

        let query = self
            .ledger
            .transfer_logs(token.contract_address, recipient, from_block, to_block);
        let mut logs = tokio::time::timeout(self.limits.timeout, query)
            .await
            .map_err(|_| LedgerError::Timeout(self.limits.timeout))??;

        // Chronologically latest matches only.
        let logs = logs.split_off(logs.len().saturating_sub(limit));

        let blocks: BTreeSet<u64> = logs.iter().map(|l| l.block_number).collect();
        let timestamps = self.resolve_timestamps(blocks).await;
        let fallback = now_millis();

        Ok(logs
            .iter()
            .map(|log| {
                let ts = timestamps
                    .get(&log.block_number)
                    .copied()
                    .unwrap_or(fallback);
                TransferRecord::from_log(log, token.chain_id, ts)
            })
            .collect())
    }

    /// Block timestamps in millis; blocks that fail to resolve are absent.
    async fn resolve_timestamps(&self, blocks: BTreeSet<u64>) -> HashMap<u64, u64> {
        let lookups = blocks.into_iter().map(|block| async move {
            match self.ledger.block_timestamp(block).await {
                Ok(secs) => Some((block, secs.saturating_mul(1000))),
                Err(e) => {
                    debug!(block = block, error = %e, "block timestamp lookup failed, using wall clock");
                    None
                }
            }
        });
        join_all(lookups).await.into_iter().flatten().collect()
    }

    /// Read the head once and query every token over the lookback window
    /// concurrently. Only a head-read failure fails the batch.
    pub async fn fetch_recent(
        &self,
        tokens: &[WatchedToken],
        recipient: Address,
    ) -> Result<HistoricalBatch, LedgerError> {
        let head = self.ledger.block_number().await?;
        let (from_block, to_block) = lookback_range(head, self.limits.lookback_blocks);

        let queries = tokens.iter().map(|token| async move {
            let limit = self.limits.limit_for(token.class);
            let result = self
                .fetch_transfers(token, recipient, from_block, to_block, limit)
                .await;
            (token, result)
        });

        let mut batch = HistoricalBatch {
            from_block,
            to_block,
            ..Default::default()
        };
        for (token, result) in join_all(queries).await {
            match result {
                Ok(records) => {
                    debug!(
                        token = %token.symbol,
                        contract = %token.contract_address,
                        found = records.len(),
                        "historical transfers fetched"
                    );
                    batch.records.extend(records);
                }
                Err(e) => {
                    warn!(
                        token = %token.symbol,
                        contract = %token.contract_address,
                        error = %e,
                        "historical query failed for token"
                    );
                    batch.failures.push(TokenFailure {
                        contract: token.contract_address,
                        symbol: token.symbol.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            from_block = from_block,
            to_block = to_block,
            tokens = tokens.len(),
            records = batch.records.len(),
            failures = batch.failures.len(),
            "historical sync complete"
        );
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onchain::mock::{token, transfer_log, MockLedger};

    fn query(ledger: &Arc<MockLedger>) -> TransferQuery {
        TransferQuery::new(ledger.clone(), QueryLimits::default())
    }

    #[test]
    fn test_lookback_range() {
        assert_eq!(lookback_range(5000, 1000), (4000, 5000));
        assert_eq!(lookback_range(300, 1000), (0, 300));
        assert_eq!(lookback_range(0, 1000), (0, 0));
    }

    #[tokio::test]
    async fn test_keeps_latest_matches_with_block_time() {
        let ledger = Arc::new(MockLedger::new(2000));
        let tok = token(0x11, "AAA");
        let account = Address::repeat_byte(0xaa);
        for i in 0..8u8 {
            ledger.push_log(transfer_log(0x11, i + 1, 1500 + i as u64, account, 10));
            ledger.set_block_time(1500 + i as u64, 1_700_000_000 + i as u64);
        }

        let records = query(&ledger)
            .fetch_transfers(&tok, account, 1000, 2000, 5)
            .await
            .unwrap();

        assert_eq!(records.len(), 5);
        assert_eq!(records[0].block_number, 1503);
        assert_eq!(records[4].block_number, 1507);
        assert_eq!(records[4].timestamp, 1_700_000_007_000);
    }

    #[tokio::test]
    async fn test_timestamp_failure_falls_back_to_wall_clock() {
        let ledger = Arc::new(MockLedger::new(2000));
        let tok = token(0x11, "AAA");
        let account = Address::repeat_byte(0xaa);
        ledger.push_log(transfer_log(0x11, 1, 1900, account, 10));

        let before = now_millis();
        let records = query(&ledger)
            .fetch_transfers(&tok, account, 1000, 2000, 5)
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        assert!(records[0].timestamp >= before);
    }

    #[tokio::test]
    async fn test_rejects_inverted_range() {
        let ledger = Arc::new(MockLedger::new(2000));
        let err = query(&ledger)
            .fetch_transfers(&token(0x11, "AAA"), Address::ZERO, 10, 5, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidRange { from: 10, to: 5 }));
    }

    #[tokio::test]
    async fn test_failing_token_is_isolated() {
        let ledger = Arc::new(MockLedger::new(2000));
        let account = Address::repeat_byte(0xaa);
        ledger.push_log(transfer_log(0x11, 1, 1900, account, 10));
        ledger.push_log(transfer_log(0x12, 2, 1901, account, 10));
        ledger.fail_queries_for(Address::repeat_byte(0x12));

        let batch = query(&ledger)
            .fetch_recent(&[token(0x11, "AAA"), token(0x12, "BAD")], account)
            .await
            .unwrap();

        assert_eq!(batch.from_block, 1000);
        assert_eq!(batch.to_block, 2000);
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].contract_address, Address::repeat_byte(0x11));
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].symbol, "BAD");
    }

    #[tokio::test]
    async fn test_window_excludes_older_logs() {
        let ledger = Arc::new(MockLedger::new(2000));
        let account = Address::repeat_byte(0xaa);
        ledger.push_log(transfer_log(0x11, 1, 500, account, 10));
        ledger.push_log(transfer_log(0x11, 2, 1500, account, 10));

        let batch = query(&ledger)
            .fetch_recent(&[token(0x11, "AAA")], account)
            .await
            .unwrap();

        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].block_number, 1500);
    }

    #[tokio::test]
    async fn test_oversized_block_time_saturates() {
        let ledger = Arc::new(MockLedger::new(2000));
        let tok = token(0x11, "AAA");
        let account = Address::repeat_byte(0xaa);
        ledger.push_log(transfer_log(0x11, 1, 1900, account, 10));
        ledger.set_block_time(1900, u64::MAX);

        let records = query(&ledger)
            .fetch_transfers(&tok, account, 1000, 2000, 5)
            .await
            .unwrap();

        assert_eq!(records[0].timestamp, u64::MAX);
    }

    #[tokio::test]
    async fn test_high_volume_limit() {
        let ledger = Arc::new(MockLedger::new(2000));
        let account = Address::repeat_byte(0xaa);
        for i in 0..12u8 {
            ledger.push_log(transfer_log(0x11, i + 1, 1900 + i as u64, account, 1));
        }
        let mut usdt = token(0x11, "USDT");
        usdt.class = TokenClass::HighVolume;

        let batch = query(&ledger).fetch_recent(&[usdt], account).await.unwrap();
        assert_eq!(batch.records.len(), 10);
    }

    #[tokio::test]
    async fn test_head_failure_fails_batch() {
        let ledger = Arc::new(MockLedger::new(2000));
        ledger.fail_head(true);
        let result = query(&ledger)
            .fetch_recent(&[token(0x11, "AAA")], Address::ZERO)
            .await;
        assert!(result.is_err());
    }
}
