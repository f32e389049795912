//! Deduplicated, time-ordered, size-bounded transfer feed.
//!
//! Ordering: timestamp descending. Ties put records seen on the live path
//! ahead of historical ones, then later arrivals first. The store is owned
//! by the monitor task, so every mutation is a single synchronous call and
//! readers only ever see a fully sorted snapshot.

use crate::onchain::types::{TransferId, TransferRecord};
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::debug;

pub const DEFAULT_CAPACITY: usize = 50;

/// Which path observed a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSource {
    Historical,
    Live,
}

#[derive(Debug, Clone)]
struct StoredTransfer {
    record: TransferRecord,
    source: RecordSource,
    /// Arrival sequence, monotonically increasing.
    seq: u64,
}

impl StoredTransfer {
    /// Feed order: `Less` sorts first.
    fn feed_cmp(&self, other: &Self) -> Ordering {
        other
            .record
            .timestamp
            .cmp(&self.record.timestamp)
            .then_with(|| source_rank(self.source).cmp(&source_rank(other.source)))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

fn source_rank(source: RecordSource) -> u8 {
    match source {
        RecordSource::Live => 0,
        RecordSource::Historical => 1,
    }
}

#[derive(Debug, Clone)]
pub struct TransferStore {
    entries: Vec<StoredTransfer>,
    ids: HashSet<TransferId>,
    capacity: usize,
    next_seq: u64,
}

impl Default for TransferStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl TransferStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity + 1),
            ids: HashSet::new(),
            capacity: capacity.max(1),
            next_seq: 0,
        }
    }

    /// Insert a record unless its identity is already held.
    ///
    /// Returns `true` if the record is in the feed afterwards; a record
    /// older than everything in a full store is evicted straight away and
    /// reported as not inserted.
    pub fn insert(&mut self, record: TransferRecord, source: RecordSource) -> bool {
        let id = record.id();
        if self.ids.contains(&id) {
            debug!(tx = %record.transaction_hash, contract = %record.contract_address, "duplicate transfer ignored");
            return false;
        }

        let entry = StoredTransfer {
            record,
            source,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        let pos = self
            .entries
            .partition_point(|e| e.feed_cmp(&entry) == Ordering::Less);
        self.entries.insert(pos, entry);
        self.ids.insert(id);

        let mut kept = true;
        while self.entries.len() > self.capacity {
            if let Some(evicted) = self.entries.pop() {
                let evicted_id = evicted.record.id();
                if evicted_id == id {
                    kept = false;
                }
                self.ids.remove(&evicted_id);
            }
        }
        kept
    }

    /// Insert each record by the same rule. Returns how many were added.
    pub fn insert_batch<I>(&mut self, records: I, source: RecordSource) -> usize
    where
        I: IntoIterator<Item = TransferRecord>,
    {
        records
            .into_iter()
            .map(|r| self.insert(r, source))
            .filter(|inserted| *inserted)
            .count()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.ids.clear();
    }

    /// Drop every record for which `keep` returns false.
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&TransferRecord) -> bool,
    {
        let before = self.entries.len();
        let ids = &mut self.ids;
        self.entries.retain(|e| {
            let k = keep(&e.record);
            if !k {
                ids.remove(&e.record.id());
            }
            k
        });
        before - self.entries.len()
    }

    /// Ordered copy of the feed.
    pub fn snapshot(&self) -> Vec<TransferRecord> {
        self.entries.iter().map(|e| e.record.clone()).collect()
    }

    pub fn contains(&self, id: &TransferId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, B256, U256};

    fn record(tx: u8, contract: u8, timestamp: u64) -> TransferRecord {
        TransferRecord {
            transaction_hash: B256::repeat_byte(tx),
            contract_address: Address::repeat_byte(contract),
            from_address: Address::repeat_byte(0x22),
            to_address: Address::repeat_byte(0xaa),
            raw_amount: U256::from(1_000u64),
            timestamp,
            block_number: timestamp / 1000,
            chain_id: 1,
        }
    }

    fn hashes(store: &TransferStore) -> Vec<u8> {
        store
            .snapshot()
            .iter()
            .map(|r| r.transaction_hash.0[0])
            .collect()
    }

    #[test]
    fn test_idempotent_insert() {
        let mut store = TransferStore::default();
        assert!(store.insert(record(1, 0x11, 1_000), RecordSource::Historical));
        assert!(!store.insert(record(1, 0x11, 1_000), RecordSource::Historical));
        assert!(!store.insert(record(1, 0x11, 5_000), RecordSource::Live));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_same_tx_different_contract_is_distinct() {
        let mut store = TransferStore::default();
        assert!(store.insert(record(1, 0x11, 1_000), RecordSource::Historical));
        assert!(store.insert(record(1, 0x12, 1_000), RecordSource::Historical));
        let mut other_chain = record(1, 0x11, 1_000);
        other_chain.chain_id = 137;
        assert!(store.insert(other_chain, RecordSource::Historical));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_sorted_newest_first() {
        let mut store = TransferStore::default();
        store.insert_batch(
            vec![record(1, 0x11, 3_000), record(2, 0x11, 9_000), record(3, 0x11, 1_000)],
            RecordSource::Historical,
        );
        store.insert(record(4, 0x11, 5_000), RecordSource::Live);
        assert_eq!(hashes(&store), vec![2, 4, 1, 3]);
    }

    #[test]
    fn test_live_wins_timestamp_ties() {
        let mut store = TransferStore::default();
        store.insert(record(2, 0x11, 5_000), RecordSource::Live);
        store.insert(record(1, 0x11, 5_000), RecordSource::Historical);
        assert_eq!(hashes(&store), vec![2, 1]);

        // Later live arrival goes ahead of an earlier live one.
        store.insert(record(3, 0x11, 5_000), RecordSource::Live);
        assert_eq!(hashes(&store), vec![3, 2, 1]);
    }

    #[test]
    fn test_cap_keeps_most_recent() {
        let mut store = TransferStore::new(50);
        for i in 0..60u64 {
            let source = if i % 2 == 0 {
                RecordSource::Live
            } else {
                RecordSource::Historical
            };
            store.insert(record(i as u8, 0x11, 1_000 + i), source);
        }
        assert_eq!(store.len(), 50);
        let snapshot = store.snapshot();
        assert_eq!(snapshot[0].timestamp, 1_059);
        assert_eq!(snapshot[49].timestamp, 1_010);
        assert!(!store.contains(&record(9, 0x11, 1_009).id()));
    }

    #[test]
    fn test_record_older_than_full_store_is_not_kept() {
        let mut store = TransferStore::new(2);
        store.insert(record(1, 0x11, 5_000), RecordSource::Historical);
        store.insert(record(2, 0x11, 6_000), RecordSource::Historical);
        assert!(!store.insert(record(3, 0x11, 1_000), RecordSource::Live));
        assert_eq!(hashes(&store), vec![2, 1]);
        // Evicted identity can come back if it becomes relevant again.
        assert!(!store.contains(&record(3, 0x11, 1_000).id()));
    }

    #[test]
    fn test_clear_and_retain() {
        let mut store = TransferStore::default();
        store.insert(record(1, 0x11, 1_000), RecordSource::Historical);
        let mut foreign = record(2, 0x11, 2_000);
        foreign.chain_id = 56;
        store.insert(foreign, RecordSource::Historical);

        assert_eq!(store.retain(|r| r.chain_id == 1), 1);
        assert_eq!(hashes(&store), vec![1]);
        assert!(store.insert(record(2, 0x11, 2_000), RecordSource::Historical));

        store.clear();
        assert!(store.is_empty());
        assert!(store.insert(record(1, 0x11, 1_000), RecordSource::Historical));
    }
}
