//! In-Memory Transaction Store
//!
//! Volatile store used by tests and by nodes that keep their log in memory.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use super::record::{TxId, TxRecord};
use super::{check_append, check_readable, TxStore};
use crate::error::Result;

/// In-memory transaction store with optional bounded retention
pub struct MemoryTxStore {
    /// Committed records by id
    records: RwLock<BTreeMap<TxId, TxRecord>>,
    /// Highest committed id
    last: AtomicU64,
    /// Lowest retained id
    oldest: AtomicU64,
    /// Maximum number of records to keep (0 = unlimited)
    retention: usize,
}

impl MemoryTxStore {
    /// Create an empty store that keeps every record
    pub fn new() -> Self {
        Self::with_retention(0)
    }

    /// Create an empty store that keeps at most `retention` records
    pub fn with_retention(retention: usize) -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            last: AtomicU64::new(0),
            oldest: AtomicU64::new(1),
            retention,
        }
    }

    /// Drop every record with an id below `tx_id`, returning how many went
    pub async fn prune_before(&self, tx_id: TxId) -> usize {
        let mut records = self.records.write().await;
        Self::prune_locked(&mut records, &self.oldest, &self.last, tx_id)
    }

    /// Number of retained records
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether no records are retained
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn prune_locked(
        records: &mut BTreeMap<TxId, TxRecord>,
        oldest: &AtomicU64,
        last: &AtomicU64,
        tx_id: TxId,
    ) -> usize {
        let retained = records.split_off(&tx_id);
        let removed = records.len();
        *records = retained;

        let floor = tx_id.min(last.load(Ordering::Acquire) + 1);
        oldest.fetch_max(floor, Ordering::AcqRel);
        removed
    }
}

impl Default for MemoryTxStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl TxStore for MemoryTxStore {
    fn last_committed_tx_id(&self) -> TxId {
        self.last.load(Ordering::Acquire)
    }

    fn oldest_retained_tx_id(&self) -> TxId {
        self.oldest.load(Ordering::Acquire)
    }

    async fn append(&self, record: TxRecord) -> Result<()> {
        let mut records = self.records.write().await;
        check_append(self.last.load(Ordering::Acquire), &record)?;

        let tx_id = record.tx_id;
        records.insert(tx_id, record);
        self.last.store(tx_id, Ordering::Release);

        if self.retention > 0 && records.len() > self.retention {
            let keep_from = tx_id + 1 - self.retention as TxId;
            Self::prune_locked(&mut records, &self.oldest, &self.last, keep_from);
        }

        Ok(())
    }

    async fn read_after(&self, from_exclusive: TxId, max: usize) -> Result<Vec<TxRecord>> {
        let records = self.records.read().await;
        check_readable(from_exclusive, self.oldest.load(Ordering::Acquire))?;

        Ok(records
            .range(from_exclusive.saturating_add(1)..)
            .take(max)
            .map(|(_, record)| record.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn record(tx_id: TxId) -> TxRecord {
        TxRecord::new(tx_id, "primary", format!("tx-{}", tx_id).into_bytes())
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let store = MemoryTxStore::new();
        assert_eq!(store.last_committed_tx_id(), 0);

        for i in 1..=10 {
            store.append(record(i)).await.unwrap();
        }
        assert_eq!(store.last_committed_tx_id(), 10);

        let read = store.read_after(4, 3).await.unwrap();
        let ids: Vec<TxId> = read.iter().map(|r| r.tx_id).collect();
        assert_eq!(ids, vec![5, 6, 7]);

        assert!(store.read_after(10, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_rejects_gap_and_corruption() {
        let store = MemoryTxStore::new();
        store.append(record(1)).await.unwrap();

        match store.append(record(3)).await {
            Err(Error::LogGap { expected, got }) => {
                assert_eq!(expected, 2);
                assert_eq!(got, 3);
            }
            other => panic!("expected gap, got {:?}", other),
        }

        let mut bad = record(2);
        bad.checksum ^= 0xdead_beef;
        assert!(matches!(
            store.append(bad).await,
            Err(Error::LogCorrupted { tx_id: 2, .. })
        ));
        assert_eq!(store.last_committed_tx_id(), 1);
    }

    #[tokio::test]
    async fn test_retention_truncates_reads() {
        let store = MemoryTxStore::with_retention(5);
        for i in 1..=20 {
            store.append(record(i)).await.unwrap();
        }

        assert_eq!(store.len().await, 5);
        assert_eq!(store.oldest_retained_tx_id(), 16);

        assert!(store.read_after(15, 10).await.is_ok());
        match store.read_after(3, 10).await {
            Err(Error::LogTruncated { requested, oldest }) => {
                assert_eq!(requested, 3);
                assert_eq!(oldest, 16);
            }
            other => panic!("expected truncation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_prune_before() {
        let store = MemoryTxStore::new();
        for i in 1..=10 {
            store.append(record(i)).await.unwrap();
        }

        assert_eq!(store.prune_before(6).await, 5);
        assert_eq!(store.oldest_retained_tx_id(), 6);
        assert!(store.read_after(4, 1).await.is_err());
        assert_eq!(store.read_after(5, 1).await.unwrap()[0].tx_id, 6);
    }
}
