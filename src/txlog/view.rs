//! Transaction Log View
//!
//! Read-only access to the committed log: the current tail and lazy,
//! chunked range streams used to serve pulls.

use std::collections::VecDeque;
use std::sync::Arc;

use super::record::{TxId, TxRecord};
use super::{check_readable, TxStore};
use crate::error::{Error, Result};

/// Default number of records fetched from the store per chunk
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// Read-only view over a transaction store
#[derive(Clone)]
pub struct LogView {
    store: Arc<dyn TxStore>,
    chunk_size: usize,
}

impl LogView {
    /// Create a view with the default chunk size
    pub fn new(store: Arc<dyn TxStore>) -> Self {
        Self::with_chunk_size(store, DEFAULT_CHUNK_SIZE)
    }

    /// Create a view that reads `chunk_size` records at a time
    pub fn with_chunk_size(store: Arc<dyn TxStore>, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Highest committed transaction id
    pub fn last_committed_tx_id(&self) -> TxId {
        self.store.last_committed_tx_id()
    }

    /// First transaction id still readable
    pub fn oldest_retained_tx_id(&self) -> TxId {
        self.store.oldest_retained_tx_id()
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<dyn TxStore> {
        &self.store
    }

    /// Stream records in `(from_exclusive, to_inclusive]`, ascending.
    ///
    /// Fails with [`Error::LogTruncated`] if `from_exclusive` precedes the
    /// oldest retained record. An inverted range yields an empty stream.
    pub fn stream(&self, from_exclusive: TxId, to_inclusive: TxId) -> Result<TxStream> {
        if to_inclusive > from_exclusive {
            check_readable(from_exclusive, self.store.oldest_retained_tx_id())?;
        }

        Ok(TxStream {
            store: Arc::clone(&self.store),
            next_tx_id: from_exclusive.saturating_add(1),
            to_inclusive,
            chunk_size: self.chunk_size,
            buffer: VecDeque::new(),
            finished: to_inclusive <= from_exclusive,
        })
    }
}

/// Finite, non-restartable stream of committed records
///
/// Records are fetched from the store lazily, one chunk at a time.
pub struct TxStream {
    store: Arc<dyn TxStore>,
    next_tx_id: TxId,
    to_inclusive: TxId,
    chunk_size: usize,
    buffer: VecDeque<TxRecord>,
    finished: bool,
}

impl TxStream {
    /// Next record, or `None` once the range is exhausted
    pub async fn next_record(&mut self) -> Result<Option<TxRecord>> {
        if self.finished {
            return Ok(None);
        }

        if self.buffer.is_empty() {
            let remaining = (self.to_inclusive - self.next_tx_id + 1).min(self.chunk_size as u64);
            let chunk = self
                .store
                .read_after(self.next_tx_id - 1, remaining as usize)
                .await?;
            if chunk.is_empty() {
                // Range reaches past the committed tail
                self.finished = true;
                return Ok(None);
            }
            self.buffer.extend(chunk);
        }

        let Some(record) = self.buffer.pop_front() else {
            self.finished = true;
            return Ok(None);
        };

        if record.tx_id != self.next_tx_id {
            self.finished = true;
            return Err(Error::LogGap {
                expected: self.next_tx_id,
                got: record.tx_id,
            });
        }

        if record.tx_id >= self.to_inclusive {
            self.finished = true;
        }
        self.next_tx_id = record.tx_id + 1;
        Ok(Some(record))
    }

    /// Drain the rest of the stream into a vector
    pub async fn collect_all(mut self) -> Result<Vec<TxRecord>> {
        let mut records = Vec::new();
        while let Some(record) = self.next_record().await? {
            records.push(record);
        }
        Ok(records)
    }

    /// Id of the next record the stream will yield
    pub fn position(&self) -> TxId {
        self.next_tx_id
    }
}
