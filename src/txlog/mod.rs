//! Transaction Log Module
//!
//! The local, append-only log of committed transactions and the
//! read-only view the replication layer uses to serve and apply them.

pub mod record;
mod memory;
mod file;
mod view;

pub use record::{TxId, TxPayload, TxRecord};
pub use memory::MemoryTxStore;
pub use file::FileTxStore;
pub use view::{LogView, TxStream};

use crate::error::{Error, Result};

/// Storage engine seam
///
/// `append` is the sole mutator and is serialized by the store. Reads of the
/// committed tail never block.
#[async_trait::async_trait]
pub trait TxStore: Send + Sync {
    /// Highest committed transaction id (0 for an empty log)
    fn last_committed_tx_id(&self) -> TxId;

    /// First transaction id still readable (`last + 1` when nothing is retained)
    fn oldest_retained_tx_id(&self) -> TxId;

    /// Durably append the next transaction
    async fn append(&self, record: TxRecord) -> Result<()>;

    /// Read up to `max` records with ids greater than `from_exclusive`, ascending
    async fn read_after(&self, from_exclusive: TxId, max: usize) -> Result<Vec<TxRecord>>;
}

/// Validate that `record` may follow `last` in the log
pub(crate) fn check_append(last: TxId, record: &TxRecord) -> Result<()> {
    let expected = last + 1;
    if record.tx_id != expected {
        return Err(Error::LogGap {
            expected,
            got: record.tx_id,
        });
    }
    record.verify()
}

/// Validate that records after `from_exclusive` are still retained
pub(crate) fn check_readable(from_exclusive: TxId, oldest: TxId) -> Result<()> {
    if from_exclusive.saturating_add(1) < oldest {
        return Err(Error::LogTruncated {
            requested: from_exclusive,
            oldest,
        });
    }
    Ok(())
}
