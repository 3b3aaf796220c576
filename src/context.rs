//! Transaction Context Seam
//!
//! The interception point between callers and the commit path. Higher
//! layers wrap a [`TransactionContext`] by composition; the
//! [`DelegatingTransactionContext`] forwards everything unchanged so a
//! wrapper only overrides what it needs.

use bytes::Bytes;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::replication::{CommitGate, CommitReceipt};
use crate::txlog::TxPayload;

/// Write handle for one statement of a transaction
pub struct Statement<'a> {
    writes: &'a mut Vec<Bytes>,
}

impl<'a> Statement<'a> {
    pub fn new(writes: &'a mut Vec<Bytes>) -> Self {
        Self { writes }
    }

    /// Buffer a write for the enclosing transaction
    pub fn write(&mut self, data: impl Into<Bytes>) {
        self.writes.push(data.into());
    }

    /// Writes buffered so far in the transaction
    pub fn pending(&self) -> usize {
        self.writes.len()
    }
}

/// A transaction as seen by the layers above the commit path
#[async_trait::async_trait]
pub trait TransactionContext: Send {
    fn new_statement(&mut self) -> Result<Statement<'_>>;

    fn prepare(&mut self) -> Result<()>;

    /// Commit; `None` when there was nothing to write
    async fn commit(&mut self) -> Result<Option<CommitReceipt>>;

    async fn rollback(&mut self) -> Result<()>;
}

/// Pass-through wrapper around another context
pub struct DelegatingTransactionContext<C> {
    delegate: C,
}

impl<C: TransactionContext> DelegatingTransactionContext<C> {
    pub fn new(delegate: C) -> Self {
        Self { delegate }
    }

    pub fn delegate(&self) -> &C {
        &self.delegate
    }

    pub fn into_inner(self) -> C {
        self.delegate
    }
}

#[async_trait::async_trait]
impl<C: TransactionContext> TransactionContext for DelegatingTransactionContext<C> {
    fn new_statement(&mut self) -> Result<Statement<'_>> {
        self.delegate.new_statement()
    }

    fn prepare(&mut self) -> Result<()> {
        self.delegate.prepare()
    }

    async fn commit(&mut self) -> Result<Option<CommitReceipt>> {
        self.delegate.commit().await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.delegate.rollback().await
    }
}

/// Context that buffers statement writes and commits them through a
/// [`CommitGate`] as one transaction
pub struct GateTransactionContext {
    gate: Arc<CommitGate>,
    writes: Vec<Bytes>,
    prepared: bool,
    finished: bool,
}

impl GateTransactionContext {
    pub fn new(gate: Arc<CommitGate>) -> Self {
        Self {
            gate,
            writes: Vec::new(),
            prepared: false,
            finished: false,
        }
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    fn ensure_open(&self) -> Result<()> {
        if self.finished {
            return Err(Error::TransactionClosed);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl TransactionContext for GateTransactionContext {
    fn new_statement(&mut self) -> Result<Statement<'_>> {
        self.ensure_open()?;
        Ok(Statement::new(&mut self.writes))
    }

    fn prepare(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.prepared = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<Option<CommitReceipt>> {
        self.ensure_open()?;
        self.finished = true;
        if self.writes.is_empty() {
            return Ok(None);
        }

        let payload = TxPayload {
            statements: std::mem::take(&mut self.writes),
        }
        .encode()
        .map_err(Error::transaction_failure)?;
        self.gate.commit(payload).await.map(Some)
    }

    async fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.finished = true;
        self.writes.clear();
        Ok(())
    }
}
