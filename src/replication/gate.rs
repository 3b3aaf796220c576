//! Commit Gate
//!
//! The hook run when a transaction finishes. On the primary it assigns the
//! TxId, appends and pushes; on a replica it forwards the write and waits
//! until the replica has pulled it back.

use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{CoordinatorState, PullCoalescer, PushNotifier, PushOutcome, Role};
use crate::error::{Error, Result};
use crate::transport::{Endpoint, NackReason, Request, Response, Transport};
use crate::txlog::{TxId, TxRecord, TxStore};

/// Routes replica-originated writes to the primary
#[async_trait::async_trait]
pub trait WriteForwarder: Send + Sync {
    /// Commit `payload` on `primary`, returning its TxId
    async fn forward(&self, primary: &Endpoint, payload: Bytes) -> Result<TxId>;
}

/// [`WriteForwarder`] sending `ForwardCommit` requests over a transport
pub struct TransportForwarder {
    origin: String,
    transport: Arc<dyn Transport>,
}

impl TransportForwarder {
    pub fn new(origin: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            origin: origin.into(),
            transport,
        }
    }
}

#[async_trait::async_trait]
impl WriteForwarder for TransportForwarder {
    async fn forward(&self, primary: &Endpoint, payload: Bytes) -> Result<TxId> {
        let request = Request::ForwardCommit {
            origin: self.origin.clone(),
            payload,
        };
        match self.transport.call(primary, request).await? {
            Response::Committed { tx_id } => Ok(tx_id),
            Response::Nack {
                reason: NackReason::NotPrimary { primary: current },
            } => Err(Error::NotPrimary(current.unwrap_or_else(|| "unknown".into()))),
            Response::Nack { reason } => Err(Error::Nack {
                endpoint: primary.to_string(),
                reason: reason.to_string(),
            }),
            other => Err(Error::Network(format!(
                "Unexpected {} response to ForwardCommit",
                other.type_name()
            ))),
        }
    }
}

/// A successful commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    pub tx_id: TxId,
    /// Push result; only set for commits made on the primary
    pub push: Option<PushOutcome>,
}

/// Commit path shared by primary and replica roles
pub struct CommitGate {
    node_id: String,
    store: Arc<dyn TxStore>,
    state: Arc<RwLock<CoordinatorState>>,
    push: Arc<PushNotifier>,
    coalescer: PullCoalescer,
    forwarder: Arc<dyn WriteForwarder>,
    /// Single writer for TxId assignment
    commit_lock: Mutex<()>,
}

impl CommitGate {
    pub fn new(
        node_id: impl Into<String>,
        store: Arc<dyn TxStore>,
        state: Arc<RwLock<CoordinatorState>>,
        push: Arc<PushNotifier>,
        coalescer: PullCoalescer,
        forwarder: Arc<dyn WriteForwarder>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            store,
            state,
            push,
            coalescer,
            forwarder,
            commit_lock: Mutex::new(()),
        }
    }

    /// Commit a locally originated transaction
    ///
    /// Failures are reported as [`Error::TransactionFailure`].
    pub async fn commit(&self, payload: Bytes) -> Result<CommitReceipt> {
        let state = self.state.read().clone();
        match (state.role, state.primary) {
            (Role::Primary, _) => self
                .commit_as_primary(&self.node_id, payload)
                .await
                .map_err(Error::transaction_failure),
            (Role::Replica, Some(primary)) => self.commit_as_replica(&primary, payload).await,
            (role, _) => Err(Error::transaction_failure(Error::ReplicationUnavailable(
                format!("cannot commit in role {} without a primary", role),
            ))),
        }
    }

    /// Commit a write forwarded by replica `origin`; primary only
    pub async fn commit_forwarded(&self, origin: &str, payload: Bytes) -> Result<CommitReceipt> {
        let state = self.state.read().clone();
        if state.role != Role::Primary {
            let primary = state.primary.map(|p| p.id).unwrap_or_else(|| "unknown".into());
            return Err(Error::NotPrimary(primary));
        }
        self.commit_as_primary(origin, payload).await
    }

    async fn commit_as_primary(&self, origin: &str, payload: Bytes) -> Result<CommitReceipt> {
        let tx_id = {
            let _guard = self.commit_lock.lock().await;
            let tx_id = self.store.last_committed_tx_id() + 1;
            self.store.append(TxRecord::new(tx_id, origin, payload)).await?;
            tx_id
        };
        tracing::debug!("Committed tx {} from {}", tx_id, origin);

        // Durable from here on; the push only decides how long we wait
        let push = self.push.push_after_commit(tx_id).await;
        Ok(CommitReceipt {
            tx_id,
            push: Some(push),
        })
    }

    async fn commit_as_replica(&self, primary: &Endpoint, payload: Bytes) -> Result<CommitReceipt> {
        let tx_id = self.forwarder.forward(primary, payload).await.map_err(|e| {
            Error::transaction_failure(Error::ReplicationUnavailable(format!(
                "forwarding to {} failed: {}",
                primary, e
            )))
        })?;

        self.coalescer
            .await_tx(primary, tx_id)
            .await
            .map_err(|e| {
                tracing::warn!("Replica commit of tx {} not confirmed locally: {}", tx_id, e);
                let cause = match e {
                    unavailable @ Error::ReplicationUnavailable(_) => unavailable,
                    other => Error::ReplicationUnavailable(other.to_string()),
                };
                Error::transaction_failure(cause)
            })?;

        Ok(CommitReceipt { tx_id, push: None })
    }
}
