//! Replication Node
//!
//! Wires the transaction log, membership, transport and replication
//! components of one cluster member, keeps the node's role in step with
//! membership, and serves requests from other members.

use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::context::GateTransactionContext;
use crate::error::{Error, Result};
use crate::membership::{ClusterMembership, MembershipEvent};
use crate::replication::{
    AppliedRange, CommitGate, CommitReceipt, CoordinatorState, HaSettings, PullClient,
    PullCoalescer, PushNotifier, ReplicaRegistry, Role, TransportForwarder,
};
use crate::transport::{
    Endpoint, FrameHeader, NackReason, NodeStatus, Request, RequestHandler, Response, Transport,
};
use crate::txlog::{LogView, TxId, TxRecord, TxStore};

/// Payload bytes served in one pull response, leaving frame headroom for
/// record metadata
const PULL_RESPONSE_BYTES: usize = FrameHeader::MAX_FRAME_SIZE as usize / 2;

/// One cluster member
pub struct ReplicationNode {
    endpoint: Endpoint,
    settings: HaSettings,
    store: Arc<dyn TxStore>,
    log: LogView,
    membership: Arc<ClusterMembership>,
    registry: Arc<ReplicaRegistry>,
    state: Arc<RwLock<CoordinatorState>>,
    coalescer: PullCoalescer,
    push: Arc<PushNotifier>,
    gate: Arc<CommitGate>,
    shutdown: watch::Sender<bool>,
}

impl ReplicationNode {
    /// Build a node and derive its initial role from `membership`
    pub async fn new(
        endpoint: Endpoint,
        settings: HaSettings,
        store: Arc<dyn TxStore>,
        membership: Arc<ClusterMembership>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>> {
        if membership.node_id() != endpoint.id {
            return Err(Error::Config(format!(
                "membership belongs to {}, not {}",
                membership.node_id(),
                endpoint.id
            )));
        }

        let log = LogView::with_chunk_size(Arc::clone(&store), settings.pull_batch_size);
        let registry = Arc::new(ReplicaRegistry::new());
        let state = Arc::new(RwLock::new(CoordinatorState::default()));

        let client = Arc::new(PullClient::new(
            endpoint.id.clone(),
            Arc::clone(&store),
            Arc::clone(&transport),
            settings.clone(),
        ));
        let coalescer = PullCoalescer::new(client, &settings);
        let push = Arc::new(PushNotifier::new(
            endpoint.id.clone(),
            Arc::clone(&registry),
            Arc::clone(&membership),
            Arc::clone(&transport),
            settings.clone(),
        ));
        let forwarder = Arc::new(TransportForwarder::new(endpoint.id.clone(), transport));
        let gate = Arc::new(CommitGate::new(
            endpoint.id.clone(),
            Arc::clone(&store),
            Arc::clone(&state),
            Arc::clone(&push),
            coalescer.clone(),
            forwarder,
        ));
        let (shutdown, _) = watch::channel(false);

        let node = Arc::new(Self {
            endpoint,
            settings,
            store,
            log,
            membership,
            registry,
            state,
            coalescer,
            push,
            gate,
            shutdown,
        });
        node.sync_membership().await;
        Ok(node)
    }

    /// Follow membership events until shutdown
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::downgrade(self);
        let mut events = self.membership.subscribe();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = events.recv() => event,
                    _ = shutdown.changed() => break,
                };
                let Some(node) = node.upgrade() else {
                    break;
                };

                match event {
                    Ok(event) => node.on_membership_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Missed {} membership events, resyncing", missed);
                        node.sync_membership().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("Membership event loop stopped");
        })
    }

    /// Stop the event loop
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn on_membership_event(&self, event: MembershipEvent) {
        if let MembershipEvent::Left(id) = &event {
            self.coalescer.forget(id);
        }
        self.sync_membership().await;
    }

    /// Recompute role, primary and replica registry from membership
    pub async fn sync_membership(&self) {
        let members = self.membership.members().await;
        let primary = self.membership.current_primary().await;

        for member in &members {
            if member.endpoint.id != self.endpoint.id && self.registry.get(&member.endpoint.id).is_none() {
                tracing::info!("Tracking replica {}", member.endpoint);
                self.registry.add(member.endpoint.clone());
            }
        }
        for replica in self.registry.all() {
            if !members.iter().any(|m| m.endpoint.id == replica.id()) {
                tracing::info!("No longer tracking replica {}", replica.endpoint);
                self.registry.remove(replica.id());
            }
        }

        let next = match primary {
            Some(primary) if primary.id == self.endpoint.id => CoordinatorState {
                role: Role::Primary,
                primary: Some(primary),
            },
            Some(primary) => CoordinatorState {
                role: Role::Replica,
                primary: Some(primary),
            },
            None => CoordinatorState::default(),
        };

        let previous = std::mem::replace(&mut *self.state.write(), next.clone());
        if previous == next {
            return;
        }

        tracing::info!(
            "Role {} -> {} (primary: {})",
            previous.role,
            next.role,
            next.primary
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "none".into())
        );

        if let Some(old) = &previous.primary {
            if next.primary.as_ref() != Some(old) {
                self.coalescer.forget(&old.id);
            }
        }
        if let (Role::Replica, Some(primary)) = (next.role, &next.primary) {
            // Catch up with the new (or returning) primary
            self.coalescer.schedule(primary);
        }
    }

    /// Commit a transaction through the commit gate
    pub async fn commit(&self, payload: impl Into<Bytes>) -> Result<CommitReceipt> {
        self.gate.commit(payload.into()).await
    }

    /// Start a buffered transaction
    pub fn begin(&self) -> GateTransactionContext {
        GateTransactionContext::new(Arc::clone(&self.gate))
    }

    /// Make sure this node has what the primary had when the call was made
    pub async fn ensure_up_to_date(&self) -> Result<AppliedRange> {
        let state = self.state();
        match (state.role, state.primary) {
            (Role::Primary, _) => Ok(AppliedRange::empty(self.last_committed_tx_id())),
            (Role::Replica, Some(primary)) => self.coalescer.ensure_up_to_date(&primary).wait().await,
            _ => Err(Error::ReplicationUnavailable("no primary known".into())),
        }
    }

    pub fn status(&self) -> NodeStatus {
        let state = self.state();
        NodeStatus {
            node_id: self.endpoint.id.clone(),
            role: state.role,
            last_committed: self.log.last_committed_tx_id(),
            oldest_retained: self.log.oldest_retained_tx_id(),
            primary: state.primary.map(|p| p.id),
        }
    }

    pub fn id(&self) -> &str {
        &self.endpoint.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn role(&self) -> Role {
        self.state.read().role
    }

    pub fn state(&self) -> CoordinatorState {
        self.state.read().clone()
    }

    pub fn settings(&self) -> &HaSettings {
        &self.settings
    }

    pub fn last_committed_tx_id(&self) -> TxId {
        self.store.last_committed_tx_id()
    }

    pub fn store(&self) -> &Arc<dyn TxStore> {
        &self.store
    }

    pub fn log(&self) -> &LogView {
        &self.log
    }

    pub fn membership(&self) -> &Arc<ClusterMembership> {
        &self.membership
    }

    pub fn registry(&self) -> &Arc<ReplicaRegistry> {
        &self.registry
    }

    pub fn coalescer(&self) -> &PullCoalescer {
        &self.coalescer
    }

    pub fn push_notifier(&self) -> &Arc<PushNotifier> {
        &self.push
    }

    /// This node as a transport handler
    pub fn as_handler(self: &Arc<Self>) -> Weak<dyn RequestHandler> {
        let weak: Weak<Self> = Arc::downgrade(self);
        weak
    }

    async fn serve_pull(&self, requester: &str, since: TxId, up_to: Option<TxId>, max: usize) -> Response {
        let state = self.state();
        if state.role != Role::Primary {
            return Response::Nack {
                reason: NackReason::NotPrimary {
                    primary: state.primary.map(|p| p.id),
                },
            };
        }

        // Asking from `since` shows the requester has applied it
        self.registry.record_applied(requester, since);

        let tail = self.log.last_committed_tx_id();
        let limit = up_to
            .unwrap_or(tail)
            .min(tail)
            .min(since.saturating_add(max.max(1) as u64));

        match self.read_response_records(since, limit).await {
            Ok(records) => {
                tracing::trace!(
                    "Serving {} records after tx {} to {}",
                    records.len(),
                    since,
                    requester
                );
                Response::TxStream {
                    records,
                    primary_tail: tail,
                }
            }
            Err(Error::LogTruncated { oldest, .. }) => {
                tracing::warn!(
                    "{} asked for records after tx {} but the log starts at {}",
                    requester,
                    since,
                    oldest
                );
                Response::Nack {
                    reason: NackReason::Truncated { oldest },
                }
            }
            Err(e) => Response::Nack {
                reason: NackReason::Failed(e.to_string()),
            },
        }
    }

    /// Records in `(since, limit]`, read in log chunks and cut short once
    /// the payload reaches [`PULL_RESPONSE_BYTES`]
    async fn read_response_records(&self, since: TxId, limit: TxId) -> Result<Vec<TxRecord>> {
        let mut stream = self.log.stream(since, limit)?;
        let mut records = Vec::new();
        let mut bytes = 0usize;

        while let Some(record) = stream.next_record().await? {
            bytes += record.len();
            records.push(record);
            if bytes >= PULL_RESPONSE_BYTES && stream.position() <= limit {
                tracing::debug!(
                    "Pull response capped at {} bytes, continuing from tx {}",
                    bytes,
                    stream.position()
                );
                break;
            }
        }
        Ok(records)
    }

    async fn on_push(&self, from: &str, tx_id: TxId) -> Response {
        let state = self.state();
        let primary = match (state.role, state.primary) {
            (Role::Replica, Some(primary)) if primary.id == from => primary,
            (Role::Replica, Some(primary)) => {
                return Response::Nack {
                    reason: NackReason::Failed(format!(
                        "push from {} but primary is {}",
                        from, primary.id
                    )),
                };
            }
            (role, _) => {
                return Response::Nack {
                    reason: NackReason::WrongRole(role),
                };
            }
        };

        self.coalescer.notify_new_tx(&primary, tx_id);
        match self.coalescer.await_tx(&primary, tx_id).await {
            Ok(applied) => Response::Ack { applied },
            Err(e) => Response::Nack {
                reason: NackReason::Failed(e.to_string()),
            },
        }
    }

    async fn on_forward(&self, origin: &str, payload: Bytes) -> Response {
        match self.gate.commit_forwarded(origin, payload).await {
            Ok(receipt) => Response::Committed {
                tx_id: receipt.tx_id,
            },
            Err(Error::NotPrimary(primary)) => Response::Nack {
                reason: NackReason::NotPrimary {
                    primary: Some(primary),
                },
            },
            Err(e) => {
                tracing::warn!("Forwarded commit from {} failed: {}", origin, e);
                Response::Nack {
                    reason: NackReason::Failed(e.to_string()),
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl RequestHandler for ReplicationNode {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::PullSince {
                requester,
                since,
                up_to,
                max,
            } => self.serve_pull(&requester, since, up_to, max).await,
            Request::PushNotify { primary, tx_id } => self.on_push(&primary, tx_id).await,
            Request::ForwardCommit { origin, payload } => self.on_forward(&origin, payload).await,
            Request::Status => Response::Status(self.status()),
        }
    }
}
