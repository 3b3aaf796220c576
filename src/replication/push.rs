//! Push Notifier
//!
//! After a commit on the primary, tells up to `push_factor` replicas that
//! the transaction exists. Notifications carry only the TxId; replicas pull
//! the records themselves.

use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use super::{HaSettings, ReplicaEndpoint, ReplicaRegistry};
use crate::error::Error;
use crate::membership::ClusterMembership;
use crate::transport::{Request, Response, Transport};
use crate::txlog::TxId;

/// What a push achieved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutcome {
    pub tx_id: TxId,
    /// Acknowledgements wanted
    pub required: usize,
    /// Replicas known to have applied `tx_id`
    pub acked: usize,
    /// Whether the deadline expired before enough acknowledgements arrived
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl PushOutcome {
    pub fn is_satisfied(&self) -> bool {
        self.acked >= self.required
    }
}

/// Primary-side fan-out of commit notifications
pub struct PushNotifier {
    node_id: String,
    registry: Arc<ReplicaRegistry>,
    membership: Arc<ClusterMembership>,
    transport: Arc<dyn Transport>,
    settings: HaSettings,
    /// Bounds concurrent notifications across all commits
    pool: Arc<Semaphore>,
}

impl PushNotifier {
    pub fn new(
        node_id: impl Into<String>,
        registry: Arc<ReplicaRegistry>,
        membership: Arc<ClusterMembership>,
        transport: Arc<dyn Transport>,
        settings: HaSettings,
    ) -> Self {
        let pool = Arc::new(Semaphore::new(settings.push_workers.max(1)));
        Self {
            node_id: node_id.into(),
            registry,
            membership,
            transport,
            settings,
            pool,
        }
    }

    pub fn registry(&self) -> &Arc<ReplicaRegistry> {
        &self.registry
    }

    /// Notify replicas about `tx_id` and wait for acknowledgements.
    ///
    /// Returns once `push_factor` replicas have applied the transaction or
    /// the push deadline passes. Never fails; shortfalls are logged.
    pub async fn push_after_commit(&self, tx_id: TxId) -> PushOutcome {
        let started = Instant::now();
        let required = self.settings.push_factor;
        if required == 0 {
            return PushOutcome {
                tx_id,
                required,
                acked: 0,
                timed_out: false,
                elapsed: started.elapsed(),
            };
        }

        let (mut acked, candidates) = self.select_candidates(tx_id).await;
        acked = acked.min(required);

        let wanted = required - acked;
        let mut pending = FuturesUnordered::new();
        for replica in candidates {
            if pending.len() >= wanted {
                break;
            }
            if !replica.try_begin_push() {
                tracing::trace!("Skipping {}: push already in flight", replica.endpoint);
                continue;
            }
            pending.push(tokio::spawn(notify(
                replica,
                tx_id,
                self.node_id.clone(),
                Arc::clone(&self.transport),
                Arc::clone(&self.pool),
            )));
        }

        let deadline = tokio::time::sleep(self.settings.push_timeout);
        tokio::pin!(deadline);
        let mut timed_out = false;

        while acked < required && !pending.is_empty() {
            tokio::select! {
                Some(joined) = pending.next() => {
                    if matches!(joined, Ok(true)) {
                        acked += 1;
                    }
                }
                _ = &mut deadline => {
                    timed_out = true;
                    break;
                }
            }
        }
        // Outstanding notifications keep running and clear their own flag

        let outcome = PushOutcome {
            tx_id,
            required,
            acked,
            timed_out,
            elapsed: started.elapsed(),
        };
        if !outcome.is_satisfied() {
            tracing::warn!(
                "{}",
                Error::PushTimeout {
                    tx_id,
                    acked,
                    required
                }
            );
        } else {
            tracing::debug!("Push of tx {} acknowledged in {:?}", tx_id, outcome.elapsed);
        }
        outcome
    }

    /// Count replicas that already applied `tx_id` and order the rest,
    /// freshest first
    async fn select_candidates(&self, tx_id: TxId) -> (usize, Vec<Arc<ReplicaEndpoint>>) {
        let mut already_applied = 0;
        let mut candidates = Vec::new();

        for endpoint in self.membership.live_replicas().await {
            if endpoint.id == self.node_id {
                continue;
            }
            let replica = match self.registry.get(&endpoint.id) {
                Some(replica) => replica,
                None => self.registry.add(endpoint),
            };
            if replica.known_applied() >= tx_id {
                already_applied += 1;
            } else {
                candidates.push(replica);
            }
        }

        candidates.sort_by(|a, b| {
            b.known_applied()
                .cmp(&a.known_applied())
                .then_with(|| a.id().cmp(b.id()))
        });
        (already_applied, candidates)
    }
}

/// Send one notification; true if the replica confirmed `tx_id` applied
async fn notify(
    replica: Arc<ReplicaEndpoint>,
    tx_id: TxId,
    primary: String,
    transport: Arc<dyn Transport>,
    pool: Arc<Semaphore>,
) -> bool {
    let acked = match pool.acquire_owned().await {
        Ok(_permit) => {
            let request = Request::PushNotify { primary, tx_id };
            match transport.call(&replica.endpoint, request).await {
                Ok(Response::Ack { applied }) => {
                    replica.record_applied(applied);
                    applied >= tx_id
                }
                Ok(Response::Nack { reason }) => {
                    tracing::debug!("Push of tx {} to {} refused: {}", tx_id, replica.endpoint, reason);
                    false
                }
                Ok(other) => {
                    tracing::warn!(
                        "Unexpected {} response to push from {}",
                        other.type_name(),
                        replica.endpoint
                    );
                    false
                }
                Err(e) => {
                    tracing::debug!("Push of tx {} to {} failed: {}", tx_id, replica.endpoint, e);
                    false
                }
            }
        }
        Err(_) => false,
    };
    replica.finish_push();
    acked
}
