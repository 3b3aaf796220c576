//! Replica Endpoints
//!
//! The primary's view of each replica: what it is known to have applied and
//! whether a push to it is outstanding.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::transport::Endpoint;
use crate::txlog::TxId;

/// One replica as seen from the primary
#[derive(Debug)]
pub struct ReplicaEndpoint {
    pub endpoint: Endpoint,
    /// Highest tx the primary has evidence this replica applied
    known_applied_tx_id: AtomicU64,
    /// Shared with any entry that replaces this one after an address change
    push_in_flight: Arc<AtomicBool>,
}

impl ReplicaEndpoint {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            known_applied_tx_id: AtomicU64::new(0),
            push_in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Same member at a new address, keeping its progress and push slot
    fn readdressed(&self, endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            known_applied_tx_id: AtomicU64::new(self.known_applied()),
            push_in_flight: Arc::clone(&self.push_in_flight),
        }
    }

    pub fn id(&self) -> &str {
        &self.endpoint.id
    }

    pub fn known_applied(&self) -> TxId {
        self.known_applied_tx_id.load(Ordering::Acquire)
    }

    /// Record evidence of application; never moves backwards
    pub fn record_applied(&self, tx_id: TxId) {
        self.known_applied_tx_id.fetch_max(tx_id, Ordering::AcqRel);
    }

    /// Claim the push slot; false if a push is already outstanding
    pub fn try_begin_push(&self) -> bool {
        self.push_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn finish_push(&self) {
        self.push_in_flight.store(false, Ordering::Release);
    }

    pub fn push_in_flight(&self) -> bool {
        self.push_in_flight.load(Ordering::Acquire)
    }
}

/// Replicas known to the primary, keyed by id
#[derive(Debug, Default)]
pub struct ReplicaRegistry {
    replicas: RwLock<HashMap<String, Arc<ReplicaEndpoint>>>,
}

impl ReplicaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a replica, keeping existing progress if it is already known
    pub fn add(&self, endpoint: Endpoint) -> Arc<ReplicaEndpoint> {
        let mut replicas = self.replicas.write();
        let entry = replicas
            .entry(endpoint.id.clone())
            .or_insert_with(|| Arc::new(ReplicaEndpoint::new(endpoint.clone())));

        if entry.endpoint != endpoint {
            // Address changed; progress evidence still applies to the member
            *entry = Arc::new(entry.readdressed(endpoint));
        }
        Arc::clone(entry)
    }

    pub fn remove(&self, id: &str) -> Option<Arc<ReplicaEndpoint>> {
        self.replicas.write().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ReplicaEndpoint>> {
        self.replicas.read().get(id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<ReplicaEndpoint>> {
        self.replicas.read().values().cloned().collect()
    }

    /// Record that replica `id` has applied up to `tx_id`
    pub fn record_applied(&self, id: &str, tx_id: TxId) {
        if let Some(replica) = self.get(id) {
            replica.record_applied(tx_id);
        }
    }

    pub fn len(&self) -> usize {
        self.replicas.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.read().is_empty()
    }
}
