//! In-Process Transport
//!
//! Routes calls directly to registered handlers. Supports reachability
//! faults, artificial latency and per-endpoint call counting.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::{Endpoint, Request, RequestHandler, Response, Transport};
use crate::error::{Error, Result};

/// Calls received by one endpoint
#[derive(Debug, Default)]
pub struct CallStats {
    pub pulls: AtomicU64,
    pub pushes: AtomicU64,
    pub forwards: AtomicU64,
    pub status: AtomicU64,
    /// Calls rejected because the endpoint was unreachable
    pub failed: AtomicU64,
}

impl CallStats {
    pub fn pulls(&self) -> u64 {
        self.pulls.load(Ordering::Relaxed)
    }

    pub fn pushes(&self) -> u64 {
        self.pushes.load(Ordering::Relaxed)
    }

    pub fn forwards(&self) -> u64 {
        self.forwards.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// In-process transport shared by every node of an embedded cluster
#[derive(Default)]
pub struct LocalTransport {
    handlers: RwLock<HashMap<String, Weak<dyn RequestHandler>>>,
    unreachable: RwLock<HashSet<String>>,
    latency: RwLock<Duration>,
    stats: RwLock<HashMap<String, Arc<CallStats>>>,
}

impl LocalTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Route calls for `id` to `handler`
    ///
    /// Only a weak reference is kept; dropping the handler makes the
    /// endpoint unreachable.
    pub fn register(&self, id: impl Into<String>, handler: Weak<dyn RequestHandler>) {
        self.handlers.write().insert(id.into(), handler);
    }

    pub fn unregister(&self, id: &str) {
        self.handlers.write().remove(id);
    }

    /// Make an endpoint (un)reachable; calls in progress fail on completion
    pub fn set_reachable(&self, id: &str, reachable: bool) {
        let mut unreachable = self.unreachable.write();
        if reachable {
            unreachable.remove(id);
        } else {
            unreachable.insert(id.to_string());
        }
    }

    /// Delay applied to every call before it is dispatched
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    /// Call counters for an endpoint
    pub fn stats(&self, id: &str) -> Arc<CallStats> {
        Arc::clone(self.stats.write().entry(id.to_string()).or_default())
    }

    fn is_reachable(&self, id: &str) -> bool {
        !self.unreachable.read().contains(id)
    }

    fn unreachable_error(endpoint: &Endpoint) -> Error {
        Error::ConnectionFailed {
            address: endpoint.address.clone(),
            reason: format!("{} is unreachable", endpoint.id),
        }
    }
}

#[async_trait::async_trait]
impl Transport for LocalTransport {
    async fn call(&self, endpoint: &Endpoint, request: Request) -> Result<Response> {
        let stats = self.stats(&endpoint.id);
        let counter = match &request {
            Request::PullSince { .. } => &stats.pulls,
            Request::PushNotify { .. } => &stats.pushes,
            Request::ForwardCommit { .. } => &stats.forwards,
            Request::Status => &stats.status,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if !self.is_reachable(&endpoint.id) {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            return Err(Self::unreachable_error(endpoint));
        }

        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let handler = self
            .handlers
            .read()
            .get(&endpoint.id)
            .and_then(Weak::upgrade);
        let Some(handler) = handler else {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            return Err(Error::ConnectionFailed {
                address: endpoint.address.clone(),
                reason: format!("no handler registered for {}", endpoint.id),
            });
        };

        let response = handler.handle(request).await;

        // Connection dropped while the request was being served
        if !self.is_reachable(&endpoint.id) {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            return Err(Self::unreachable_error(endpoint));
        }
        Ok(response)
    }
}
