//! Replication Module
//!
//! Pull coordination between replicas and the primary, and push
//! notification from the primary after each commit.
//!
//! Components, leaves first:
//! - [`PullClient`]: fetches and applies missing transactions from the primary
//! - [`PushNotifier`]: tells `push_factor` replicas about a new commit
//! - [`PullCoalescer`]: collapses concurrent pull demand into at most one
//!   in-flight pull per upstream
//! - [`CommitGate`]: the commit hook tying the above together

mod backoff;
mod coalescer;
mod endpoint;
mod gate;
mod pull_client;
mod push;

pub use backoff::Backoff;
pub use coalescer::{PullCompletion, PullCoalescer, PullFailure, SlotPhase};
pub use endpoint::{ReplicaEndpoint, ReplicaRegistry};
pub use gate::{CommitGate, CommitReceipt, TransportForwarder, WriteForwarder};
pub use pull_client::{PullClient, PullStats};
pub use push::{PushNotifier, PushOutcome};

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::transport::Endpoint;
use crate::txlog::TxId;

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Accepts writes and serves pulls
    Primary,
    /// Applies the primary's log
    Replica,
    /// No usable primary is known
    Unavailable,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Primary => write!(f, "PRIMARY"),
            Role::Replica => write!(f, "REPLICA"),
            Role::Unavailable => write!(f, "UNAVAILABLE"),
        }
    }
}

/// Replication tuning knobs
#[derive(Debug, Clone)]
pub struct HaSettings {
    /// Interval between timed pulls (zero disables them)
    pub pull_interval: Duration,
    /// Replicas notified per commit
    pub push_factor: usize,
    /// Per-commit deadline for push acknowledgements
    pub push_timeout: Duration,
    /// Retries after the first failed pull attempt
    pub pull_retry_max: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Records read from the log per chunk while serving a pull
    pub pull_batch_size: usize,
    /// Most records returned by one pull response
    pub pull_max_records: usize,
    /// Size of the push fan-out pool
    pub push_workers: usize,
}

impl HaSettings {
    /// Pulls in flight per upstream
    pub const MAX_CONCURRENT_PULLS: usize = 1;
}

impl Default for HaSettings {
    fn default() -> Self {
        Self {
            pull_interval: Duration::from_secs(10),
            push_factor: 1,
            push_timeout: Duration::from_secs(30),
            pull_retry_max: 6,
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
            pull_batch_size: 1000,
            pull_max_records: 100_000,
            push_workers: 4,
        }
    }
}

/// Result of a pull
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedRange {
    pub first_applied: TxId,
    pub last_applied: TxId,
    pub count: u64,
}

impl AppliedRange {
    /// Nothing applied; the local tail was already `tail`
    pub fn empty(tail: TxId) -> Self {
        Self {
            first_applied: tail + 1,
            last_applied: tail,
            count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Role and upstream of the local node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorState {
    pub role: Role,
    /// Current primary (set for replicas, and for the primary itself)
    pub primary: Option<Endpoint>,
}

impl Default for CoordinatorState {
    fn default() -> Self {
        Self {
            role: Role::Unavailable,
            primary: None,
        }
    }
}
