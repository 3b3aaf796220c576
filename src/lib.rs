//! txrelay - Replication Coordination for Primary/Replica Clusters
//!
//! Keeps the transaction logs of a primary and its replicas in step. The
//! primary orders every commit into a contiguous transaction log and
//! notifies a configurable number of replicas; replicas pull missing
//! records, sharing one in-flight pull per upstream between every task
//! that needs the replica to catch up.
//!
//! # Architecture
//!
//! - [`txlog`]: the ordered transaction log (file backed or in memory)
//! - [`transport`]: request/response messaging between members
//! - [`membership`]: live members and the current primary
//! - [`replication`]: pull coalescing, push notification and the commit gate
//! - [`context`]: the transaction-context seam over the commit gate
//! - [`node`]: one cluster member wiring all of the above together

pub mod config;
pub mod context;
pub mod error;
pub mod membership;
pub mod node;
pub mod replication;
pub mod transport;
pub mod txlog;

pub use config::TxRelayConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::TxRelayConfig;
    pub use crate::context::{DelegatingTransactionContext, GateTransactionContext, TransactionContext};
    pub use crate::error::{Error, Result};
    pub use crate::membership::ClusterMembership;
    pub use crate::node::ReplicationNode;
    pub use crate::replication::{CommitReceipt, HaSettings, PullCoalescer, PushOutcome, Role};
    pub use crate::transport::{Endpoint, Transport};
    pub use crate::txlog::{TxId, TxRecord, TxStore};
}
