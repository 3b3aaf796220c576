//! Cluster Membership
//!
//! Tracks which members exist, which of them are reachable and who the
//! primary is. Failure detection lives outside this crate; membership is
//! driven by configuration or by an external detector calling
//! [`ClusterMembership::mark_unavailable`] / [`ClusterMembership::mark_available`].

use std::collections::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use crate::error::{Error, Result};
use crate::transport::Endpoint;

/// Capacity of the membership event channel
const EVENT_CAPACITY: usize = 256;

/// Reachability of a member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    Live,
    Unavailable,
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberStatus::Live => write!(f, "LIVE"),
            MemberStatus::Unavailable => write!(f, "UNAVAILABLE"),
        }
    }
}

/// State of a single member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberState {
    pub endpoint: Endpoint,
    pub status: MemberStatus,
    /// When the member joined
    pub joined_at: chrono::DateTime<chrono::Utc>,
}

impl MemberState {
    fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            status: MemberStatus::Live,
            joined_at: chrono::Utc::now(),
        }
    }

    pub fn is_live(&self) -> bool {
        self.status == MemberStatus::Live
    }
}

/// Membership change notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined(Endpoint),
    Left(String),
    /// The primary changed (`None` when no primary is known)
    PrimaryChanged(Option<Endpoint>),
    Unavailable(String),
    Available(String),
}

struct MembershipInner {
    members: HashMap<String, MemberState>,
    primary: Option<String>,
}

/// Cluster membership tracker
pub struct ClusterMembership {
    /// This node's ID
    node_id: String,
    inner: RwLock<MembershipInner>,
    events: broadcast::Sender<MembershipEvent>,
}

impl ClusterMembership {
    /// Create a membership view containing only this node
    pub fn new(local: Endpoint) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let node_id = local.id.clone();

        let mut members = HashMap::new();
        members.insert(node_id.clone(), MemberState::new(local));

        Self {
            node_id,
            inner: RwLock::new(MembershipInner {
                members,
                primary: None,
            }),
            events,
        }
    }

    /// This node's ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Subscribe to membership changes
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    /// Add a member, or bring a known one back as live
    pub async fn join(&self, endpoint: Endpoint) {
        let event = {
            let mut guard = self.inner.write().await;
            let inner = &mut *guard;
            match inner.members.get_mut(&endpoint.id) {
                Some(member) => {
                    member.endpoint = endpoint.clone();
                    if member.is_live() {
                        None
                    } else {
                        member.status = MemberStatus::Live;
                        Some(MembershipEvent::Available(endpoint.id.clone()))
                    }
                }
                None => {
                    inner
                        .members
                        .insert(endpoint.id.clone(), MemberState::new(endpoint.clone()));
                    Some(MembershipEvent::Joined(endpoint.clone()))
                }
            }
        };

        if let Some(event) = event {
            tracing::info!("Member {} joined", endpoint);
            self.emit(event);
        }
    }

    /// Remove a member; removing the primary clears it
    pub async fn leave(&self, id: &str) {
        let (removed, was_primary) = {
            let mut inner = self.inner.write().await;
            let removed = inner.members.remove(id).is_some();
            let was_primary = inner.primary.as_deref() == Some(id);
            if was_primary {
                inner.primary = None;
            }
            (removed, was_primary)
        };

        if removed {
            tracing::info!("Member {} left", id);
            self.emit(MembershipEvent::Left(id.to_string()));
        }
        if was_primary {
            self.emit(MembershipEvent::PrimaryChanged(None));
        }
    }

    /// Make `id` the primary
    pub async fn set_primary(&self, id: &str) -> Result<()> {
        let endpoint = {
            let mut inner = self.inner.write().await;
            let endpoint = inner
                .members
                .get(id)
                .map(|m| m.endpoint.clone())
                .ok_or_else(|| Error::UnknownMember(id.to_string()))?;
            if inner.primary.as_deref() == Some(id) {
                return Ok(());
            }
            inner.primary = Some(id.to_string());
            endpoint
        };

        tracing::info!("Primary is now {}", endpoint);
        self.emit(MembershipEvent::PrimaryChanged(Some(endpoint)));
        Ok(())
    }

    /// Mark a member as unreachable
    pub async fn mark_unavailable(&self, id: &str) -> Result<()> {
        self.set_status(id, MemberStatus::Unavailable).await
    }

    /// Mark a member as reachable again
    pub async fn mark_available(&self, id: &str) -> Result<()> {
        self.set_status(id, MemberStatus::Live).await
    }

    async fn set_status(&self, id: &str, status: MemberStatus) -> Result<()> {
        let changed = {
            let mut inner = self.inner.write().await;
            let member = inner
                .members
                .get_mut(id)
                .ok_or_else(|| Error::UnknownMember(id.to_string()))?;
            let changed = member.status != status;
            member.status = status;
            changed
        };

        if changed {
            tracing::info!("Member {} is now {}", id, status);
            self.emit(match status {
                MemberStatus::Live => MembershipEvent::Available(id.to_string()),
                MemberStatus::Unavailable => MembershipEvent::Unavailable(id.to_string()),
            });
        }
        Ok(())
    }

    /// The primary, if one is known and reachable
    pub async fn current_primary(&self) -> Option<Endpoint> {
        let inner = self.inner.read().await;
        let id = inner.primary.as_ref()?;
        inner
            .members
            .get(id)
            .filter(|m| m.is_live())
            .map(|m| m.endpoint.clone())
    }

    /// Id of the configured primary, reachable or not
    pub async fn primary_id(&self) -> Option<String> {
        self.inner.read().await.primary.clone()
    }

    /// Live members other than the primary, ordered by id
    pub async fn live_replicas(&self) -> Vec<Endpoint> {
        let inner = self.inner.read().await;
        let mut replicas: Vec<Endpoint> = inner
            .members
            .values()
            .filter(|m| m.is_live() && inner.primary.as_deref() != Some(m.endpoint.id.as_str()))
            .map(|m| m.endpoint.clone())
            .collect();
        replicas.sort_by(|a, b| a.id.cmp(&b.id));
        replicas
    }

    /// Whether `id` is a live member
    pub async fn is_live(&self, id: &str) -> bool {
        self.inner
            .read()
            .await
            .members
            .get(id)
            .map(|m| m.is_live())
            .unwrap_or(false)
    }

    /// State of one member
    pub async fn get(&self, id: &str) -> Option<MemberState> {
        self.inner.read().await.members.get(id).cloned()
    }

    /// All members
    pub async fn members(&self) -> Vec<MemberState> {
        self.inner.read().await.members.values().cloned().collect()
    }

    fn emit(&self, event: MembershipEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
