//! Replication Protocol
//!
//! Requests and responses exchanged between cluster members.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::replication::Role;
use crate::txlog::{TxId, TxRecord};

/// Requests sent between nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Ask the primary for records after `since`
    PullSince {
        requester: String,
        since: TxId,
        /// Upper bound fixed by the first response of the pull
        up_to: Option<TxId>,
        /// Most records to return in one response
        max: usize,
    },

    /// Tell a replica that `tx_id` is committed on the primary
    PushNotify { primary: String, tx_id: TxId },

    /// Commit a replica-originated write on the primary
    ForwardCommit { origin: String, payload: Bytes },

    /// Ask a node for its status
    Status,
}

/// Responses to [`Request`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Records of a pull, possibly cut short by the response limits
    TxStream {
        records: Vec<TxRecord>,
        /// Primary's committed tail when the response was served
        primary_tail: TxId,
    },

    /// Push acknowledged; the replica has applied up to `applied`
    Ack { applied: TxId },

    /// Request refused
    Nack { reason: NackReason },

    /// Forwarded write committed as `tx_id`
    Committed { tx_id: TxId },

    Status(NodeStatus),
}

/// Why a request was refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NackReason {
    /// Receiver is not the primary
    NotPrimary { primary: Option<String> },
    /// Requested records are no longer retained
    Truncated { oldest: TxId },
    /// Receiver is not in a role that accepts this request
    WrongRole(Role),
    Failed(String),
}

impl std::fmt::Display for NackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NackReason::NotPrimary { primary: Some(p) } => write!(f, "not primary (primary is {})", p),
            NackReason::NotPrimary { primary: None } => write!(f, "not primary (no primary known)"),
            NackReason::Truncated { oldest } => write!(f, "log truncated (oldest retained {})", oldest),
            NackReason::WrongRole(role) => write!(f, "request not accepted in role {}", role),
            NackReason::Failed(reason) => write!(f, "{}", reason),
        }
    }
}

/// Snapshot of a node's replication state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub role: Role,
    pub last_committed: TxId,
    pub oldest_retained: TxId,
    pub primary: Option<String>,
}

impl Request {
    /// Serialize request to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize request from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the request type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Request::PullSince { .. } => "PullSince",
            Request::PushNotify { .. } => "PushNotify",
            Request::ForwardCommit { .. } => "ForwardCommit",
            Request::Status => "Status",
        }
    }
}

impl Response {
    /// Serialize response to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize response from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Response::TxStream { .. } => "TxStream",
            Response::Ack { .. } => "Ack",
            Response::Nack { .. } => "Nack",
            Response::Committed { .. } => "Committed",
            Response::Status(_) => "Status",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Body length
    pub length: u32,
    /// Body checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest body accepted on the wire
    pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            checksum: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pull_response_serialization() {
        let response = Response::TxStream {
            records: vec![TxRecord::new(11, "primary", vec![1, 2, 3])],
            primary_tail: 40,
        };

        let bytes = response.serialize().unwrap();
        match Response::deserialize(&bytes).unwrap() {
            Response::TxStream { records, primary_tail } => {
                assert_eq!(primary_tail, 40);
                assert_eq!(records.len(), 1);
                assert!(records[0].verify().is_ok());
            }
            other => panic!("unexpected response: {}", other.type_name()),
        }
    }

    #[test]
    fn test_nack_reason_display() {
        let reason = NackReason::NotPrimary {
            primary: Some("node-2".into()),
        };
        assert_eq!(reason.to_string(), "not primary (primary is node-2)");
        assert_eq!(
            NackReason::Truncated { oldest: 9 }.to_string(),
            "log truncated (oldest retained 9)"
        );
    }

    #[test]
    fn test_frame_header() {
        let header = FrameHeader::new(b"pull since 7");
        let restored = FrameHeader::from_bytes(&header.to_bytes());

        assert_eq!(restored.length, 12);
        assert_eq!(restored.checksum, header.checksum);
    }
}
