//! Transaction Record Types
//!
//! Defines the committed transaction records that are stored in the
//! transaction log and shipped from the primary to replicas.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Transaction identifier - assigned by the primary at commit time
pub type TxId = u64;

/// A committed transaction
///
/// The payload is opaque to the replication layer; only the storage
/// engine knows how to interpret it. Records are immutable once committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRecord {
    /// Transaction identifier
    pub tx_id: TxId,
    /// Node that committed the transaction
    pub origin: String,
    /// Commit timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Serialized transaction body
    pub payload: Bytes,
    /// CRC32 checksum of the payload
    pub checksum: u32,
}

impl TxRecord {
    /// Create a new record, computing its checksum
    pub fn new(tx_id: TxId, origin: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            tx_id,
            origin: origin.into(),
            timestamp: chrono::Utc::now(),
            checksum: crc32fast::hash(&payload),
            payload,
        }
    }

    /// Verify the payload against the stored checksum
    pub fn verify(&self) -> Result<()> {
        let computed = crc32fast::hash(&self.payload);
        if computed != self.checksum {
            return Err(Error::LogCorrupted {
                tx_id: self.tx_id,
                reason: format!(
                    "checksum mismatch (stored {:08x}, computed {:08x})",
                    self.checksum, computed
                ),
            });
        }
        Ok(())
    }

    /// Payload size in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Statement writes bundled into one transaction payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxPayload {
    pub statements: Vec<Bytes>,
}

impl TxPayload {
    /// Encode the statements into a record payload
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    /// Decode a record payload written by [`TxPayload::encode`]
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_checksum() {
        let record = TxRecord::new(7, "node-1", Bytes::from_static(b"create node"));
        assert_eq!(record.tx_id, 7);
        assert!(record.verify().is_ok());

        let mut corrupted = record.clone();
        corrupted.payload = Bytes::from_static(b"create nodf");
        match corrupted.verify() {
            Err(Error::LogCorrupted { tx_id, .. }) => assert_eq!(tx_id, 7),
            other => panic!("expected corruption, got {:?}", other),
        }
    }

    #[test]
    fn test_payload_statements() {
        let payload = TxPayload {
            statements: vec![Bytes::from_static(b"a"), Bytes::from_static(b"bc")],
        };
        let encoded = payload.encode().unwrap();
        assert_eq!(TxPayload::decode(&encoded).unwrap(), payload);
    }
}
