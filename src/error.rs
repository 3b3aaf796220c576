//! txrelay Error Types

use thiserror::Error;

use crate::txlog::TxId;

/// Result type alias for txrelay operations
pub type Result<T> = std::result::Result<T, Error>;

/// txrelay error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Transaction log errors
    #[error("Log truncated: records after tx {requested} requested, oldest retained is {oldest}")]
    LogTruncated { requested: TxId, oldest: TxId },

    #[error("Log record corrupted at tx {tx_id}: {reason}")]
    LogCorrupted { tx_id: TxId, reason: String },

    #[error("Log gap: expected tx {expected}, got {got}")]
    LogGap { expected: TxId, got: TxId },

    #[error("Log error: {0}")]
    Log(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Replication errors
    #[error("Replication transport to {endpoint} failed: {reason}")]
    ReplicationTransportFailed { endpoint: String, reason: String },

    #[error("Failed to apply replicated tx {tx_id}: {cause}")]
    ReplicationApplyFailed { tx_id: TxId, cause: String },

    #[error("Replication unavailable: {0}")]
    ReplicationUnavailable(String),

    #[error("Push of tx {tx_id} incomplete: {acked}/{required} replicas acknowledged")]
    PushTimeout {
        tx_id: TxId,
        acked: usize,
        required: usize,
    },

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Request rejected by {endpoint}: {reason}")]
    Nack { endpoint: String, reason: String },

    // Commit path errors
    #[error("Transaction failed: {cause}")]
    TransactionFailure { cause: Box<Error> },

    #[error("Transaction already finished")]
    TransactionClosed,

    #[error("Not primary: current primary is {0}")]
    NotPrimary(String),

    // Membership errors
    #[error("Unknown cluster member: {0}")]
    UnknownMember(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Wrap a cause as a failed transaction report
    pub fn transaction_failure(cause: Error) -> Self {
        match cause {
            already @ Error::TransactionFailure { .. } => already,
            cause => Error::TransactionFailure {
                cause: Box::new(cause),
            },
        }
    }

    /// Check if this error is a transport-level failure worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
                | Error::Io(_)
        )
    }

    /// Check if this error means the requested log range is gone
    pub fn is_truncation(&self) -> bool {
        matches!(self, Error::LogTruncated { .. })
    }

    /// The innermost cause of a transaction failure (or self)
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::TransactionFailure { cause } => cause.root_cause(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::ConnectionTimeout("primary:7000".into()).is_retryable());
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(!Error::ReplicationApplyFailed {
            tx_id: 3,
            cause: "checksum".into()
        }
        .is_retryable());
        assert!(!Error::LogTruncated {
            requested: 1,
            oldest: 10
        }
        .is_retryable());
    }

    #[test]
    fn test_transaction_failure_does_not_nest() {
        let err = Error::transaction_failure(Error::ReplicationUnavailable("no primary".into()));
        let err = Error::transaction_failure(err);

        match &err {
            Error::TransactionFailure { cause } => {
                assert!(matches!(**cause, Error::ReplicationUnavailable(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(err.root_cause(), Error::ReplicationUnavailable(_)));
    }
}
