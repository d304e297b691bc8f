//! Error types for cluster operations.
//!
//! Variants fall into the classes callers act on differently: corruption and
//! state-machine failures are fatal for the replica, transient I/O is retried
//! locally before escalating, protocol rejections and timeouts are surfaced to
//! the caller, and bootstrap precondition failures abort without recovery.

use crate::state::StateType;
use causal_core::{CoreError, StoreId};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type for cluster operations.
pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Why a catch-up server refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectionKind {
    /// The requester's store has a different lineage.
    StoreIdMismatch = 1,
    /// The requested entries are no longer in the log.
    Pruned = 2,
    /// The server did not recognise the request.
    UnknownRequest = 3,
    /// The server failed while answering.
    Internal = 4,
}

impl RejectionKind {
    /// Decode a rejection kind tag.
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::StoreIdMismatch),
            2 => Some(Self::Pruned),
            3 => Some(Self::UnknownRequest),
            4 => Some(Self::Internal),
            _ => None,
        }
    }
}

impl std::fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::StoreIdMismatch => "store id mismatch",
            Self::Pruned => "pruned",
            Self::UnknownRequest => "unknown request",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    // ==================== Log ====================
    /// Checksum or header mismatch in persisted data.
    #[error("Corruption in {location}: {cause}")]
    Corruption {
        /// File or structure that failed verification.
        location: PathBuf,
        /// What did not match.
        cause: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Append kept failing after bounded retries.
    #[error("Append failed after {attempts} attempts: {source}")]
    AppendFailed {
        /// Attempts made.
        attempts: u32,
        /// Last I/O error.
        source: std::io::Error,
    },

    /// The log is unusable after an earlier fatal failure.
    #[error("Log has failed and needs operator intervention")]
    LogFailed,

    /// Requested entries have been pruned.
    #[error("Index {requested} has been pruned, first available is {first_available}")]
    Pruned {
        /// The index asked for.
        requested: u64,
        /// Lowest index still in the log.
        first_available: u64,
    },

    /// Truncation point outside the log.
    #[error("Cannot truncate from {from}: log holds ({prev_index}, {append_index}]")]
    InvalidTruncation {
        /// Requested truncation index.
        from: u64,
        /// Index before the first entry.
        prev_index: u64,
        /// Last appended index.
        append_index: u64,
    },

    /// No reader became free within the acquire timeout.
    #[error("Reader pool of {capacity} exhausted, waited {waited:?}")]
    ReaderPoolExhausted {
        /// Pool capacity.
        capacity: usize,
        /// How long the caller waited.
        waited: Duration,
    },

    // ==================== State ====================
    /// An entry arrived out of index order.
    #[error("Out of order: expected index {expected}, got {actual}")]
    OutOfOrder {
        /// Next index the receiver can accept.
        expected: u64,
        /// Index that arrived.
        actual: u64,
    },

    /// A state machine failed to apply an entry.
    #[error("State machine {state_type:?} failed at index {index}: {cause}")]
    StateMachineFailure {
        /// Machine that failed.
        state_type: StateType,
        /// Entry being applied.
        index: u64,
        /// Failure description.
        cause: String,
    },

    /// The replica stopped applying after a fatal failure.
    #[error("Replica has failed at index {index} and must be resynchronized")]
    ReplicaFailed {
        /// Last successfully applied index.
        index: u64,
    },

    /// No state machine handles a content type.
    #[error("No state machine registered for {0:?}")]
    Unroutable(StateType),

    /// A snapshot lacks state for a registered machine.
    #[error("Snapshot is missing state for {0:?}")]
    MissingSnapshotState(StateType),

    /// Flush requested for an index other than the applied one.
    #[error("Flush at {requested} does not match last applied {applied}")]
    FlushOutOfSync {
        /// Index passed to flush.
        requested: u64,
        /// Actual last applied index.
        applied: u64,
    },

    /// Bootstrap precondition failed.
    #[error("{0}")]
    Bootstrap(String),

    // ==================== Catch-up ====================
    /// Peer store has a different lineage.
    #[error("Store id mismatch: local {local}, remote {remote}")]
    StoreIdMismatch {
        /// Our store id.
        local: StoreId,
        /// Peer's store id.
        remote: StoreId,
    },

    /// Peer refused a request.
    #[error("Request to {addr} rejected ({kind}): {message}")]
    Rejected {
        /// Peer address.
        addr: SocketAddr,
        /// Rejection class.
        kind: RejectionKind,
        /// Peer's explanation.
        message: String,
    },

    /// Unrecognised message type on the wire.
    #[error("Unknown message type {message_type} (correlation {correlation_id})")]
    UnknownMessage {
        /// Correlation id of the frame.
        correlation_id: u64,
        /// Offending type tag.
        message_type: u8,
    },

    /// Malformed frame or unexpected response.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No bytes from peer within the inactivity window.
    #[error("Timed out waiting for {addr} after {after:?}")]
    Timeout {
        /// Peer address.
        addr: SocketAddr,
        /// Inactivity window.
        after: Duration,
    },

    /// Peer closed the connection.
    #[error("Connection to {addr} closed")]
    ConnectionClosed {
        /// Peer address.
        addr: SocketAddr,
    },

    /// Could not talk to peer.
    #[error("Connection to {addr} failed: {source}")]
    Connection {
        /// Peer address.
        addr: SocketAddr,
        /// Underlying error.
        source: std::io::Error,
    },

    // ==================== General ====================
    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A background task failed to complete.
    #[error("Task error: {0}")]
    Task(String),

    /// Core primitive error.
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

impl ClusterError {
    /// Build a corruption error.
    pub fn corruption(location: impl Into<PathBuf>, cause: impl Into<String>) -> Self {
        ClusterError::Corruption {
            location: location.into(),
            cause: cause.into(),
        }
    }

    /// Whether the replica cannot continue without resynchronizing.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClusterError::Corruption { .. }
                | ClusterError::AppendFailed { .. }
                | ClusterError::LogFailed
                | ClusterError::StateMachineFailure { .. }
                | ClusterError::ReplicaFailed { .. }
                | ClusterError::Bootstrap(_)
        )
    }

    /// Whether the caller may retry, possibly against another peer.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ClusterError::Timeout { .. }
                | ClusterError::ConnectionClosed { .. }
                | ClusterError::Connection { .. }
                | ClusterError::ReaderPoolExhausted { .. }
        )
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(e: serde_json::Error) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for ClusterError {
    fn from(e: tokio::task::JoinError) -> Self {
        ClusterError::Task(e.to_string())
    }
}
