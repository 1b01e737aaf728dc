//! Error types for the event-stream engine.

use crate::types::Index;
use thiserror::Error;

/// Why a subscription was forcibly closed by the server side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictionReason {
    /// The publisher (or the server owning it) is shutting down.
    Shutdown,
    /// The subject's mutation log failed and can no longer be trusted.
    LogFailed,
}

impl std::fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionReason::Shutdown => write!(f, "server shutting down"),
            EvictionReason::LogFailed => write!(f, "mutation log failed"),
        }
    }
}

/// Status codes carried by terminal frames on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Cancelled,
    DeadlineExceeded,
    Unavailable,
    FailedPrecondition,
    Aborted,
    Internal,
}

/// Main error type for stream operations.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cursor too old (oldest retained after {oldest}, requested {requested})")]
    CursorTooOld { oldest: Index, requested: Index },

    #[error("snapshot materialization failed: {0}")]
    SnapshotMaterializationFailed(String),

    #[error("writer append failed: {0}")]
    WriterAppendFailed(String),

    #[error("transport closed")]
    TransportClosed,

    #[error("context canceled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("subscription evicted: {0}")]
    Evicted(EvictionReason),

    #[error("subscription closed")]
    SubscriptionClosed,

    #[error("entry not found: {0}")]
    EntryNotFound(String),

    #[error("shutting down")]
    ShuttingDown,

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("connection to {target} failed: {reason}")]
    ConnectionFailed { target: String, reason: String },

    #[error("no servers known for server set {0}")]
    UnknownServerSet(String),

    #[error("stream status {code:?}: {message}")]
    Status { code: StatusCode, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Journal is locked by another process")]
    Locked,

    #[error("Invalid journal format: {0}")]
    InvalidFormat(String),
}

impl StreamError {
    /// True for the errors a caller produces itself by cancelling or by
    /// letting a deadline pass. These are the only errors acceptable while
    /// tearing a stream down.
    pub fn is_cancellation(&self) -> bool {
        match self {
            StreamError::Cancelled | StreamError::DeadlineExceeded => true,
            StreamError::Status { code, .. } => {
                matches!(code, StatusCode::Cancelled | StatusCode::DeadlineExceeded)
            }
            _ => false,
        }
    }

    /// Map to the status code sent in a terminal wire frame.
    pub fn status_code(&self) -> StatusCode {
        match self {
            StreamError::Cancelled => StatusCode::Cancelled,
            StreamError::DeadlineExceeded => StatusCode::DeadlineExceeded,
            StreamError::Evicted(_) | StreamError::ShuttingDown | StreamError::TransportClosed => {
                StatusCode::Unavailable
            }
            StreamError::CursorTooOld { .. } => StatusCode::Aborted,
            StreamError::SnapshotMaterializationFailed(_) | StreamError::WriterAppendFailed(_) => {
                StatusCode::FailedPrecondition
            }
            StreamError::Status { code, .. } => *code,
            _ => StatusCode::Internal,
        }
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(e: serde_json::Error) -> Self {
        StreamError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StreamError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StreamError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StreamError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StreamError::Deserialization(e.to_string())
    }
}

/// Result type for stream operations.
pub type Result<T> = std::result::Result<T, StreamError>;
