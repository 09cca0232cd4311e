//! Error types for coordkit.

use thiserror::Error;

/// Main error type for coordkit operations.
#[derive(Error, Debug)]
pub enum CoordError {
    /// No endpoint could be reached within the retry budget.
    #[error("connection error: {0}")]
    Connection(String),

    /// The connection dropped while a request was in flight.
    ///
    /// This is the only transient error; it is retried per the session's
    /// retry policy.
    #[error("connection lost")]
    ConnectionLoss,

    /// A node already exists at the given path.
    #[error("node already exists: {0}")]
    NodeExists(String),

    /// No node exists at the given path.
    #[error("node not found: {0}")]
    NotFound(String),

    /// The parent of the given path does not exist.
    #[error("parent node missing for: {0}")]
    ParentMissing(String),

    /// The node still has children.
    #[error("node not empty: {0}")]
    NotEmpty(String),

    /// Conditional write rejected because the stored version moved on.
    #[error("version conflict on {path}: expected {expected}, found {actual}")]
    VersionConflict {
        path: String,
        expected: u32,
        actual: u32,
    },

    /// The server session expired; ephemerals and watches are gone.
    #[error("session expired")]
    SessionExpired,

    /// The session was closed by its owner.
    #[error("session closed")]
    SessionClosed,

    /// Path does not follow the `/a/b/c` format.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// Session identifier could not be parsed.
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    /// Ephemeral nodes cannot have children.
    #[error("ephemeral node cannot have children: {0}")]
    EphemeralParent(String),

    /// Invalid state transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Internal lock was poisoned.
    #[error("internal lock poisoned")]
    LockPoisoned,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoordError {
    /// Whether the operation may succeed if simply retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoordError::ConnectionLoss)
    }

    /// Whether the error means the session can no longer be used.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, CoordError::SessionExpired | CoordError::SessionClosed)
    }

    /// Stable machine-readable code, used by the HTTP API.
    pub fn code(&self) -> &'static str {
        match self {
            CoordError::Connection(_) => "CONNECTION_ERROR",
            CoordError::ConnectionLoss => "CONNECTION_LOSS",
            CoordError::NodeExists(_) => "NODE_EXISTS",
            CoordError::NotFound(_) => "NOT_FOUND",
            CoordError::ParentMissing(_) => "PARENT_MISSING",
            CoordError::NotEmpty(_) => "NOT_EMPTY",
            CoordError::VersionConflict { .. } => "VERSION_CONFLICT",
            CoordError::SessionExpired => "SESSION_EXPIRED",
            CoordError::SessionClosed => "SESSION_CLOSED",
            CoordError::InvalidPath { .. } => "INVALID_PATH",
            CoordError::InvalidSessionId(_) => "INVALID_SESSION_ID",
            CoordError::EphemeralParent(_) => "EPHEMERAL_PARENT",
            CoordError::InvalidStateTransition { .. } => "INVALID_STATE",
            CoordError::LockPoisoned => "INTERNAL_ERROR",
            CoordError::Io(_) => "IO_ERROR",
        }
    }
}

/// Convenience Result type for coordkit operations.
pub type Result<T> = std::result::Result<T, CoordError>;
