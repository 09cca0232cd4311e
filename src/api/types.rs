//! API request and response types.

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::ensemble::SessionInfo;
use crate::error::CoordError;
use crate::node::{NodeData, Stat};
use crate::session::{ConnectionState, Session, SessionId};

/// A node with its children, as returned by `GET /api/v1/nodes/...`.
#[derive(Debug, Clone, Serialize)]
pub struct NodeResponse {
    pub path: String,
    /// Payload, decoded as UTF-8 (lossy).
    pub data: String,
    pub stat: Stat,
    pub children: Vec<String>,
}

impl NodeResponse {
    pub fn new(node: NodeData, children: Vec<String>) -> Self {
        Self {
            data: node.data_lossy(),
            path: node.path,
            stat: node.stat,
            children,
        }
    }
}

/// Request to create a node.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CreateNodeRequest {
    /// Payload; the session's default data when absent.
    #[serde(default)]
    pub data: Option<String>,
    /// Bind the node to the server's session.
    #[serde(default)]
    pub ephemeral: bool,
    /// Create missing ancestors as persistent nodes.
    #[serde(default)]
    pub create_parents: bool,
}

/// Response for node creation.
#[derive(Debug, Clone, Serialize)]
pub struct CreateNodeResponse {
    pub path: String,
}

/// Request to replace a node's data.
#[derive(Debug, Clone, Deserialize)]
pub struct WriteNodeRequest {
    pub data: String,
    /// Reject the write unless the stored version matches.
    #[serde(default)]
    pub expected_version: Option<u32>,
}

/// Query string of `DELETE /api/v1/nodes/...`.
#[derive(Debug, Clone, Copy, Deserialize, Default)]
pub struct DeleteQuery {
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub guaranteed: bool,
}

/// Which watch flavour a WebSocket subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WatchKind {
    #[default]
    Node,
    Children,
    Tree,
}

/// Query string of `GET /api/v1/watch/...`.
#[derive(Debug, Clone, Copy, Deserialize, Default)]
pub struct WatchQuery {
    #[serde(default)]
    pub kind: WatchKind,
    /// Prime the cache silently instead of reporting existing nodes.
    #[serde(default)]
    pub load_initial: bool,
}

/// The API server's own client session.
#[derive(Debug, Clone, Serialize)]
pub struct ClientSessionSummary {
    pub session_id: SessionId,
    pub state: ConnectionState,
    pub endpoint: String,
    pub timeout_ms: u64,
    pub watch_count: usize,
}

impl ClientSessionSummary {
    pub fn from_session(session: &Session) -> Self {
        Self {
            session_id: session.id(),
            state: session.state(),
            endpoint: session.endpoint().to_string(),
            timeout_ms: session.negotiated_timeout().as_millis() as u64,
            watch_count: session.watch_count(),
        }
    }
}

/// List sessions response.
#[derive(Debug, Clone, Serialize)]
pub struct ListSessionsResponse {
    /// Session used by this server.
    pub client: ClientSessionSummary,
    /// Number of live server sessions.
    pub count: usize,
    /// Server-side session table.
    pub sessions: Vec<SessionInfo>,
}

/// Generic API error response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    /// Error code (e.g., "NOT_FOUND").
    pub code: String,
    /// Human-readable error message.
    pub message: String,
    /// Additional details (optional).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("BAD_REQUEST", message)
    }
}

impl From<&CoordError> for ErrorResponse {
    fn from(err: &CoordError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

/// HTTP status for an operation error.
pub fn status_for(err: &CoordError) -> StatusCode {
    match err {
        CoordError::NotFound(_) | CoordError::ParentMissing(_) => StatusCode::NOT_FOUND,
        CoordError::NodeExists(_) | CoordError::NotEmpty(_) | CoordError::VersionConflict { .. } => {
            StatusCode::CONFLICT
        }
        CoordError::InvalidPath { .. }
        | CoordError::InvalidSessionId(_)
        | CoordError::EphemeralParent(_) => StatusCode::BAD_REQUEST,
        CoordError::Connection(_)
        | CoordError::ConnectionLoss
        | CoordError::SessionExpired
        | CoordError::SessionClosed => StatusCode::SERVICE_UNAVAILABLE,
        CoordError::InvalidStateTransition { .. } | CoordError::LockPoisoned | CoordError::Io(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// WebSocket control messages. Watch events are sent as
/// [`WatchEvent`](crate::watch::WatchEvent) JSON alongside these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Client asks the server to stop the watch and close.
    Stop,
    /// Error message.
    Error { code: String, message: String },
    /// Ping/pong for connection health.
    Ping,
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_node_request_default() {
        let req: CreateNodeRequest = serde_json::from_str("{}").unwrap();
        assert!(req.data.is_none());
        assert!(!req.ephemeral);
        assert!(!req.create_parents);
    }

    #[test]
    fn test_write_node_request() {
        let json = r#"{"data": "12", "expected_version": 3}"#;
        let req: WriteNodeRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.data, "12");
        assert_eq!(req.expected_version, Some(3));
    }

    #[test]
    fn test_watch_kind_parse() {
        let q: WatchQuery = serde_json::from_str(r#"{"kind": "tree"}"#).unwrap();
        assert_eq!(q.kind, WatchKind::Tree);
        let q: WatchQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(q.kind, WatchKind::Node);
    }

    #[test]
    fn test_error_mapping() {
        let err = CoordError::VersionConflict {
            path: "/app1".into(),
            expected: 1,
            actual: 2,
        };
        assert_eq!(status_for(&err), StatusCode::CONFLICT);
        assert_eq!(ErrorResponse::from(&err).code, "VERSION_CONFLICT");

        assert_eq!(
            status_for(&CoordError::NotFound("/x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&CoordError::SessionExpired),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_error_response_serialization() {
        let err = ErrorResponse::new("TEST_ERROR", "Test message");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("TEST_ERROR"));
        assert!(!json.contains("details"));
    }

    #[test]
    fn test_ws_message_roundtrip_tags() {
        let msg: WsMessage = serde_json::from_str(r#"{"type": "stop"}"#).unwrap();
        assert!(matches!(msg, WsMessage::Stop));
        let json = serde_json::to_string(&WsMessage::Pong).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);
    }
}
