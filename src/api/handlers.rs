//! REST API handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};

use super::types::{
    status_for, ClientSessionSummary, CreateNodeRequest, CreateNodeResponse, DeleteQuery,
    ErrorResponse, ListSessionsResponse, NodeResponse, WriteNodeRequest,
};
use crate::ensemble::{Ensemble, EnsembleConfig, Registry};
use crate::error::CoordError;
use crate::node::{CreateMode, CreateOptions, DeleteOptions, Stat};
use crate::path::ROOT;
use crate::session::{Session, SessionConfig};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Session all requests run through.
    pub session: Session,
    /// Ensemble behind the session, for inspection.
    pub ensemble: Arc<Ensemble>,
}

impl AppState {
    pub fn new(session: Session) -> Self {
        let ensemble = Arc::clone(session.ensemble());
        Self { session, ensemble }
    }

    /// Start an ensemble in-process, bind it at the config's first endpoint
    /// and connect a session to it.
    pub async fn embedded(
        ensemble_config: EnsembleConfig,
        config: SessionConfig,
    ) -> crate::Result<Self> {
        let registry = Registry::new();
        let ensemble = Arc::new(Ensemble::new(ensemble_config));
        let endpoint = config
            .endpoints
            .first()
            .cloned()
            .ok_or_else(|| CoordError::Connection("no endpoints configured".into()))?;
        registry.bind(endpoint, Arc::clone(&ensemble))?;
        let session = Session::connect(&registry, config).await?;
        Ok(Self { session, ensemble })
    }
}

pub(crate) type ApiError = (StatusCode, Json<ErrorResponse>);

pub(crate) fn api_error(err: CoordError) -> ApiError {
    (status_for(&err), Json(ErrorResponse::from(&err)))
}

/// Wildcard captures arrive without the leading slash.
fn node_path(raw: &str) -> String {
    format!("/{}", raw.trim_start_matches('/'))
}

/// Health check endpoint.
pub async fn health() -> &'static str {
    "OK"
}

/// API information endpoint.
pub async fn api_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "coordkit",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "session": state.session.id(),
        "connection": state.session.state(),
        "nodes": state.ensemble.node_count(),
        "last_zxid": state.ensemble.last_zxid(),
    }))
}

/// List the ensemble's sessions.
pub async fn list_sessions(State(state): State<AppState>) -> Json<ListSessionsResponse> {
    let sessions = state.ensemble.sessions();
    Json(ListSessionsResponse {
        client: ClientSessionSummary::from_session(&state.session),
        count: sessions.len(),
        sessions,
    })
}

async fn read_node(state: &AppState, path: &str) -> Result<Json<NodeResponse>, ApiError> {
    let node = state.session.get(path).await.map_err(api_error)?;
    let children = state.session.list_children(path).await.map_err(api_error)?;
    Ok(Json(NodeResponse::new(node, children)))
}

/// Read the root node.
pub async fn get_root(State(state): State<AppState>) -> Result<Json<NodeResponse>, ApiError> {
    read_node(&state, ROOT).await
}

/// Read a node with its children.
pub async fn get_node(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Json<NodeResponse>, ApiError> {
    read_node(&state, &node_path(&path)).await
}

/// Create a node.
pub async fn create_node(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Json(req): Json<CreateNodeRequest>,
) -> Result<(StatusCode, Json<CreateNodeResponse>), ApiError> {
    let mode = if req.ephemeral {
        CreateMode::Ephemeral
    } else {
        CreateMode::Persistent
    };
    let options = CreateOptions::new()
        .mode(mode)
        .create_parents(req.create_parents);

    let path = state
        .session
        .create(&node_path(&path), req.data.map(String::into_bytes), options)
        .await
        .map_err(api_error)?;

    Ok((StatusCode::CREATED, Json(CreateNodeResponse { path })))
}

/// Replace a node's data.
pub async fn write_node(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Json(req): Json<WriteNodeRequest>,
) -> Result<Json<Stat>, ApiError> {
    let stat = state
        .session
        .write(&node_path(&path), req.data.into_bytes(), req.expected_version)
        .await
        .map_err(api_error)?;
    Ok(Json(stat))
}

/// Delete a node.
pub async fn delete_node(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<StatusCode, ApiError> {
    let options = DeleteOptions::new()
        .recursive(query.recursive)
        .guaranteed(query.guaranteed);
    state
        .session
        .delete(&node_path(&path), options)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}
