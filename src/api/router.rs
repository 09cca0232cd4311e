//! API router configuration.

use std::future::IntoFuture;

use axum::{
    routing::{any, get},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers::{
    api_info, create_node, delete_node, get_node, get_root, health, list_sessions, write_node,
    AppState,
};
use super::websocket::{watch_handler, watch_root_handler};
use crate::error::CoordError;

/// Create the API router for the given state.
pub fn create_router(state: AppState) -> Router {
    let node_routes = Router::new().route("/", get(get_root)).route(
        "/{*path}",
        get(get_node)
            .post(create_node)
            .put(write_node)
            .delete(delete_node),
    );

    let watch_routes = Router::new()
        .route("/", any(watch_root_handler))
        .route("/{*path}", any(watch_handler));

    let api_v1 = Router::new()
        .route("/", get(api_info))
        .route("/sessions", get(list_sessions))
        .nest("/nodes", node_routes)
        .nest("/watch", watch_routes);

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_v1)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Finish in-flight requests on shutdown.
    pub graceful_shutdown: bool,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            graceful_shutdown: true,
        }
    }

    pub fn without_graceful_shutdown(mut self) -> Self {
        self.graceful_shutdown = false;
        self
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("127.0.0.1", 3000)
    }
}

/// Serve the API until `shutdown` completes.
pub async fn serve<F>(config: ServerConfig, state: AppState, shutdown: F) -> crate::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let addr = config.bind_address();
    let router = create_router(state);

    tracing::info!("Starting coordkit API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(CoordError::Io)?;

    let result = if config.graceful_shutdown {
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
    } else {
        tokio::select! {
            result = axum::serve(listener, router).into_future() => result,
            _ = shutdown => Ok(()),
        }
    };
    result.map_err(CoordError::Io)
}
