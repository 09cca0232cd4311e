//! HTTP API over a coordination session.
//!
//! ## Endpoints
//!
//! ### Health & Info
//! - `GET /health` - Health check
//! - `GET /api/v1/` - API information
//! - `GET /api/v1/sessions` - Server-side session table
//!
//! ### Nodes
//! - `GET /api/v1/nodes/{path}` - Read a node and its children
//! - `POST /api/v1/nodes/{path}` - Create a node
//! - `PUT /api/v1/nodes/{path}` - Write a node's data
//! - `DELETE /api/v1/nodes/{path}?recursive=&guaranteed=` - Delete a node
//!
//! ### Watches
//! - `WS /api/v1/watch/{path}?kind=node|children|tree` - Stream watch events
//!
//! ## Example
//!
//! ```no_run
//! use coordkit::api::{serve, AppState, ServerConfig};
//! use coordkit::{EnsembleConfig, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> coordkit::Result<()> {
//!     let state = AppState::embedded(EnsembleConfig::default(), SessionConfig::default()).await?;
//!     serve(ServerConfig::new("127.0.0.1", 3000), state, async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await
//! }
//! ```

pub mod handlers;
pub mod router;
pub mod types;
pub mod websocket;

pub use handlers::AppState;
pub use router::{create_router, serve, ServerConfig};
pub use types::{
    ClientSessionSummary, CreateNodeRequest, CreateNodeResponse, DeleteQuery, ErrorResponse,
    ListSessionsResponse, NodeResponse, WatchKind, WatchQuery, WriteNodeRequest, WsMessage,
};
