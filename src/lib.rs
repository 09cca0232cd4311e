//! # coordkit
//!
//! Lightweight coordination-service client with sessions, versioned nodes
//! and cached watches.
//!
//! This crate talks to an ensemble: a hierarchical store of small nodes with
//! per-node versions, ephemeral nodes bound to a client session, and one-shot
//! watches. An in-process [`Ensemble`] is included and is what clients
//! connect to through a [`Registry`] of endpoints.
//!
//! ## Features
//!
//! - **Sessions**: keep-alive, connection state tracking, expiry, retry with
//!   exponential backoff
//! - **Nodes**: create (optionally with parents), read, conditional write,
//!   recursive and guaranteed delete
//! - **Watches**: node, children and subtree caches that report every change
//!   exactly once and in order
//! - **HTTP API**: REST for nodes, WebSocket for watch streams
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use coordkit::{
//!     CreateOptions, Ensemble, NodeWatch, Registry, Session, SessionConfig, WatchEvent,
//! };
//!
//! #[tokio::main]
//! async fn main() -> coordkit::Result<()> {
//!     coordkit::logging::try_init().ok();
//!
//!     let registry = Registry::new();
//!     registry.bind("127.0.0.1:2181", Arc::new(Ensemble::default()))?;
//!     let session = Session::connect(&registry, SessionConfig::new("127.0.0.1:2181")).await?;
//!
//!     let (watch, mut events) = NodeWatch::new(&session, "/app1")?;
//!     watch.start(true).await?;
//!
//!     session.create("/app1", Some(b"1".to_vec()), CreateOptions::new()).await?;
//!     while let Some(event) = events.recv().await {
//!         if let WatchEvent::Added(node) = event {
//!             println!("{} created", node.path);
//!             break;
//!         }
//!     }
//!
//!     session.close().await
//! }
//! ```

pub mod api;
pub mod cli;
pub mod config;
pub mod ensemble;
pub mod error;
pub mod logging;
pub mod node;
pub mod path;
pub mod session;
pub mod watch;

// Re-export commonly used types
pub use ensemble::{Ensemble, EnsembleConfig, Registry};
pub use error::{CoordError, Result};
pub use node::{CreateMode, CreateOptions, DeleteOptions, NodeData, Stat, Zxid};
pub use session::{ConnectionState, RetryPolicy, Session, SessionConfig, SessionId};
pub use watch::{ChildrenWatch, NodeWatch, TreeWatch, WatchEvent, WatchEvents, WatchState};
