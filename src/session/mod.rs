//! Session management module.
//!
//! A [`Session`] is a long-lived client connection to an ensemble. It keeps
//! itself alive with periodic pings, tracks its [`ConnectionState`], retries
//! transient failures per its [`RetryPolicy`] and routes watch notifications
//! to the caches registered on it.

mod client;
mod id;
mod ops;
mod retry;
mod state;

pub use client::{Session, SessionConfig, DEFAULT_NODE_DATA};
pub use id::SessionId;
pub use retry::RetryPolicy;
pub use state::ConnectionState;
