use std::sync::Arc;

use super::{WatchCache, WatchEvents, WatchState};
use crate::ensemble::WatchScope;
use crate::node::NodeData;
use crate::path;
use crate::session::Session;
use crate::Result;

/// Watches a single node.
///
/// The node need not exist; its creation shows up as
/// [`WatchEvent::Added`](super::WatchEvent::Added) and its deletion as
/// [`WatchEvent::Removed`](super::WatchEvent::Removed).
pub struct NodeWatch {
    session: Session,
    path: String,
    cache: Arc<WatchCache>,
}

impl std::fmt::Debug for NodeWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeWatch")
            .field("session", &self.session)
            .field("path", &self.path)
            .finish()
    }
}

impl NodeWatch {
    /// Register a watch on `path`. Nothing is observed until [`start`](Self::start).
    pub fn new(session: &Session, path: &str) -> Result<(Self, WatchEvents)> {
        path::validate(path)?;
        let (cache, events) = session.attach_watch(WatchScope::Node(path.to_string()))?;
        let watch = Self {
            session: session.clone(),
            path: path.to_string(),
            cache,
        };
        Ok((watch, events))
    }

    /// Load the node and begin delivering events.
    ///
    /// With `load_initial` the current state is cached without an event;
    /// otherwise an existing node is reported as added.
    pub async fn start(&self, load_initial: bool) -> Result<()> {
        let cache = &self.cache;
        self.session
            .retrying("start node watch", |_| cache.start(load_initial))
            .await
    }

    /// Stop delivering events. The watch can be started again.
    pub fn stop(&self) {
        self.cache.stop();
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> WatchState {
        self.cache.state()
    }

    /// The node as last observed, if it exists.
    pub fn current(&self) -> Option<NodeData> {
        self.cache.get(&self.path)
    }
}

impl Drop for NodeWatch {
    fn drop(&mut self) {
        self.session.detach_watch(&self.cache);
    }
}
