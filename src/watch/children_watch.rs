use std::sync::Arc;

use super::{WatchCache, WatchEvents, WatchState};
use crate::ensemble::WatchScope;
use crate::node::NodeData;
use crate::path;
use crate::session::Session;
use crate::Result;

/// Watches the immediate children of a node: additions, removals and data
/// changes of each child. The parent itself is not reported.
pub struct ChildrenWatch {
    session: Session,
    path: String,
    cache: Arc<WatchCache>,
}

impl ChildrenWatch {
    pub fn new(session: &Session, path: &str) -> Result<(Self, WatchEvents)> {
        path::validate(path)?;
        let (cache, events) = session.attach_watch(WatchScope::Children(path.to_string()))?;
        let watch = Self {
            session: session.clone(),
            path: path.to_string(),
            cache,
        };
        Ok((watch, events))
    }

    /// Load the current children and begin delivering events.
    pub async fn start(&self, load_initial: bool) -> Result<()> {
        let cache = &self.cache;
        self.session
            .retrying("start children watch", |_| cache.start(load_initial))
            .await
    }

    pub fn stop(&self) {
        self.cache.stop();
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> WatchState {
        self.cache.state()
    }

    /// Cached children, sorted by path.
    pub fn current_children(&self) -> Vec<NodeData> {
        self.cache.entries()
    }

    /// A cached child by name.
    pub fn child(&self, name: &str) -> Option<NodeData> {
        self.cache.get(&path::join(&self.path, name))
    }
}

impl Drop for ChildrenWatch {
    fn drop(&mut self) {
        self.session.detach_watch(&self.cache);
    }
}
