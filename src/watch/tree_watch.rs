use std::sync::Arc;

use super::{WatchCache, WatchEvents, WatchState};
use crate::ensemble::WatchScope;
use crate::node::NodeData;
use crate::path;
use crate::session::Session;
use crate::Result;

/// Watches a node and its whole subtree at any depth.
pub struct TreeWatch {
    session: Session,
    path: String,
    cache: Arc<WatchCache>,
}

impl TreeWatch {
    pub fn new(session: &Session, path: &str) -> Result<(Self, WatchEvents)> {
        path::validate(path)?;
        let (cache, events) = session.attach_watch(WatchScope::Subtree(path.to_string()))?;
        let watch = Self {
            session: session.clone(),
            path: path.to_string(),
            cache,
        };
        Ok((watch, events))
    }

    /// Load the subtree and begin delivering events.
    pub async fn start(&self, load_initial: bool) -> Result<()> {
        let cache = &self.cache;
        self.session
            .retrying("start tree watch", |_| cache.start(load_initial))
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

    /// Every cached node, sorted by path.
    pub fn current_tree(&self) -> Vec<NodeData> {
        self.cache.entries()
    }

    /// A cached node anywhere in the subtree.
    pub fn get(&self, path: &str) -> Option<NodeData> {
        self.cache.get(path)
    }

    /// Names of the cached children of `parent`.
    pub fn children_of(&self, parent: &str) -> Vec<String> {
        self.cache
            .entries()
            .into_iter()
            .filter(|n| path::parent(&n.path) == Some(parent))
            .map(|n| path::name(&n.path).to_string())
            .collect()
    }
}

impl Drop for TreeWatch {
    fn drop(&mut self) {
        self.session.detach_watch(&self.cache);
    }
}
