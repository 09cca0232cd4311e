//! Bounded log of recent mutations, used to rearm watches without gaps.

use std::collections::VecDeque;

use serde::Serialize;

use crate::node::{NodeData, Zxid};
use crate::path;

/// What happened to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    DataChanged,
    Deleted,
}

/// One mutation of one node. For deletes, `node` is the last state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub zxid: Zxid,
    pub kind: ChangeKind,
    pub node: NodeData,
}

/// Which part of the tree a watch observes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchScope {
    /// Exactly one node, including its creation and deletion.
    Node(String),
    /// The immediate children of a node (not the node itself).
    Children(String),
    /// A node and everything below it.
    Subtree(String),
}

impl WatchScope {
    /// The path the scope is anchored at.
    pub fn root(&self) -> &str {
        match self {
            WatchScope::Node(p) | WatchScope::Children(p) | WatchScope::Subtree(p) => p,
        }
    }

    /// Whether a change at `node_path` is visible to this scope.
    pub fn matches(&self, node_path: &str) -> bool {
        match self {
            WatchScope::Node(p) => node_path == p,
            WatchScope::Children(p) => path::parent(node_path) == Some(p.as_str()),
            WatchScope::Subtree(p) => path::is_within(node_path, p),
        }
    }
}

/// Ring of the most recent changes.
#[derive(Debug)]
pub(crate) struct ChangeLog {
    entries: VecDeque<Change>,
    capacity: usize,
    /// Highest zxid that has been evicted (0 if nothing has been).
    compacted_through: Zxid,
}

impl ChangeLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
            compacted_through: 0,
        }
    }

    pub fn push(&mut self, change: Change) {
        if self.entries.len() == self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                self.compacted_through = evicted.zxid;
            }
        }
        self.entries.push_back(change);
    }

    /// Whether every change after `since` is still retained.
    pub fn covers(&self, since: Zxid) -> bool {
        since >= self.compacted_through
    }

    /// Retained changes in `scope` with zxid greater than `since`, oldest first.
    pub fn since(&self, since: Zxid, scope: &WatchScope) -> Vec<Change> {
        let start = self.entries.partition_point(|c| c.zxid <= since);
        self.entries
            .range(start..)
            .filter(|c| scope.matches(&c.node.path))
            .cloned()
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
