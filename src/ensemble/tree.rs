//! Versioned node tree held by the ensemble.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

use super::changelog::{Change, ChangeKind, WatchScope};
use crate::error::CoordError;
use crate::node::{NodeData, Stat, Zxid};
use crate::path::{self, ROOT};
use crate::Result;

#[derive(Debug, Clone)]
struct Znode {
    data: Vec<u8>,
    stat: Stat,
    children: BTreeSet<String>,
}

/// The node tree. Every mutation allocates a fresh zxid and yields one
/// [`Change`] per touched node, in application order.
#[derive(Debug)]
pub(crate) struct DataTree {
    nodes: BTreeMap<String, Znode>,
    last_zxid: Zxid,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl DataTree {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            ROOT.to_string(),
            Znode {
                data: Vec::new(),
                stat: Stat::default(),
                children: BTreeSet::new(),
            },
        );
        Self {
            nodes,
            last_zxid: 0,
        }
    }

    pub fn last_zxid(&self) -> Zxid {
        self.last_zxid
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    fn snapshot(&self, path: &str, node: &Znode) -> NodeData {
        NodeData {
            path: path.to_string(),
            data: node.data.clone(),
            stat: node.stat,
        }
    }

    pub fn get(&self, path: &str) -> Result<NodeData> {
        self.nodes
            .get(path)
            .map(|node| self.snapshot(path, node))
            .ok_or_else(|| CoordError::NotFound(path.to_string()))
    }

    pub fn stat(&self, path: &str) -> Option<Stat> {
        self.nodes.get(path).map(|node| node.stat)
    }

    pub fn children(&self, path: &str) -> Result<Vec<String>> {
        self.nodes
            .get(path)
            .map(|node| node.children.iter().cloned().collect())
            .ok_or_else(|| CoordError::NotFound(path.to_string()))
    }

    /// Create `path`. `owner` is the ephemeral owner, 0 for persistent nodes.
    ///
    /// All checks run before anything is mutated, so a failed create leaves
    /// the tree untouched.
    pub fn create(
        &mut self,
        path: &str,
        data: Vec<u8>,
        owner: u64,
        create_parents: bool,
    ) -> Result<Vec<Change>> {
        path::validate(path)?;
        if self.nodes.contains_key(path) {
            return Err(CoordError::NodeExists(path.to_string()));
        }

        let missing: Vec<String> = path::ancestors(path)
            .into_iter()
            .filter(|p| !self.nodes.contains_key(*p))
            .map(str::to_string)
            .collect();
        if !missing.is_empty() && !create_parents {
            return Err(CoordError::ParentMissing(path.to_string()));
        }

        // Nearest existing ancestor receives the first new child.
        let anchor = match missing.first() {
            Some(first) => path::parent(first),
            None => path::parent(path),
        }
        .unwrap_or(ROOT);
        if self.nodes.get(anchor).map(|n| n.stat.is_ephemeral()).unwrap_or(false) {
            return Err(CoordError::EphemeralParent(anchor.to_string()));
        }

        let mut changes = Vec::with_capacity(missing.len() + 1);
        for ancestor in &missing {
            changes.push(self.insert(ancestor, Vec::new(), 0));
        }
        changes.push(self.insert(path, data, owner));
        Ok(changes)
    }

    fn insert(&mut self, path: &str, data: Vec<u8>, owner: u64) -> Change {
        self.last_zxid += 1;
        let zxid = self.last_zxid;
        let now = now_ms();
        let stat = Stat {
            czxid: zxid,
            mzxid: zxid,
            pzxid: zxid,
            ctime: now,
            mtime: now,
            version: 0,
            cversion: 0,
            ephemeral_owner: owner,
            data_length: data.len() as u32,
            num_children: 0,
        };
        let node = Znode {
            data,
            stat,
            children: BTreeSet::new(),
        };
        let snapshot = self.snapshot(path, &node);
        self.nodes.insert(path.to_string(), node);

        if let Some(parent) = path::parent(path).and_then(|p| self.nodes.get_mut(p)) {
            parent.children.insert(path::name(path).to_string());
            parent.stat.cversion += 1;
            parent.stat.pzxid = zxid;
            parent.stat.num_children = parent.children.len() as u32;
        }

        Change {
            zxid,
            kind: ChangeKind::Created,
            node: snapshot,
        }
    }

    /// Replace the payload, optionally only if the version still matches.
    pub fn set(&mut self, path: &str, data: Vec<u8>, expected: Option<u32>) -> Result<Change> {
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordError::NotFound(path.to_string()))?;

        if let Some(expected) = expected {
            if expected != node.stat.version {
                return Err(CoordError::VersionConflict {
                    path: path.to_string(),
                    expected,
                    actual: node.stat.version,
                });
            }
        }

        self.last_zxid += 1;
        node.stat.version += 1;
        node.stat.mzxid = self.last_zxid;
        node.stat.mtime = now_ms();
        node.stat.data_length = data.len() as u32;
        node.data = data;

        Ok(Change {
            zxid: self.last_zxid,
            kind: ChangeKind::DataChanged,
            node: NodeData {
                path: path.to_string(),
                data: node.data.clone(),
                stat: node.stat,
            },
        })
    }

    /// Delete `path`, and with `recursive` its whole subtree, deepest first.
    pub fn delete(&mut self, path: &str, recursive: bool) -> Result<Vec<Change>> {
        if path == ROOT {
            return Err(CoordError::InvalidPath {
                path: path.to_string(),
                reason: "root cannot be deleted",
            });
        }
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| CoordError::NotFound(path.to_string()))?;
        if !node.children.is_empty() && !recursive {
            return Err(CoordError::NotEmpty(path.to_string()));
        }

        let mut doomed: Vec<String> = self
            .nodes
            .range(path.to_string()..)
            .map(|(p, _)| p)
            .take_while(|p| p.starts_with(path))
            .filter(|p| path::is_within(p, path))
            .cloned()
            .collect();
        doomed.sort_by(|a, b| path::depth(b).cmp(&path::depth(a)).then_with(|| a.cmp(b)));

        Ok(doomed.iter().filter_map(|p| self.remove(p)).collect())
    }

    fn remove(&mut self, path: &str) -> Option<Change> {
        let node = self.nodes.remove(path)?;
        self.last_zxid += 1;
        let zxid = self.last_zxid;

        if let Some(parent) = path::parent(path).and_then(|p| self.nodes.get_mut(p)) {
            parent.children.remove(path::name(path));
            parent.stat.cversion += 1;
            parent.stat.pzxid = zxid;
            parent.stat.num_children = parent.children.len() as u32;
        }

        Some(Change {
            zxid,
            kind: ChangeKind::Deleted,
            node: NodeData {
                path: path.to_string(),
                data: node.data,
                stat: node.stat,
            },
        })
    }

    /// Every node currently in `scope`, in path order.
    pub fn collect(&self, scope: &WatchScope) -> Vec<NodeData> {
        match scope {
            WatchScope::Node(p) => self.get(p).ok().into_iter().collect(),
            WatchScope::Children(p) => match self.nodes.get(p.as_str()) {
                Some(node) => node
                    .children
                    .iter()
                    .filter_map(|name| self.get(&path::join(p, name)).ok())
                    .collect(),
                None => Vec::new(),
            },
            WatchScope::Subtree(p) => self
                .nodes
                .range(p.clone()..)
                .take_while(|(path, _)| path.starts_with(p.as_str()))
                .filter(|(path, _)| path::is_within(path, p))
                .map(|(path, node)| self.snapshot(path, node))
                .collect(),
        }
    }

    /// Paths of all ephemeral nodes owned by `owner`.
    pub fn ephemerals_of(&self, owner: u64) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.stat.ephemeral_owner == owner)
            .map(|(path, _)| path.clone())
            .collect()
    }
}
