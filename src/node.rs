//! Node model and operation options.

use serde::Serialize;

/// Ensemble-wide transaction id. Every mutation gets the next one.
pub type Zxid = u64;

/// Node metadata, as returned alongside every read and write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Stat {
    /// Zxid of the create.
    pub czxid: Zxid,
    /// Zxid of the last data write.
    pub mzxid: Zxid,
    /// Zxid of the last change to the children list.
    pub pzxid: Zxid,
    /// Creation time, ms since the Unix epoch.
    pub ctime: u64,
    /// Last modification time, ms since the Unix epoch.
    pub mtime: u64,
    /// Number of data writes since creation.
    pub version: u32,
    /// Number of children list changes since creation.
    pub cversion: u32,
    /// Owning session for ephemeral nodes, 0 otherwise.
    pub ephemeral_owner: u64,
    /// Payload length in bytes.
    pub data_length: u32,
    /// Number of immediate children.
    pub num_children: u32,
}

impl Stat {
    /// Whether the node is ephemeral.
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral_owner != 0
    }
}

/// A node snapshot: path, payload and metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeData {
    pub path: String,
    #[serde(serialize_with = "serialize_lossy")]
    pub data: Vec<u8>,
    pub stat: Stat,
}

impl NodeData {
    /// Payload decoded as UTF-8, replacing invalid sequences.
    pub fn data_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

fn serialize_lossy<S: serde::Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(data))
}

/// Node lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateMode {
    /// Lives until explicitly deleted.
    #[default]
    Persistent,
    /// Deleted when the creating session closes or expires.
    Ephemeral,
}

/// Options for creating a node.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateOptions {
    /// Node lifetime.
    pub mode: CreateMode,
    /// Create missing ancestors as persistent nodes.
    pub create_parents: bool,
}

impl CreateOptions {
    /// Default options: persistent, parent must exist.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the node mode.
    pub fn mode(mut self, mode: CreateMode) -> Self {
        self.mode = mode;
        self
    }

    /// Make the node ephemeral.
    pub fn ephemeral(self) -> Self {
        self.mode(CreateMode::Ephemeral)
    }

    /// Create missing ancestors.
    pub fn create_parents(mut self, create: bool) -> Self {
        self.create_parents = create;
        self
    }
}

/// Options for deleting a node.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOptions {
    /// Delete the whole subtree.
    pub recursive: bool,
    /// Keep retrying transient failures until the delete is confirmed.
    pub guaranteed: bool,
}

impl DeleteOptions {
    /// Default options: node must be empty, normal retry budget.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete children too.
    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Retry until confirmed.
    pub fn guaranteed(mut self, guaranteed: bool) -> Self {
        self.guaranteed = guaranteed;
        self
    }
}
