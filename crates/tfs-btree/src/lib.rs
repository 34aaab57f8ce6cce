//! # tfs-btree
//!
//! Persistent, copy-on-write B+ tree whose nodes are stored as blocks.
//!
//! Nodes are immutable once built. Every mutation inside a [`Transaction`]
//! rewrites the path from the touched leaf to the root, so older roots stay
//! valid snapshots and can be compared cheaply with [`iterate_delta`].
//!
//! ## Node layout
//!
//! ```text
//! leafy node:    [(key, value), ...]            value = user bytes
//! interior node: [(min key of child, child id)] value = child block id
//! encoded:       0x07 ‖ bincode { leafy, children }
//! ```
//!
//! Storage of node blocks is delegated: a [`NodeLoader`] resolves child ids
//! while reading and a [`TreeSaver`] persists new nodes on
//! [`Transaction::commit`].

mod delta;
mod node;
mod stack;
mod store;
mod subtree;
mod transaction;

pub use delta::iterate_delta;
pub use node::{Child, Node, NodeData, NODE_TAG};
pub use store::MemoryNodeStore;
pub use subtree::{prefix_end, SubTree};
pub use transaction::Transaction;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default maximum encoded node size in bytes
pub const DEFAULT_NODE_MAX_SIZE: usize = 4096;

/// Maximum supported tree depth
pub const MAX_DEPTH: usize = 16;

/// Errors that can occur while reading or mutating a tree
#[derive(Error, Debug)]
pub enum TreeError {
    #[error("node {id} not found")]
    MissingNode { id: BlockId },

    #[error("corrupt tree: {0}")]
    Corrupt(String),

    #[error("tree deeper than {MAX_DEPTH} levels")]
    TooDeep,

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("node store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl TreeError {
    /// Wrap an error coming from a node loader or saver
    pub fn store<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        TreeError::Store(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, TreeError>;

/// Opaque block identifier.
///
/// Content-addressed blocks use the 32-byte BLAKE3 hash of their payload,
/// but other node stores are free to use any byte string.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(Vec<u8>);

impl BlockId {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Content address of a payload
    pub fn for_content(data: &[u8]) -> Self {
        Self(blake3::hash(data).as_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        hex::decode(s).ok().map(Self)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        f.write_str(&hex[..hex.len().min(16)])
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self)
    }
}

/// Resolves node ids to decoded nodes.
pub trait NodeLoader: Send + Sync {
    fn load_node(&self, id: &BlockId) -> Result<Arc<Node>>;
}

/// Persists freshly built nodes during commit.
pub trait TreeSaver {
    /// Store an encoded node and return its id
    fn save_node(&mut self, encoded: Vec<u8>) -> Result<BlockId>;

    /// Called once the committed node (with its id) exists
    fn node_saved(&mut self, _node: &Arc<Node>) {}
}

/// Tree configuration plus the loader used to walk stored nodes.
#[derive(Clone)]
pub struct Tree {
    max_size: usize,
    small_size: usize,
    loader: Arc<dyn NodeLoader>,
}

impl Tree {
    pub fn new(loader: Arc<dyn NodeLoader>) -> Self {
        Self::with_max_size(DEFAULT_NODE_MAX_SIZE, loader)
    }

    pub fn with_max_size(max_size: usize, loader: Arc<dyn NodeLoader>) -> Self {
        Self {
            max_size,
            small_size: max_size / 2,
            loader,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Below this encoded size non-root nodes get rebalanced
    pub fn small_size(&self) -> usize {
        self.small_size
    }

    /// Siblings larger than this lend children instead of merging
    pub fn half_size(&self) -> usize {
        self.max_size / 2
    }

    /// An empty leaf root
    pub fn new_root(&self) -> Arc<Node> {
        Arc::new(Node::empty())
    }

    pub fn load_root(&self, id: &BlockId) -> Result<Arc<Node>> {
        self.loader.load_node(id)
    }

    pub fn loader(&self) -> &Arc<dyn NodeLoader> {
        &self.loader
    }

    /// Child `idx` of an interior node, loading it if needed
    pub fn child(&self, node: &Node, idx: usize) -> Result<Arc<Node>> {
        node.child_node(idx, self.loader.as_ref())
    }
}

impl fmt::Debug for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tree")
            .field("max_size", &self.max_size)
            .field("small_size", &self.small_size)
            .finish()
    }
}
