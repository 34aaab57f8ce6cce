//! Immutable tree nodes and their block encoding.

use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::{BlockId, NodeLoader, Result, TreeError};

/// First byte of every encoded node block
pub const NODE_TAG: u8 = 7;

/// Per-child overhead of the encoding (two bincode length prefixes)
const CHILD_OVERHEAD: usize = 16;

/// Fixed encoding overhead: tag, leafy flag, children length prefix
pub(crate) const NODE_OVERHEAD: usize = 1 + 1 + 8;

/// Size reserved for a child id that is not known yet
const PENDING_ID_SIZE: usize = 32;

/// On-disk form of a node (after the tag byte)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeData {
    pub leafy: bool,
    pub children: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Entry of a node.
///
/// In a leaf the value is user data. In an interior node the value is the
/// child's block id, or empty while the child is dirty and not yet committed.
#[derive(Clone)]
pub struct Child {
    key: Vec<u8>,
    value: Vec<u8>,
    node: OnceCell<Arc<Node>>,
}

impl Child {
    pub fn leaf(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key,
            value,
            node: OnceCell::new(),
        }
    }

    /// Interior entry pointing at an in-memory node
    pub fn interior(node: Arc<Node>) -> Self {
        let key = node.min_key().to_vec();
        let value = node
            .id()
            .map(|id| id.as_bytes().to_vec())
            .unwrap_or_default();
        Self {
            key,
            value,
            node: OnceCell::with_value(node),
        }
    }

    /// Interior entry known only by id; loaded on first access
    pub fn stored(key: Vec<u8>, id: &BlockId) -> Self {
        Self {
            key,
            value: id.as_bytes().to_vec(),
            node: OnceCell::new(),
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Id of the child node, if it has one
    pub fn child_id(&self) -> Option<BlockId> {
        (!self.value.is_empty()).then(|| BlockId::from_bytes(self.value.clone()))
    }

    /// The child node if it is already resident
    pub fn loaded(&self) -> Option<&Arc<Node>> {
        self.node.get()
    }

    pub(crate) fn encoded_size(&self, leafy: bool) -> usize {
        let value = if leafy {
            self.value.len()
        } else {
            self.value.len().max(PENDING_ID_SIZE)
        };
        CHILD_OVERHEAD + self.key.len() + value
    }
}

impl fmt::Debug for Child {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Child")
            .field("key", &String::from_utf8_lossy(&self.key))
            .field("value_len", &self.value.len())
            .field("loaded", &self.node.get().is_some())
            .finish()
    }
}

/// B+ tree node. Never mutated after construction.
pub struct Node {
    leafy: bool,
    children: Vec<Child>,
    id: Option<BlockId>,
    size: usize,
}

impl Node {
    pub fn empty() -> Self {
        Self::new(true, Vec::new())
    }

    /// Build an uncommitted node
    pub fn new(leafy: bool, children: Vec<Child>) -> Self {
        let size = NODE_OVERHEAD
            + children
                .iter()
                .map(|c| c.encoded_size(leafy))
                .sum::<usize>();
        Self {
            leafy,
            children,
            id: None,
            size,
        }
    }

    pub(crate) fn with_id(mut self, id: BlockId) -> Self {
        self.id = Some(id);
        self
    }

    /// Decode a stored node block
    pub fn decode(id: BlockId, data: &[u8]) -> Result<Self> {
        let (&tag, body) = data
            .split_first()
            .ok_or_else(|| TreeError::Corrupt(format!("empty node block {id}")))?;
        if tag != NODE_TAG {
            return Err(TreeError::Corrupt(format!(
                "block {id} has tag {tag}, expected {NODE_TAG}"
            )));
        }
        let data: NodeData = bincode::deserialize(body)?;
        let children = if data.leafy {
            data.children
                .into_iter()
                .map(|(k, v)| Child::leaf(k, v))
                .collect()
        } else {
            data.children
                .into_iter()
                .map(|(k, v)| Child::stored(k, &BlockId::from_bytes(v)))
                .collect()
        };
        Ok(Self::new(data.leafy, children).with_id(id))
    }

    /// Encode for storage. Fails if an interior child has no id yet.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if !self.leafy && self.children.iter().any(|c| c.value.is_empty()) {
            return Err(TreeError::Corrupt(
                "encoding interior node with uncommitted children".into(),
            ));
        }
        let data = NodeData {
            leafy: self.leafy,
            children: self
                .children
                .iter()
                .map(|c| (c.key.clone(), c.value.clone()))
                .collect(),
        };
        let mut out = Vec::with_capacity(self.size);
        out.push(NODE_TAG);
        bincode::serialize_into(&mut out, &data)?;
        Ok(out)
    }

    pub(crate) fn into_children(self) -> Vec<Child> {
        self.children
    }

    pub fn is_leafy(&self) -> bool {
        self.leafy
    }

    pub fn children(&self) -> &[Child] {
        &self.children
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn id(&self) -> Option<&BlockId> {
        self.id.as_ref()
    }

    /// Nodes without an id were built by an uncommitted transaction
    pub fn is_dirty(&self) -> bool {
        self.id.is_none()
    }

    /// Estimated encoded size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Smallest key in this subtree; empty for an empty node
    pub fn min_key(&self) -> &[u8] {
        self.children.first().map(|c| c.key()).unwrap_or(&[])
    }

    /// Position of `key` among leaf entries
    pub fn search_leaf(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.children.binary_search_by(|c| c.key.as_slice().cmp(key))
    }

    /// Index of the interior child whose range covers `key`
    pub fn search_interior(&self, key: &[u8]) -> usize {
        self.children
            .partition_point(|c| c.key.as_slice() <= key)
            .saturating_sub(1)
    }

    pub fn child_node(&self, idx: usize, loader: &dyn NodeLoader) -> Result<Arc<Node>> {
        let child = self
            .children
            .get(idx)
            .ok_or_else(|| TreeError::Corrupt(format!("child index {idx} out of range")))?;
        child
            .node
            .get_or_try_init(|| {
                let id = child.child_id().ok_or_else(|| {
                    TreeError::Corrupt("dirty child without resident node".into())
                })?;
                loader.load_node(&id)
            })
            .cloned()
    }

    /// Verify ordering and key invariants of the whole subtree.
    ///
    /// Returns the subtree depth (1 for a leaf).
    pub fn check(&self, loader: &dyn NodeLoader) -> Result<usize> {
        for pair in self.children.windows(2) {
            if pair[0].key >= pair[1].key {
                return Err(TreeError::Corrupt(format!(
                    "children out of order: {:?} >= {:?}",
                    String::from_utf8_lossy(&pair[0].key),
                    String::from_utf8_lossy(&pair[1].key)
                )));
            }
        }
        if self.leafy {
            return Ok(1);
        }
        if self.children.is_empty() {
            return Err(TreeError::Corrupt("empty interior node".into()));
        }
        let mut depth = None;
        for idx in 0..self.children.len() {
            let node = self.child_node(idx, loader)?;
            if node.min_key() != self.children[idx].key.as_slice() {
                return Err(TreeError::Corrupt(format!(
                    "interior key {:?} differs from subtree minimum {:?}",
                    String::from_utf8_lossy(&self.children[idx].key),
                    String::from_utf8_lossy(node.min_key())
                )));
            }
            let d = node.check(loader)?;
            if *depth.get_or_insert(d) != d {
                return Err(TreeError::Corrupt("unbalanced subtree".into()));
            }
        }
        Ok(depth.unwrap_or(0) + 1)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("leafy", &self.leafy)
            .field("len", &self.children.len())
            .field("size", &self.size)
            .field("id", &self.id)
            .finish()
    }
}
