//! In-memory node store, mostly useful for tests and benchmarks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{BlockId, Node, NodeLoader, Result, TreeError, TreeSaver};

/// Content-addressed map from node id to encoded node.
#[derive(Default)]
pub struct MemoryNodeStore {
    blocks: RwLock<HashMap<BlockId, Vec<u8>>>,
    saves: AtomicUsize,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `save_node` calls so far
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

impl NodeLoader for MemoryNodeStore {
    fn load_node(&self, id: &BlockId) -> Result<Arc<Node>> {
        let blocks = self.blocks.read();
        let data = blocks
            .get(id)
            .ok_or_else(|| TreeError::MissingNode { id: id.clone() })?;
        Ok(Arc::new(Node::decode(id.clone(), data)?))
    }
}

impl TreeSaver for &MemoryNodeStore {
    fn save_node(&mut self, encoded: Vec<u8>) -> Result<BlockId> {
        let id = BlockId::for_content(&encoded);
        self.saves.fetch_add(1, Ordering::Relaxed);
        self.blocks.write().entry(id.clone()).or_insert(encoded);
        Ok(id)
    }
}
