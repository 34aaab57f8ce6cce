use std::collections::HashMap;
use std::sync::Arc;

use tfs_btree::{BlockId, Node, NodeLoader, TreeError, TreeSaver};
use tfs_storage::{BlockHandle, BlockStatus, BlockStore};
use tracing::trace;

use crate::cache::NodeCache;

/// Reads nodes from the block store through the node cache.
pub(crate) struct StoreLoader {
    store: Arc<BlockStore>,
    cache: Option<Arc<NodeCache>>,
}

impl StoreLoader {
    pub(crate) fn new(store: Arc<BlockStore>, cache: Option<Arc<NodeCache>>) -> Self {
        Self { store, cache }
    }
}

impl NodeLoader for StoreLoader {
    fn load_node(&self, id: &BlockId) -> tfs_btree::Result<Arc<Node>> {
        if let Some(node) = self.cache.as_ref().and_then(|c| c.get(id)) {
            return Ok(node);
        }
        let block = self
            .store
            .get_block_by_id(id)
            .map_err(TreeError::store)?
            .ok_or_else(|| TreeError::MissingNode { id: id.clone() })?;
        let data = block.data().map_err(TreeError::store)?;
        let node = Arc::new(Node::decode(id.clone(), data)?);
        trace!(id = %id, size = data.len(), "loaded node");
        if let Some(cache) = &self.cache {
            cache.insert(id.clone(), node.clone());
        }
        Ok(node)
    }
}

/// Stages committed nodes in the store without referencing them.
///
/// The handles keep staged blocks pinned until the transaction is done;
/// references appear once a root naming them is published.
pub(crate) struct Stager<'a> {
    pub(crate) store: &'a BlockStore,
    pub(crate) cache: Option<&'a NodeCache>,
    pub(crate) blocks: &'a mut HashMap<BlockId, BlockHandle>,
}

impl TreeSaver for Stager<'_> {
    fn save_node(&mut self, encoded: Vec<u8>) -> tfs_btree::Result<BlockId> {
        let id = BlockId::for_content(&encoded);
        if !self.blocks.contains_key(&id) {
            let handle = self
                .store
                .refer_or_store_block0(&id, BlockStatus::Normal, encoded)
                .map_err(TreeError::store)?;
            self.blocks.insert(id.clone(), handle);
        }
        Ok(id)
    }

    fn node_saved(&mut self, node: &Arc<Node>) {
        if let (Some(cache), Some(id)) = (self.cache, node.id()) {
            cache.insert(id.clone(), node.clone());
        }
    }
}
