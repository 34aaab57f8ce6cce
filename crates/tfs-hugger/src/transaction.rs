//! Hugger transactions: a tree transaction plus the blocks it staged.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tfs_btree::{BlockId, Node};
use tfs_storage::{BlockHandle, BlockStatus};
use tracing::{debug, instrument};

use crate::loader::Stager;
use crate::{Hugger, HuggerError, Result, Root};

/// Mutations against the root that was current when it began.
///
/// Dereferences to the underlying [`tfs_btree::Transaction`] for reads and
/// writes. Dropping it without committing discards the changes and
/// releases every staged block.
pub struct Transaction {
    hugger: Hugger,
    base: Arc<Root>,
    tx: tfs_btree::Transaction,
    blocks: HashMap<BlockId, BlockHandle>,
}

impl Transaction {
    pub(crate) fn new(hugger: Hugger, base: Arc<Root>) -> Self {
        let tx = tfs_btree::Transaction::new(hugger.tree().clone(), base.node.clone());
        Self {
            hugger,
            base,
            tx,
            blocks: HashMap::new(),
        }
    }

    pub fn hugger(&self) -> &Hugger {
        &self.hugger
    }

    /// Root the transaction is based on
    pub fn base_node(&self) -> &Arc<Node> {
        &self.base.node
    }

    /// Stage a data block that a key of this transaction will point at.
    ///
    /// Returns the content id. The block gains its reference once a
    /// published tree names it.
    pub fn store_block_data(&mut self, status: BlockStatus, data: Vec<u8>) -> Result<BlockId> {
        let id = BlockId::for_content(&data);
        if !self.blocks.contains_key(&id) {
            let handle = self
                .hugger
                .store()
                .refer_or_store_block0(&id, status, data)?;
            self.blocks.insert(id.clone(), handle);
        }
        Ok(id)
    }

    /// Number of blocks staged and still pinned by this transaction
    pub fn staged_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Commit if the hugger root is still the one we started from.
    ///
    /// Returns `false` on a lost race; the transaction keeps its changes
    /// and can be merged elsewhere. After a success the transaction
    /// continues from the new root.
    #[instrument(skip(self), fields(name = %self.hugger.name()), level = "debug")]
    pub fn try_commit(&mut self) -> Result<bool> {
        let store = self.hugger.store().clone();
        let id = {
            let mut stager = Stager {
                store: &store,
                cache: self.hugger.cache().map(|c| c.as_ref()),
                blocks: &mut self.blocks,
            };
            self.tx.commit(&mut stager)?
        };
        if !self.tx.is_changed() {
            return Ok(true);
        }

        let block = match self.blocks.remove(&id) {
            Some(block) => block,
            None => store
                .get_block_by_id(&id)?
                .ok_or_else(|| HuggerError::MissingRoot { id: id.clone() })?,
        };
        let root = Arc::new(Root {
            node: self.tx.root().clone(),
            block: Some(block),
        });
        if !self.hugger.swap_root(&self.base, root.clone())? {
            debug!(root = %id, "lost commit race");
            return Ok(false);
        }
        self.tx.reset(root.node.clone());
        self.base = root;
        Ok(true)
    }

    /// Commit, merging into the winner's root until it sticks.
    pub fn commit(mut self) -> Result<()> {
        if self.try_commit()? {
            return Ok(());
        }
        let hugger = self.hugger.clone();
        let merge = hugger
            .merge_callback()
            .cloned()
            .ok_or_else(|| HuggerError::Conflict {
                name: hugger.name().to_string(),
            })?;

        let _retry = hugger.retry_lock().lock();
        let mut failed = self;
        loop {
            let mut fresh = hugger.nested_transaction();
            let src = failed.base.node.clone();
            let dst = failed.tx.root().clone();
            merge(&mut fresh, &src, &dst, true)?;
            if fresh.try_commit()? {
                return Ok(());
            }
            failed = fresh;
        }
    }
}

impl Deref for Transaction {
    type Target = tfs_btree::Transaction;

    fn deref(&self) -> &Self::Target {
        &self.tx
    }
}

impl DerefMut for Transaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.tx
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.blocks.clear();
        self.hugger.transaction_closed();
    }
}
