//! # tfs-hugger
//!
//! Owns one named B+ tree inside a [`BlockStore`] and hands out
//! transactions against it.
//!
//! The current root lives behind a compare-and-swap cell. A transaction
//! captures the root it started from; committing succeeds only if nobody
//! else swapped the root meanwhile. [`Transaction::commit`] retries lost
//! races by replaying the failed change onto the winner through the
//! configured [`MergeCallback`].
//!
//! Every successful swap points the store name at the new root. Previous
//! roots stay pinned until [`Hugger::flush`], which also publishes the
//! name and makes the tree durable.

mod cache;
mod loader;
mod references;
mod transaction;

pub use cache::NodeCache;
pub use references::tree_references;
pub use transaction::Transaction;

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tfs_btree::{BlockId, Node, Tree, TreeError, DEFAULT_NODE_MAX_SIZE};
use tfs_storage::{BlockHandle, BlockStore, StorageError};
use tracing::{debug, info, instrument};

use crate::loader::StoreLoader;

/// Default number of decoded nodes kept in the node cache
pub const DEFAULT_NODE_CACHE_SIZE: usize = 4096;

#[derive(Error, Debug)]
pub enum HuggerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("commit conflict on {name} and no merge callback")]
    Conflict { name: String },

    #[error("staged root {id} is missing")]
    MissingRoot { id: BlockId },
}

pub type Result<T> = std::result::Result<T, HuggerError>;

/// Replays the change `src -> dst` into a transaction.
///
/// `local` is true when the change comes from a lost commit race on this
/// same hugger rather than from another instance.
pub type MergeCallback =
    Arc<dyn Fn(&mut Transaction, &Arc<Node>, &Arc<Node>, bool) -> Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct HuggerOptions {
    /// Decoded nodes kept in memory; 0 disables the cache
    pub cache_size: usize,
    pub node_max_size: usize,
    pub merge: Option<MergeCallback>,
}

impl Default for HuggerOptions {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_NODE_CACHE_SIZE,
            node_max_size: DEFAULT_NODE_MAX_SIZE,
            merge: None,
        }
    }
}

/// A committed root and the pin keeping its block resident
pub(crate) struct Root {
    pub(crate) node: Arc<Node>,
    pub(crate) block: Option<BlockHandle>,
}

#[derive(Default)]
struct FlushState {
    flushing: bool,
    open: usize,
    old_roots: Vec<Arc<Root>>,
}

struct Inner {
    name: String,
    store: Arc<BlockStore>,
    tree: Tree,
    cache: Option<Arc<NodeCache>>,
    merge: Option<MergeCallback>,
    root: Mutex<Arc<Root>>,
    root_is_new: bool,
    retry: Mutex<()>,
    state: Mutex<FlushState>,
    changed: Condvar,
}

/// Transactional owner of one named tree. Cheap to clone.
#[derive(Clone)]
pub struct Hugger {
    inner: Arc<Inner>,
}

impl Hugger {
    /// Load the tree named `name`, or start an empty one.
    #[instrument(skip(store, options), level = "debug")]
    pub fn open(store: Arc<BlockStore>, name: &str, options: HuggerOptions) -> Result<Self> {
        let cache = (options.cache_size > 0).then(|| Arc::new(NodeCache::new(options.cache_size)));
        let loader = Arc::new(StoreLoader::new(store.clone(), cache.clone()));
        let tree = Tree::with_max_size(options.node_max_size, loader);

        let (node, block) = match store.get_block_id_by_name(name)? {
            Some(id) => {
                let block = store
                    .get_block_by_id(&id)?
                    .ok_or_else(|| HuggerError::MissingRoot { id: id.clone() })?;
                (tree.load_root(&id)?, Some(block))
            }
            None => (tree.new_root(), None),
        };
        let root_is_new = block.is_none();
        info!(name, new = root_is_new, "opened tree");

        Ok(Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                store,
                tree,
                cache,
                merge: options.merge,
                root: Mutex::new(Arc::new(Root { node, block })),
                root_is_new,
                retry: Mutex::new(()),
                state: Mutex::new(FlushState::default()),
                changed: Condvar::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        &self.inner.store
    }

    pub fn tree(&self) -> &Tree {
        &self.inner.tree
    }

    pub fn cache(&self) -> Option<&Arc<NodeCache>> {
        self.inner.cache.as_ref()
    }

    /// True if no root existed under the name when opened
    pub fn root_is_new(&self) -> bool {
        self.inner.root_is_new
    }

    pub fn root_node(&self) -> Arc<Node> {
        self.inner.root.lock().node.clone()
    }

    /// Id of the current root, if it has been committed
    pub fn root_block_id(&self) -> Option<BlockId> {
        let root = self.inner.root.lock();
        root.block.as_ref().map(|block| block.id().clone())
    }

    /// Load the root currently published under another name
    pub fn load_node_by_name(&self, name: &str) -> Result<Option<Arc<Node>>> {
        match self.inner.store.get_block_id_by_name(name)? {
            Some(id) => Ok(Some(self.inner.tree.load_root(&id)?)),
            None => Ok(None),
        }
    }

    /// Start a transaction, waiting for a running flush to finish.
    pub fn transaction(&self) -> Transaction {
        self.begin(false)
    }

    /// Start a transaction even while a flush is waiting for others.
    ///
    /// For code that already runs inside another transaction or flush.
    pub fn nested_transaction(&self) -> Transaction {
        self.begin(true)
    }

    fn begin(&self, force: bool) -> Transaction {
        let mut state = self.inner.state.lock();
        while state.flushing && !force {
            self.inner.changed.wait(&mut state);
        }
        state.open += 1;
        drop(state);
        let root = self.inner.root.lock().clone();
        Transaction::new(self.clone(), root)
    }

    pub(crate) fn transaction_closed(&self) {
        let mut state = self.inner.state.lock();
        state.open = state.open.saturating_sub(1);
        if state.open == 0 {
            self.inner.changed.notify_all();
        }
    }

    /// Swap the root if it is still `expected`.
    ///
    /// On success the previous root is retained until the next flush.
    pub(crate) fn swap_root(&self, expected: &Arc<Root>, new: Arc<Root>) -> Result<bool> {
        let id = new
            .node
            .id()
            .cloned()
            .ok_or_else(|| TreeError::Corrupt("swapping in an uncommitted root".into()))?;
        let old = {
            let mut root = self.inner.root.lock();
            if !Arc::ptr_eq(&root, expected) {
                return Ok(false);
            }
            // Name updates must reach the store in swap order
            self.inner
                .store
                .set_name_to_block_id(&self.inner.name, Some(&id))?;
            std::mem::replace(&mut *root, new)
        };
        self.inner.state.lock().old_roots.push(old);
        debug!(name = %self.inner.name, root = %id, "root swapped");
        Ok(true)
    }

    pub(crate) fn merge_callback(&self) -> Option<&MergeCallback> {
        self.inner.merge.as_ref()
    }

    pub(crate) fn retry_lock(&self) -> &Mutex<()> {
        &self.inner.retry
    }

    /// Run `f` in a transaction and commit, retrying on conflict.
    ///
    /// An error from `f` drops the transaction without committing.
    pub fn update<F, E>(&self, mut f: F) -> std::result::Result<(), E>
    where
        F: FnMut(&mut Transaction) -> std::result::Result<(), E>,
        E: From<HuggerError>,
    {
        self.update_result(|tr| f(tr))
    }

    /// Like [`Hugger::update`], returning what the last run of `f` returned.
    pub fn update_result<T, F, E>(&self, mut f: F) -> std::result::Result<T, E>
    where
        F: FnMut(&mut Transaction) -> std::result::Result<T, E>,
        E: From<HuggerError>,
    {
        // First attempt without the lock since `f` may take a while
        let mut tr = self.transaction();
        let value = f(&mut tr)?;
        if tr.try_commit()? {
            return Ok(value);
        }
        drop(tr);

        let _retry = self.inner.retry.lock();
        loop {
            debug!(name = %self.inner.name, "retrying update");
            let mut tr = self.nested_transaction();
            let value = f(&mut tr)?;
            if tr.try_commit()? {
                return Ok(value);
            }
        }
    }

    /// Make every commit so far durable.
    ///
    /// Blocks new top-level transactions and waits for open ones to
    /// finish, releases superseded roots, then flushes the store.
    #[instrument(skip(self), fields(name = %self.inner.name), level = "debug")]
    pub fn flush(&self) -> Result<()> {
        let released = {
            let mut state = self.inner.state.lock();
            while state.flushing {
                self.inner.changed.wait(&mut state);
            }
            state.flushing = true;
            while state.open > 0 {
                self.inner.changed.wait(&mut state);
            }
            std::mem::take(&mut state.old_roots)
        };
        let n = released.len();
        drop(released);

        let result = self.inner.store.flush();
        {
            let mut state = self.inner.state.lock();
            state.flushing = false;
            self.inner.changed.notify_all();
        }
        let ops = result?;
        debug!(released = n, ops, "flushed");
        Ok(())
    }
}

impl std::fmt::Debug for Hugger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hugger")
            .field("name", &self.inner.name)
            .field("root", &self.root_block_id())
            .finish()
    }
}
