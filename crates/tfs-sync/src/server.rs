use std::sync::Arc;

use tfs_btree::{prefix_end, BlockId};
use tfs_codec::{Codec, CodecChain};
use tfs_fs::{merge_to3, BlockKey, Fs, SubType};
use tfs_hugger::{Hugger, HuggerOptions};
use tfs_storage::{BlockStatus, ReferenceCallback};
use tracing::{debug, info, instrument};

use crate::{Result, SyncBlock, SyncEndpoint, SyncError};

/// Name of the tree that holds blocks received for other names
pub const SYNC_ROOT_NAME: &str = "sync";

/// Inode namespace of the name-block keys in the sync tree
const NAME_INO: u64 = 0;

fn name_prefix(name: &str) -> BlockKey {
    let mut data = name.as_bytes().to_vec();
    data.push(0);
    BlockKey::new(NAME_INO, SubType::NameHashBlock, &data)
}

/// Sync endpoint backed by a local filesystem and its store.
///
/// Received blocks are pinned by entries in a tree of its own, published
/// as [`SYNC_ROOT_NAME`] in the same store.
pub struct Server {
    fs: Arc<Fs>,
    hugger: Hugger,
    codec: CodecChain,
    references: ReferenceCallback,
}

impl Server {
    pub fn new(fs: Arc<Fs>, codec: CodecChain) -> Result<Self> {
        let hugger = Hugger::open(
            fs.store().clone(),
            SYNC_ROOT_NAME,
            HuggerOptions {
                merge: None,
                ..HuggerOptions::default()
            },
        )?;
        info!(fs = %fs.options().root_name, "sync server ready");
        Ok(Self {
            fs,
            hugger,
            codec,
            references: tfs_fs::reference_callback(),
        })
    }

    pub fn fs(&self) -> &Arc<Fs> {
        &self.fs
    }

    fn block(&self, id: &BlockId, want_data: bool, want_missing: bool) -> Result<Option<SyncBlock>> {
        let store = self.fs.store();
        let Some(handle) = store.get_block_by_id(id)? else {
            return Ok(None);
        };
        let status = handle.status();
        let data = if want_data {
            Some(self.codec.encode(handle.data()?, id.as_bytes())?)
        } else {
            None
        };
        let mut missing = Vec::new();
        if want_missing && status.is_weak() {
            let mut children = Vec::new();
            (self.references)(id, handle.data()?, &mut |child| children.push(child));
            for child in children {
                if store.get_block_by_id(&child)?.is_none() {
                    missing.push(child);
                }
            }
        }
        Ok(Some(SyncBlock {
            id: id.clone(),
            status,
            data,
            missing,
        }))
    }
}

impl SyncEndpoint for Server {
    fn get_block_id_by_name(&self, name: &str) -> Result<Option<BlockId>> {
        if name == self.fs.options().root_name {
            if let Some(id) = self.fs.hugger().root_block_id() {
                return Ok(Some(id));
            }
        }
        Ok(self.fs.store().get_block_id_by_name(name)?)
    }

    fn get_block_by_id(
        &self,
        id: &BlockId,
        want_data: bool,
        want_missing: bool,
    ) -> Result<Option<SyncBlock>> {
        self.block(id, want_data, want_missing)
    }

    #[instrument(skip(self, block), fields(id = %block.id))]
    fn store_block(&self, name: &str, block: SyncBlock) -> Result<SyncBlock> {
        let encoded = block
            .data
            .as_deref()
            .ok_or_else(|| SyncError::Protocol("block sent without data".into()))?;
        let data = self.codec.decode(encoded, block.id.as_bytes())?;
        let key = BlockKey::name_block(NAME_INO, name.as_bytes(), &block.id);
        self.hugger.update(|tr| -> Result<()> {
            let id = tr.store_block_data(block.status, data.clone())?;
            if id != block.id {
                return Err(SyncError::WrongId {
                    id: block.id.clone(),
                });
            }
            tr.set(key.as_bytes(), id.as_bytes())?;
            Ok(())
        })?;
        debug!(name, "stored block");
        self.block(&block.id, false, true)?
            .ok_or(SyncError::MissingBlock { id: block.id })
    }

    fn set_name_to_block_id(&self, name: &str, id: &BlockId) -> Result<()> {
        self.fs.store().set_name_to_block_id(name, Some(id))?;
        Ok(())
    }

    /// The base of the merge is the `from` tree merged last time, kept
    /// under `from.to`.
    #[instrument(skip(self))]
    fn merge_block_name_to(&self, from: &str, to: &str) -> Result<()> {
        if to != self.fs.options().root_name {
            return Err(SyncError::UnsupportedMerge(to.to_string()));
        }
        let hugger = self.fs.hugger();
        let base_name = format!("{from}.{to}");
        let base = hugger
            .load_node_by_name(&base_name)?
            .unwrap_or_else(|| hugger.tree().new_root());
        let src = hugger
            .load_node_by_name(from)?
            .ok_or_else(|| SyncError::UnknownName(from.to_string()))?;
        if base.id() == src.id() {
            debug!("nothing new to merge");
            return Ok(());
        }
        hugger.update(|tr| merge_to3(tr, &base, &src, false))?;
        self.fs.store().set_name_to_block_id(&base_name, src.id())?;
        info!(root = ?hugger.root_block_id(), "merged remote tree");
        Ok(())
    }

    fn clear_blocks_in_name(&self, name: &str) -> Result<()> {
        let start = name_prefix(name);
        let end = prefix_end(start.as_bytes());
        self.hugger.update(|tr| -> Result<()> {
            tr.delete_range_bounded(start.as_bytes(), end.as_deref())?;
            Ok(())
        })?;
        self.hugger.flush()?;
        self.fs.flush()?;
        Ok(())
    }

    /// A block with missing children stays weak.
    fn upgrade_block_non_weak(&self, id: &BlockId) -> Result<Option<SyncBlock>> {
        let Some(block) = self.block(id, false, true)? else {
            return Ok(None);
        };
        if !block.status.is_weak() || !block.missing.is_empty() {
            return Ok(Some(block));
        }
        self.fs.store().set_block_status(id, BlockStatus::Normal)?;
        debug!(%id, "block upgraded");
        self.block(id, false, true)
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("fs", &self.fs)
            .field("root", &self.hugger.root_block_id())
            .finish()
    }
}
