//! Log-structured backend in a single `db` file.
//!
//! ## File layout
//!
//! ```text
//! 0        64K                 1M      1M+64K              16M
//! ┌────────┬───────────────────┬───────┬───────────────────┬──── ...
//! │ super  │ nodes, block data │ super │ nodes, block data │ super
//! └────────┴───────────────────┴───────┴───────────────────┴──── ...
//! ```
//!
//! A private B+ tree, stored in the same file, maps
//! - `"b" ‖ id` → [`BlockRecord`]
//! - `"n" ‖ name` → id
//!
//! and holds the free space index (see `space`). Tree nodes are written at
//! the end of the file during flush and named by their location. The
//! newest intact superblock points at the root; extents freed by a flush
//! become reusable only after its superblock is durable.

mod space;
mod superblock;

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tfs_btree::{Node, NodeLoader, Transaction, Tree, TreeError, TreeSaver};
use tracing::{debug, info, instrument, warn};

use self::superblock::{Superblock, MAX_PENDING_FREE, SUPERBLOCK_SIZE};
use super::{Backend, DiskStats};
use crate::{BlockId, BlockMetadata, Result, StorageError};

const BLOCK_PREFIX: u8 = b'b';
const NAME_PREFIX: u8 = b'n';

/// Where a block lives and what is known about it
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlockRecord {
    len: u64,
    locations: Vec<(u64, u64)>,
    meta: BlockMetadata,
}

fn prefixed(prefix: u8, body: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + body.len());
    key.push(prefix);
    key.extend_from_slice(body);
    key
}

/// Node ids are their extent list, 16 bytes per extent
fn locations_to_id(locations: &[(u64, u64)]) -> BlockId {
    let mut bytes = Vec::with_capacity(locations.len() * 16);
    for (offset, size) in locations {
        bytes.extend_from_slice(&offset.to_be_bytes());
        bytes.extend_from_slice(&size.to_be_bytes());
    }
    BlockId::from_bytes(bytes)
}

fn id_to_locations(id: &BlockId) -> std::result::Result<Vec<(u64, u64)>, TreeError> {
    let bytes = id.as_bytes();
    if bytes.is_empty() || bytes.len() % 16 != 0 {
        return Err(TreeError::Corrupt(format!("bad node location {id:?}")));
    }
    Ok(bytes
        .chunks_exact(16)
        .map(|c| {
            let mut offset = [0u8; 8];
            let mut size = [0u8; 8];
            offset.copy_from_slice(&c[..8]);
            size.copy_from_slice(&c[8..]);
            (u64::from_be_bytes(offset), u64::from_be_bytes(size))
        })
        .collect())
}

fn read_extents(file: &File, locations: &[(u64, u64)], len: u64) -> std::io::Result<Vec<u8>> {
    let mut out = vec![0u8; len as usize];
    let mut at = 0usize;
    for &(offset, size) in locations {
        if at == out.len() {
            break;
        }
        let n = (size as usize).min(out.len() - at);
        file.read_exact_at(&mut out[at..at + n], offset)?;
        at += n;
    }
    Ok(out)
}

fn write_extents(file: &File, locations: &[(u64, u64)], data: &[u8]) -> std::io::Result<()> {
    let mut rest = data;
    for &(offset, size) in locations {
        let n = (size as usize).min(rest.len());
        file.write_all_at(&rest[..n], offset)?;
        rest = &rest[n..];
    }
    Ok(())
}

/// Reads tree nodes straight from the file
struct NodeFile {
    file: Arc<File>,
}

impl NodeLoader for NodeFile {
    fn load_node(&self, id: &BlockId) -> tfs_btree::Result<Arc<Node>> {
        let locations = id_to_locations(id)?;
        let size: u64 = locations.iter().map(|(_, s)| s).sum();
        let raw = read_extents(&self.file, &locations, size).map_err(TreeError::store)?;
        let len = raw
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_le_bytes)
            .ok_or_else(|| TreeError::Corrupt(format!("short node {id:?}")))?
            as usize;
        let body = raw
            .get(4..4 + len)
            .ok_or_else(|| TreeError::Corrupt(format!("truncated node {id:?}")))?;
        Ok(Arc::new(Node::decode(id.clone(), body)?))
    }
}

/// Appends committed nodes at the end of the file
struct NodeWriter<'a> {
    file: &'a File,
    file_end: &'a mut u64,
    gaps: Vec<(u64, u64)>,
    /// Ids referenced by freshly written interior nodes
    referenced: HashSet<BlockId>,
}

impl TreeSaver for NodeWriter<'_> {
    fn save_node(&mut self, encoded: Vec<u8>) -> tfs_btree::Result<BlockId> {
        let mut buf = Vec::with_capacity(4 + encoded.len());
        buf.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        buf.extend_from_slice(&encoded);
        let size = space::round_up(buf.len() as u64);
        // Nodes are read back by their full extent, even the last one in the file
        buf.resize(size as usize, 0);
        let (offset, gaps) = space::place_at_end(*self.file_end, size);
        self.gaps.extend(gaps);
        self.file
            .write_all_at(&buf, offset)
            .map_err(TreeError::store)?;
        *self.file_end = offset + size;
        Ok(locations_to_id(&[(offset, size)]))
    }

    fn node_saved(&mut self, node: &Arc<Node>) {
        if !node.is_leafy() {
            self.referenced
                .extend(node.children().iter().filter_map(|c| c.child_id()));
        }
    }
}

/// Ids of nodes reachable from `node` but not from the new tree
fn collect_garbage(
    tree: &Tree,
    node: &Arc<Node>,
    keep: &HashSet<BlockId>,
    out: &mut Vec<BlockId>,
) -> Result<()> {
    let Some(id) = node.id() else {
        return Ok(());
    };
    if keep.contains(id) {
        return Ok(());
    }
    out.push(id.clone());
    if node.is_leafy() {
        return Ok(());
    }
    for (idx, child) in node.children().iter().enumerate() {
        if child.child_id().is_some_and(|id| keep.contains(&id)) {
            continue;
        }
        let sub = tree.child(node, idx)?;
        collect_garbage(tree, &sub, keep, out)?;
    }
    Ok(())
}

struct State {
    tx: Transaction,
    /// Root referenced by the newest superblock
    durable_root: Arc<Node>,
    file_end: u64,
    generation: u64,
    slot: u64,
    bytes_used: u64,
    /// Extents released since the last flush
    pending_free: Vec<(u64, u64)>,
    dirty: bool,
}

pub struct LogBackend {
    path: PathBuf,
    file: Arc<File>,
    tree: Tree,
    max_size: Option<u64>,
    state: Mutex<State>,
    stats: DiskStats,
}

impl LogBackend {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::open_with_limit(dir, None)
    }

    /// Open with the file capped at `max_size` bytes of block data
    pub fn open_with_limit<P: AsRef<Path>>(dir: P, max_size: Option<u64>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join("db");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let len = file.metadata()?.len();
        let file = Arc::new(file);
        let tree = Tree::new(Arc::new(NodeFile { file: file.clone() }));

        let newest = superblock::slots(len)
            .into_iter()
            .filter_map(|slot| Superblock::read(&file, slot).map(|sb| (slot, sb)))
            .max_by_key(|(_, sb)| sb.generation);

        let state = match newest {
            Some((slot, sb)) => {
                let root = tree.load_root(&locations_to_id(&sb.root))?;
                let mut tx = Transaction::new(tree.clone(), root.clone());
                for &(offset, size) in &sb.pending_free {
                    space::release(&mut tx, offset, size)?;
                }
                info!(
                    path = %path.display(),
                    generation = sb.generation,
                    bytes_total = sb.bytes_total,
                    "opened log backend"
                );
                State {
                    tx,
                    durable_root: root,
                    file_end: sb.bytes_total,
                    generation: sb.generation,
                    slot,
                    bytes_used: sb.bytes_used,
                    pending_free: Vec::new(),
                    dirty: false,
                }
            }
            None if len > 0 => {
                return Err(StorageError::Corrupt(format!(
                    "{} has no intact superblock",
                    path.display()
                )));
            }
            None => {
                let root = tree.new_root();
                State {
                    tx: Transaction::new(tree.clone(), root.clone()),
                    durable_root: root,
                    file_end: SUPERBLOCK_SIZE,
                    generation: 0,
                    slot: 0,
                    bytes_used: 0,
                    pending_free: Vec::new(),
                    dirty: true,
                }
            }
        };

        let backend = Self {
            stats: DiskStats::new(dir),
            path,
            file,
            tree,
            max_size,
            state: Mutex::new(state),
        };
        backend.flush()?;
        Ok(backend)
    }

    fn record(st: &State, id: &BlockId) -> Result<Option<BlockRecord>> {
        match st.tx.get(&prefixed(BLOCK_PREFIX, id.as_bytes()))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn existing(st: &State, id: &BlockId) -> Result<BlockRecord> {
        Self::record(st, id)?.ok_or_else(|| StorageError::MissingBlock { id: id.clone() })
    }

    fn put_record(st: &mut State, id: &BlockId, record: &BlockRecord) -> Result<()> {
        st.tx
            .set(&prefixed(BLOCK_PREFIX, id.as_bytes()), &bincode::serialize(record)?)?;
        st.dirty = true;
        Ok(())
    }

    /// Find room for `size` bytes: best free fit, then file growth, then
    /// scattered fragments.
    fn allocate(&self, st: &mut State, size: u64) -> Result<Vec<(u64, u64)>> {
        if let Some(offset) = space::take_fit(&mut st.tx, size)? {
            return Ok(vec![(offset, size)]);
        }
        let (offset, gaps) = space::place_at_end(st.file_end, size);
        if self.max_size.map_or(true, |max| offset + size <= max) {
            for (gap, len) in gaps {
                space::release(&mut st.tx, gap, len)?;
            }
            st.file_end = offset + size;
            return Ok(vec![(offset, size)]);
        }
        if let Some(fragments) = space::take_fragments(&mut st.tx, size)? {
            debug!(size, count = fragments.len(), "allocated fragments");
            return Ok(fragments);
        }
        Err(StorageError::NoSpace { needed: size })
    }

    #[instrument(skip(self, st), fields(generation = st.generation), level = "debug")]
    fn flush_locked(&self, st: &mut State) -> Result<()> {
        if !st.dirty {
            return Ok(());
        }

        let mut writer = NodeWriter {
            file: &self.file,
            file_end: &mut st.file_end,
            gaps: Vec::new(),
            referenced: HashSet::new(),
        };
        let root_id = st.tx.commit(&mut writer)?;
        let NodeWriter {
            gaps,
            mut referenced,
            ..
        } = writer;
        referenced.insert(root_id.clone());

        let mut garbage = Vec::new();
        collect_garbage(&self.tree, &st.durable_root, &referenced, &mut garbage)?;

        let mut pending = std::mem::take(&mut st.pending_free);
        for id in &garbage {
            pending.extend(id_to_locations(id)?);
        }
        pending.extend(gaps);
        let carried = if pending.len() > MAX_PENDING_FREE {
            pending.split_off(MAX_PENDING_FREE)
        } else {
            Vec::new()
        };

        self.file.sync_data()?;
        let slots = superblock::slots(st.file_end);
        let next = slots
            .iter()
            .position(|s| *s == st.slot)
            .map_or(0, |i| (i + 1) % slots.len());
        let sb = Superblock {
            generation: st.generation + 1,
            bytes_used: st.bytes_used,
            bytes_total: st.file_end,
            root: id_to_locations(&root_id)?,
            pending_free: pending,
        };
        sb.write(&self.file, slots[next])?;
        self.file.sync_data()?;

        st.generation = sb.generation;
        st.slot = slots[next];
        let root = st.tx.root().clone();
        st.tx.reset(root.clone());
        st.durable_root = root;
        for &(offset, size) in &sb.pending_free {
            space::release(&mut st.tx, offset, size)?;
        }
        if !carried.is_empty() {
            warn!(count = carried.len(), "deferring frees to the next flush");
        }
        st.dirty = !carried.is_empty();
        st.pending_free = carried;

        debug!(
            generation = st.generation,
            slot = st.slot,
            garbage = garbage.len(),
            file_end = st.file_end,
            "wrote superblock"
        );
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes in free extents that are ready for reuse
    pub fn free_bytes(&self) -> Result<u64> {
        space::free_bytes(&self.state.lock().tx)
    }

    #[cfg(test)]
    fn file_end(&self) -> u64 {
        self.state.lock().file_end
    }

    #[cfg(test)]
    fn superblock_slot(&self) -> u64 {
        self.state.lock().slot
    }
}

impl Backend for LogBackend {
    fn get_block_by_id(&self, id: &BlockId) -> Result<Option<BlockMetadata>> {
        let st = self.state.lock();
        Ok(Self::record(&st, id)?.map(|r| r.meta))
    }

    fn get_block_data(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
        let st = self.state.lock();
        match Self::record(&st, id)? {
            Some(record) => Ok(Some(read_extents(&self.file, &record.locations, record.len)?)),
            None => Ok(None),
        }
    }

    fn store_block(&self, id: &BlockId, meta: BlockMetadata, data: &[u8]) -> Result<()> {
        let mut st = self.state.lock();
        if Self::record(&st, id)?.is_some() {
            return Err(StorageError::BlockExists { id: id.clone() });
        }
        let size = space::round_up(data.len() as u64);
        let locations = self.allocate(&mut st, size)?;
        write_extents(&self.file, &locations, data)?;
        st.bytes_used += size;
        let record = BlockRecord {
            len: data.len() as u64,
            locations,
            meta,
        };
        Self::put_record(&mut st, id, &record)
    }

    fn update_block(&self, id: &BlockId, meta: BlockMetadata) -> Result<usize> {
        let mut st = self.state.lock();
        let mut record = Self::existing(&st, id)?;
        record.meta = meta;
        Self::put_record(&mut st, id, &record)?;
        Ok(1)
    }

    fn delete_block(&self, id: &BlockId) -> Result<()> {
        let mut st = self.state.lock();
        let record = Self::existing(&st, id)?;
        st.tx.delete(&prefixed(BLOCK_PREFIX, id.as_bytes()))?;
        let size: u64 = record.locations.iter().map(|(_, s)| s).sum();
        st.bytes_used = st.bytes_used.saturating_sub(size);
        st.pending_free.extend(record.locations);
        st.dirty = true;
        Ok(())
    }

    fn get_name(&self, name: &str) -> Result<Option<BlockId>> {
        let st = self.state.lock();
        Ok(st
            .tx
            .get(&prefixed(NAME_PREFIX, name.as_bytes()))?
            .map(BlockId::from_bytes))
    }

    fn set_name(&self, name: &str, id: Option<&BlockId>) -> Result<()> {
        let mut st = self.state.lock();
        let key = prefixed(NAME_PREFIX, name.as_bytes());
        match id {
            Some(id) => st.tx.set(&key, id.as_bytes())?,
            None => {
                st.tx.delete(&key)?;
            }
        }
        st.dirty = true;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut st = self.state.lock();
        self.flush_locked(&mut st)
    }

    fn bytes_available(&self) -> u64 {
        match self.max_size {
            Some(max) => max.saturating_sub(self.state.lock().bytes_used),
            None => self.stats.available(),
        }
    }

    fn bytes_used(&self) -> u64 {
        self.state.lock().bytes_used
    }
}
