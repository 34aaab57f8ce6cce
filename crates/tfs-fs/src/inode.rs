//! Inode records inside a transaction, and in-memory inode usage.

use tfs_btree::prefix_end;
use tfs_hugger::Transaction;
use tracing::{debug, warn};

use crate::key::{BlockKey, SubType};
use crate::meta::InodeMeta;
use crate::{Fs, FsError, Result, NAME_MAX, ROOT_INO};

pub(crate) fn get_meta(tr: &Transaction, ino: u64) -> Result<Option<InodeMeta>> {
    match tr.get(BlockKey::meta(ino).as_bytes())? {
        Some(data) => Ok(Some(InodeMeta::decode(&data)?)),
        None => Ok(None),
    }
}

pub(crate) fn meta(tr: &Transaction, ino: u64) -> Result<InodeMeta> {
    get_meta(tr, ino)?.ok_or(FsError::NotFound)
}

pub(crate) fn dir_meta(tr: &Transaction, ino: u64) -> Result<InodeMeta> {
    let meta = meta(tr, ino)?;
    if !meta.is_dir() {
        return Err(FsError::NotDir);
    }
    Ok(meta)
}

pub(crate) fn set_meta(tr: &mut Transaction, ino: u64, meta: &InodeMeta) -> Result<()> {
    tr.set(BlockKey::meta(ino).as_bytes(), &meta.encode()?)?;
    Ok(())
}

pub(crate) fn check_name(name: &[u8]) -> Result<()> {
    if name.is_empty() || name.contains(&b'/') || name.contains(&0) {
        return Err(FsError::Invalid("file name"));
    }
    if name.len() > NAME_MAX {
        return Err(FsError::NameTooLong);
    }
    Ok(())
}

/// Inode a directory entry points at
pub(crate) fn lookup_entry(tr: &Transaction, dir: u64, name: &[u8]) -> Result<Option<u64>> {
    let Some(value) = tr.get(BlockKey::dir_entry(dir, name).as_bytes())? else {
        return Ok(None);
    };
    let ino: [u8; 8] = value
        .as_slice()
        .try_into()
        .map_err(|_| FsError::Corrupt(format!("directory entry in {dir}")))?;
    Ok(Some(u64::from_be_bytes(ino)))
}

/// Resolve `name` in `dir`, including `.` and `..`
pub(crate) fn resolve(tr: &Transaction, dir: u64, name: &[u8]) -> Result<Option<u64>> {
    match name {
        b"." => Ok(Some(dir)),
        b".." => Ok(Some(dir_meta(tr, dir)?.parent_ino)),
        _ => lookup_entry(tr, dir, name),
    }
}

/// Pick an unused inode number
pub(crate) fn new_ino(tr: &Transaction) -> Result<u64> {
    loop {
        let ino: u64 = rand::random();
        if ino > ROOT_INO && get_meta(tr, ino)?.is_none() {
            return Ok(ino);
        }
    }
}

/// Link `child` into `dir` as `name`, updating both records
pub(crate) fn add_entry(
    tr: &mut Transaction,
    dir: u64,
    dir_meta: &mut InodeMeta,
    name: &[u8],
    child: u64,
    child_meta: &mut InodeMeta,
) -> Result<()> {
    tr.set(BlockKey::dir_entry(dir, name).as_bytes(), &child.to_be_bytes())?;
    tr.set(BlockKey::ino_filename(child, dir, name).as_bytes(), &[])?;
    child_meta.nlink += 1;
    child_meta.touch_ctime();
    if child_meta.is_dir() {
        // The new directory's ".." entry
        dir_meta.nlink += 1;
        child_meta.parent_ino = dir;
    }
    dir_meta.nchildren += 1;
    dir_meta.touch_mtime();
    Ok(())
}

/// Undo [`add_entry`]
pub(crate) fn remove_entry(
    tr: &mut Transaction,
    dir: u64,
    dir_meta: &mut InodeMeta,
    name: &[u8],
    child: u64,
    child_meta: &mut InodeMeta,
) -> Result<()> {
    if !tr.delete(BlockKey::dir_entry(dir, name).as_bytes())? {
        return Err(FsError::NotFound);
    }
    tr.delete(BlockKey::ino_filename(child, dir, name).as_bytes())?;
    child_meta.nlink = child_meta.nlink.saturating_sub(1);
    child_meta.touch_ctime();
    if child_meta.is_dir() {
        dir_meta.nlink = dir_meta.nlink.saturating_sub(1);
        // Only "." remains
        child_meta.nlink = 0;
    }
    dir_meta.nchildren = dir_meta.nchildren.saturating_sub(1);
    dir_meta.touch_mtime();
    Ok(())
}

/// Drop every key of `ino`
pub(crate) fn delete_inode(tr: &mut Transaction, ino: u64) -> Result<()> {
    let start = BlockKey::first(ino, SubType::None);
    let end = BlockKey::first(ino, SubType::Last);
    tr.delete_range(start.as_bytes(), end.as_bytes())?;
    tr.delete(end.as_bytes())?;
    Ok(())
}

/// Delete keys of one sub type of `ino`, starting at `from`
pub(crate) fn delete_sub_range(
    tr: &mut Transaction,
    from: &BlockKey,
    ino: u64,
    sub_type: SubType,
) -> Result<()> {
    let end = prefix_end(BlockKey::first(ino, sub_type).as_bytes());
    tr.delete_range_bounded(from.as_bytes(), end.as_deref())?;
    Ok(())
}

/// Keys of one sub type of `ino`, in order
pub(crate) fn sub_type_keys(
    tr: &Transaction,
    ino: u64,
    sub_type: SubType,
) -> Result<Vec<BlockKey>> {
    let mut out = Vec::new();
    let mut next = tr.seek(BlockKey::first(ino, sub_type).as_bytes())?.map(|(k, _)| k);
    while let Some(raw) = next {
        match BlockKey::from_bytes(&raw) {
            Some(key) if key.same_range(ino, sub_type) => out.push(key),
            _ => break,
        }
        next = tr.next_key(&raw)?;
    }
    Ok(out)
}

impl Fs {
    /// Count one more kernel or handle reference to `ino`
    pub(crate) fn refer_inode(&self, ino: u64) {
        *self.inodes.lock().entry(ino).or_insert(0) += 1;
    }

    /// Drop `n` references; reclaims the inode if it is unlinked and
    /// unreferenced.
    pub(crate) fn release_inode(&self, ino: u64, n: u64) -> Result<()> {
        let _meta = self.meta_locks.lock(ino);
        let mut inodes = self.inodes.lock();
        if let Some(count) = inodes.get_mut(&ino) {
            *count = count.saturating_sub(n);
            if *count > 0 {
                return Ok(());
            }
            inodes.remove(&ino);
        }
        drop(inodes);
        self.reclaim_if_unused(ino)
    }

    /// Delete `ino` if no link and no reference remains.
    ///
    /// The usage table is not held while the deleting transaction runs.
    pub(crate) fn reclaim_if_unused(&self, ino: u64) -> Result<()> {
        if ino == ROOT_INO {
            return Ok(());
        }
        let _meta = self.meta_locks.lock(ino);
        if self.inodes.lock().contains_key(&ino) {
            return Ok(());
        }
        self.inodes.assert_not_owned();
        let deleted = self.hugger.update_result(|tr| -> Result<bool> {
            match get_meta(tr, ino)? {
                Some(meta) if meta.nlink == 0 => {
                    delete_inode(tr, ino)?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })?;
        if deleted {
            if self.inodes.lock().contains_key(&ino) {
                warn!(ino, "inode referenced while being reclaimed");
            }
            debug!(ino, "reclaimed inode");
        }
        Ok(())
    }
}
