//! Open file and directory handles.

use std::sync::atomic::Ordering;

use tfs_hugger::Transaction;

use crate::inode;
use crate::key::{BlockKey, SubType};
use crate::{Fs, FsError, Result};

/// One entry returned by `readdir`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    pub name: Vec<u8>,
    pub mode: u32,
    /// Position to pass to continue after this entry
    pub offset: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct DirCursor {
    pub ino: u64,
    /// Entries returned so far
    pub pos: u64,
    /// Directory entry key at `pos - 1`
    pub last_key: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub(crate) enum Handle {
    File { ino: u64, flags: i32 },
    Dir(DirCursor),
}

impl Handle {
    pub fn ino(&self) -> u64 {
        match self {
            Handle::File { ino, .. } => *ino,
            Handle::Dir(cursor) => cursor.ino,
        }
    }
}

impl DirCursor {
    fn new(ino: u64) -> Self {
        Self {
            ino,
            pos: 0,
            last_key: None,
        }
    }

    /// Next directory entry key after the cursor, moving it forward
    fn advance(&mut self, tr: &Transaction) -> Result<Option<BlockKey>> {
        let raw = match &self.last_key {
            Some(last) => tr.next_key(last)?,
            None => tr
                .seek(BlockKey::first(self.ino, SubType::DirName2Inode).as_bytes())?
                .map(|(k, _)| k),
        };
        let Some(raw) = raw else { return Ok(None) };
        match BlockKey::from_bytes(&raw) {
            Some(key) if key.same_range(self.ino, SubType::DirName2Inode) => {
                self.pos += 1;
                self.last_key = Some(raw);
                Ok(Some(key))
            }
            _ => Ok(None),
        }
    }

    /// Reposition at `pos` by counting entries from the start
    fn seek(&mut self, tr: &Transaction, pos: u64) -> Result<()> {
        *self = Self::new(self.ino);
        while self.pos < pos {
            if self.advance(tr)?.is_none() {
                break;
            }
        }
        Ok(())
    }
}

impl Fs {
    pub(crate) fn new_handle(&self, handle: Handle) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.refer_inode(handle.ino());
        self.handles.lock().insert(fh, handle);
        fh
    }

    pub(crate) fn handle(&self, fh: u64) -> Result<Handle> {
        self.handles.lock().get(&fh).cloned().ok_or(FsError::BadHandle(fh))
    }

    pub(crate) fn close_handle(&self, fh: u64) -> Result<()> {
        let handle = self
            .handles
            .lock()
            .remove(&fh)
            .ok_or(FsError::BadHandle(fh))?;
        self.release_inode(handle.ino(), 1)
    }

    pub(crate) fn file_handle(&self, fh: u64) -> Result<(u64, i32)> {
        match self.handle(fh)? {
            Handle::File { ino, flags } => Ok((ino, flags)),
            Handle::Dir(_) => Err(FsError::IsDir),
        }
    }

    /// Up to `max` entries of the directory open as `fh`, starting at
    /// entry position `pos`.
    pub(crate) fn read_dir_handle(&self, fh: u64, pos: u64, max: usize) -> Result<Vec<DirEntry>> {
        let mut cursor = match self.handle(fh)? {
            Handle::Dir(cursor) => cursor,
            Handle::File { .. } => return Err(FsError::NotDir),
        };
        let tr = self.hugger.transaction();
        if cursor.pos != pos {
            cursor.seek(&tr, pos)?;
        }
        let mut out = Vec::new();
        while out.len() < max {
            let Some(key) = cursor.advance(&tr)? else { break };
            let Some(child) = inode::lookup_entry(&tr, cursor.ino, key.entry_name())? else {
                continue;
            };
            let mode = inode::get_meta(&tr, child)?.map(|m| m.mode).unwrap_or_default();
            out.push(DirEntry {
                ino: child,
                name: key.entry_name().to_vec(),
                mode,
                offset: cursor.pos,
            });
        }
        drop(tr);
        if let Some(Handle::Dir(saved)) = self.handles.lock().get_mut(&fh) {
            *saved = cursor;
        }
        Ok(out)
    }

    pub(crate) fn new_dir_handle(&self, ino: u64) -> u64 {
        self.new_handle(Handle::Dir(DirCursor::new(ino)))
    }
}
