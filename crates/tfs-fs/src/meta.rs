//! Per-inode metadata record.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::Result;

pub const S_IFMT: u32 = libc::S_IFMT as u32;
pub const S_IFDIR: u32 = libc::S_IFDIR as u32;
pub const S_IFREG: u32 = libc::S_IFREG as u32;
pub const S_IFLNK: u32 = libc::S_IFLNK as u32;
pub const S_ISVTX: u32 = libc::S_ISVTX as u32;

/// Nanoseconds since the epoch
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeMeta {
    pub mode: u32,
    pub rdev: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime_ns: u64,
    pub ctime_ns: u64,
    pub mtime_ns: u64,
    pub size: u64,
    pub nlink: u32,
    /// Directory entries of a directory
    pub nchildren: u32,
    /// Directory the inode was created in
    pub parent_ino: u64,
    /// File contents while the file fits the embedded size
    pub inline_data: Vec<u8>,
}

impl InodeMeta {
    pub fn new(mode: u32, uid: u32, gid: u32, parent_ino: u64) -> Self {
        let now = now_ns();
        Self {
            mode,
            uid,
            gid,
            atime_ns: now,
            ctime_ns: now,
            mtime_ns: now,
            parent_ino,
            ..Default::default()
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn file_type(&self) -> u32 {
        self.mode & S_IFMT
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.file_type() == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == S_IFLNK
    }

    pub fn is_sticky(&self) -> bool {
        self.mode & S_ISVTX != 0
    }

    /// Record a metadata change
    pub fn touch_ctime(&mut self) {
        self.ctime_ns = now_ns();
    }

    /// Record a content change
    pub fn touch_mtime(&mut self) {
        let now = now_ns();
        self.mtime_ns = now;
        self.ctime_ns = now;
    }
}

/// Attributes as reported to callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub ino: u64,
    pub size: u64,
    /// 512-byte blocks
    pub blocks: u64,
    pub atime_ns: u64,
    pub mtime_ns: u64,
    pub ctime_ns: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
}

impl Attr {
    pub fn new(ino: u64, meta: &InodeMeta) -> Self {
        Self {
            ino,
            size: meta.size,
            blocks: meta.size.div_ceil(crate::BLOCK_SIZE),
            atime_ns: meta.atime_ns,
            mtime_ns: meta.mtime_ns,
            ctime_ns: meta.ctime_ns,
            mode: meta.mode,
            nlink: meta.nlink,
            uid: meta.uid,
            gid: meta.gid,
            rdev: meta.rdev,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type_bits() {
        let dir = InodeMeta::new(S_IFDIR | 0o1777, 0, 0, 1);
        assert!(dir.is_dir() && dir.is_sticky() && !dir.is_file());
        let link = InodeMeta::new(S_IFLNK | 0o777, 0, 0, 1);
        assert!(link.is_symlink() && !link.is_dir());
    }

    #[test]
    fn test_decode_encoded() {
        let mut meta = InodeMeta::new(S_IFREG | 0o644, 1000, 100, 1);
        meta.inline_data = b"hello".to_vec();
        meta.size = 5;
        let decoded = InodeMeta::decode(&meta.encode().unwrap()).unwrap();
        assert_eq!(decoded, meta);
        assert_eq!(Attr::new(7, &decoded).blocks, 1);
    }
}
