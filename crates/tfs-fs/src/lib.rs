//! # tfs-fs
//!
//! A POSIX-style filesystem stored entirely in one hugger tree.
//!
//! Every inode owns a contiguous key range (see [`key`]): its metadata,
//! extended attributes, directory entries, back references and file
//! extents. Small files keep their bytes inline in the metadata; larger
//! ones are split into fixed-size extent blocks referenced from the tree.
//!
//! Operations are addressed by inode number like a kernel filesystem
//! interface. [`FsUser`] layers path-based access on top.

pub mod access;
mod data;
mod handles;
mod inode;
pub mod key;
pub mod locks;
mod merge;
pub mod meta;
mod ops;
mod user;

pub use access::Ctx;
pub use handles::DirEntry;
pub use key::{BlockKey, SubType};
pub use merge::merge_to3;
pub use meta::{Attr, InodeMeta};
pub use ops::{Entry, SetAttr, StatFs, XATTR_CREATE, XATTR_REPLACE};
pub use user::{File, FsUser};

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tfs_btree::{BlockId, TreeError};
use tfs_codec::CodecChain;
use tfs_hugger::{tree_references, Hugger, HuggerError, HuggerOptions, MergeCallback};
use tfs_storage::{BackendKind, BlockStore, ReferenceCallback, StorageError};
use tracing::info;

use crate::handles::Handle;
use crate::locks::{KeyedMutex, OwnedMutex, ParallelLimiter, ReentrantMutex};
use crate::meta::S_IFDIR;

/// Inode number of the root directory
pub const ROOT_INO: u64 = 1;

/// Unit reported for block counts
pub const BLOCK_SIZE: u64 = 512;

pub const NAME_MAX: usize = 255;

/// First byte of an extent block
pub const EXTENT_TAG: u8 = 42;

pub const DEFAULT_EMBEDDED_SIZE: usize = 1024;
pub const DEFAULT_EXTENT_SIZE: usize = 65536;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,

    #[error("file exists")]
    Exists,

    #[error("directory not empty")]
    NotEmpty,

    #[error("not a directory")]
    NotDir,

    #[error("is a directory")]
    IsDir,

    #[error("permission denied")]
    Access,

    #[error("operation not permitted")]
    Perm,

    #[error("invalid argument: {0}")]
    Invalid(&'static str),

    #[error("no such attribute")]
    NoData,

    #[error("file name too long")]
    NameTooLong,

    #[error("bad file handle {0}")]
    BadHandle(u64),

    #[error("corrupt filesystem: {0}")]
    Corrupt(String),

    #[error("hugger error: {0}")]
    Hugger(#[from] HuggerError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

impl FsError {
    /// The POSIX error number reported for this error
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::Exists => libc::EEXIST,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::NotDir => libc::ENOTDIR,
            FsError::IsDir => libc::EISDIR,
            FsError::Access => libc::EACCES,
            FsError::Perm => libc::EPERM,
            FsError::Invalid(_) => libc::EINVAL,
            FsError::NoData => libc::ENODATA,
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::BadHandle(_) => libc::EBADF,
            FsError::Corrupt(_)
            | FsError::Hugger(_)
            | FsError::Storage(_)
            | FsError::Tree(_)
            | FsError::Serialization(_) => libc::EIO,
        }
    }
}

impl From<FsError> for std::io::Error {
    fn from(err: FsError) -> Self {
        std::io::Error::from_raw_os_error(err.errno())
    }
}

pub type Result<T> = std::result::Result<T, FsError>;

#[derive(Debug, Clone)]
pub struct FsOptions {
    /// Store name the tree root is published under
    pub root_name: String,
    /// Files up to this size live inside their metadata
    pub embedded_size: usize,
    pub extent_size: usize,
    pub node_max_size: usize,
    /// Decoded nodes kept in memory
    pub cache_size: usize,
    /// Concurrent multi-extent writes per CPU
    pub writes_per_cpu: usize,
}

impl Default for FsOptions {
    fn default() -> Self {
        Self {
            root_name: "fs".to_string(),
            embedded_size: DEFAULT_EMBEDDED_SIZE,
            extent_size: DEFAULT_EXTENT_SIZE,
            node_max_size: tfs_btree::DEFAULT_NODE_MAX_SIZE,
            cache_size: tfs_hugger::DEFAULT_NODE_CACHE_SIZE,
            writes_per_cpu: 4,
        }
    }
}

/// Block references held by filesystem tree nodes.
///
/// Leaves reference their extent blocks and name-block entries.
pub fn reference_callback() -> ReferenceCallback {
    tree_references(|key, value| {
        let key = BlockKey::from_bytes(key)?;
        match key.sub_type()? {
            SubType::Offset2Extent | SubType::NameHashBlock => {
                Some(BlockId::from_bytes(value.to_vec()))
            }
            _ => None,
        }
    })
}

/// Open a block store suitable for filesystem trees
pub fn open_store(
    kind: BackendKind,
    dir: &std::path::Path,
    codec: CodecChain,
) -> std::result::Result<BlockStore, StorageError> {
    BlockStore::open(kind, dir, codec, Some(reference_callback()))
}

/// The merge used when a filesystem commit loses a race
pub fn merge_callback() -> MergeCallback {
    Arc::new(merge_to3)
}

pub struct Fs {
    hugger: Hugger,
    options: FsOptions,
    /// Lookup and open counts per inode
    inodes: OwnedMutex<HashMap<u64, u64>>,
    meta_locks: KeyedMutex<u64>,
    extent_locks: KeyedMutex<(u64, u64)>,
    /// Taken before the inode locks by every operation that holds more
    /// than one of them (link, unlink, rmdir, rename)
    namespace: ReentrantMutex<()>,
    limiter: ParallelLimiter,
    handles: Mutex<HashMap<u64, Handle>>,
    next_fh: AtomicU64,
}

impl Fs {
    /// Open the filesystem named `options.root_name`, creating the root
    /// directory if the tree is new.
    pub fn mount(store: Arc<BlockStore>, options: FsOptions) -> Result<Self> {
        let hugger = Hugger::open(
            store,
            &options.root_name,
            HuggerOptions {
                cache_size: options.cache_size,
                node_max_size: options.node_max_size,
                merge: Some(merge_callback()),
            },
        )?;
        let fs = Self {
            limiter: ParallelLimiter::per_cpu(options.writes_per_cpu),
            hugger,
            options,
            inodes: OwnedMutex::new(HashMap::new()),
            meta_locks: KeyedMutex::new(),
            extent_locks: KeyedMutex::new(),
            namespace: ReentrantMutex::new(()),
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        };
        if fs.hugger.root_is_new() {
            fs.hugger.update(|tr| {
                let mut root = InodeMeta::new(S_IFDIR | 0o777, 0, 0, ROOT_INO);
                root.nlink = 2;
                inode::set_meta(tr, ROOT_INO, &root)
            })?;
            info!(name = %fs.options.root_name, "created filesystem");
        }
        Ok(fs)
    }

    pub fn hugger(&self) -> &Hugger {
        &self.hugger
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        self.hugger.store()
    }

    pub fn options(&self) -> &FsOptions {
        &self.options
    }

    /// Make all completed operations durable
    pub fn flush(&self) -> Result<()> {
        self.hugger.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for Fs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fs")
            .field("root_name", &self.options.root_name)
            .field("root", &self.hugger.root_block_id())
            .finish()
    }
}
