//! # tfs-storage
//!
//! Reference-counted block storage.
//!
//! ```text
//! BlockStore (worker thread, dirty tracking, names, dependencies)
//!     │
//!     ▼
//! MapRunnerBackend ─► CodecBackend ─► Memory | File | Lmdb | Log backend
//! ```
//!
//! Blocks are immutable payloads named by [`BlockId`]. Each block carries a
//! persisted reference count and a [`BlockStatus`]; callers additionally pin
//! blocks in memory through [`BlockHandle`]s. Names are the only mutable
//! state and are published atomically at flush.

pub mod backend;
pub mod store;

pub use backend::{
    open_backend, Backend, BackendKind, CodecBackend, FileBackend, LmdbBackend, LogBackend,
    MapRunnerBackend, MemoryBackend,
};
pub use store::{BlockHandle, BlockStore, StoreStats};
pub use tfs_btree::BlockId;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] tfs_codec::CodecError),

    #[error("tree error: {0}")]
    Tree(#[from] tfs_btree::TreeError),

    #[error("LMDB error: {0}")]
    Lmdb(#[from] heed::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("block {id} does not exist")]
    MissingBlock { id: BlockId },

    #[error("block {id} already exists")]
    BlockExists { id: BlockId },

    #[error("out of space: {needed} bytes requested")]
    NoSpace { needed: u64 },

    #[error("corrupt storage: {0}")]
    Corrupt(String),

    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("block store is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Lifecycle state of a block.
///
/// `Normal` and `Missing` blocks hold references to the blocks their payload
/// mentions; weak blocks do not. `Want*` blocks have no data yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum BlockStatus {
    #[default]
    Normal = 1,
    Missing = 2,
    WantNormal = 3,
    Weak = 4,
    WantWeak = 5,
}

impl BlockStatus {
    /// Whether payload references count toward other blocks' refcounts
    pub fn holds_references(self) -> bool {
        matches!(self, BlockStatus::Normal | BlockStatus::Missing)
    }

    pub fn is_weak(self) -> bool {
        matches!(self, BlockStatus::Weak | BlockStatus::WantWeak)
    }
}

impl TryFrom<u8> for BlockStatus {
    type Error = StorageError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => Self::Normal,
            2 => Self::Missing,
            3 => Self::WantNormal,
            4 => Self::Weak,
            5 => Self::WantWeak,
            other => return Err(StorageError::Corrupt(format!("block status {other}"))),
        })
    }
}

/// Persisted per-block metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BlockMetadata {
    pub ref_count: u64,
    pub status: BlockStatus,
}

impl BlockMetadata {
    pub fn new(ref_count: u64, status: BlockStatus) -> Self {
        Self { ref_count, status }
    }

    /// References from the payload are counted iff this holds
    pub fn references_active(&self) -> bool {
        self.ref_count > 0 && self.status.holds_references()
    }
}

/// Enumerates the block ids referenced by a payload.
///
/// The store does not interpret payloads; whoever writes blocks supplies
/// this to keep child refcounts in step with their parents.
pub type ReferenceCallback = Arc<dyn Fn(&BlockId, &[u8], &mut dyn FnMut(BlockId)) + Send + Sync>;
