//! # tfs-sync
//!
//! Moves filesystem trees between tfs instances block by block.
//!
//! Each instance runs a [`Server`] next to its filesystem. A [`Connector`]
//! talks to two of them through the [`SyncEndpoint`] operations: it copies
//! the blocks of one side's root that the other lacks, publishes the copy
//! under a name on the receiving side, and asks the receiver to merge it
//! into its own filesystem with a three-way merge.
//!
//! Blocks cross the wire encoded with the sending store's codec, keyed by
//! their id, so both ends must share a codec configuration.

mod connector;
mod server;
pub mod wire;

pub use connector::{sent_name, Connection, Connector};
pub use server::{Server, SYNC_ROOT_NAME};
pub use wire::{serve, TcpEndpoint};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tfs_btree::{BlockId, TreeError};
use tfs_codec::CodecError;
use tfs_fs::FsError;
use tfs_hugger::HuggerError;
use tfs_storage::{BlockStatus, StorageError};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("hugger error: {0}")]
    Hugger(#[from] HuggerError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("block {id} does not match its payload")]
    WrongId { id: BlockId },

    #[error("no block named {0}")]
    UnknownName(String),

    #[error("block {id} not found")]
    MissingBlock { id: BlockId },

    #[error("only merges into the filesystem root {0} are supported")]
    UnsupportedMerge(String),

    #[error("message of {0} bytes exceeds the limit")]
    TooLarge(usize),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("remote error: {0}")]
    Remote(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// A block as seen by the sync protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncBlock {
    pub id: BlockId,
    pub status: BlockStatus,
    /// Payload encoded with the owning store's codec, if asked for
    pub data: Option<Vec<u8>>,
    /// Children of a weak block that the store does not have yet
    pub missing: Vec<BlockId>,
}

/// Operations one tfs instance offers to a connector.
pub trait SyncEndpoint: Send + Sync {
    /// Block currently published under `name`
    fn get_block_id_by_name(&self, name: &str) -> Result<Option<BlockId>>;

    fn get_block_by_id(
        &self,
        id: &BlockId,
        want_data: bool,
        want_missing: bool,
    ) -> Result<Option<SyncBlock>>;

    /// Store `block`, keeping it alive on behalf of `name` until
    /// [`SyncEndpoint::clear_blocks_in_name`]. Returns the stored block
    /// with its missing children.
    fn store_block(&self, name: &str, block: SyncBlock) -> Result<SyncBlock>;

    fn set_name_to_block_id(&self, name: &str, id: &BlockId) -> Result<()>;

    /// Merge the tree published as `from` into the filesystem named `to`
    fn merge_block_name_to(&self, from: &str, to: &str) -> Result<()>;

    fn clear_blocks_in_name(&self, name: &str) -> Result<()>;

    /// Make a weak block normal. Returns it with any still missing children.
    fn upgrade_block_non_weak(&self, id: &BlockId) -> Result<Option<SyncBlock>>;
}
