//! Block backends: the persistence layer under the block store.
//!
//! A backend answers for one block id at a time and keeps its answers
//! consistent with earlier calls. How it persists them is its own business.

mod codec;
mod file;
mod lmdb;
mod log;
mod maprunner;
mod memory;

pub use codec::CodecBackend;
pub use file::FileBackend;
pub use lmdb::LmdbBackend;
pub use log::LogBackend;
pub use maprunner::MapRunnerBackend;
pub use memory::MemoryBackend;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::{BlockId, BlockMetadata, Result, StorageError};

/// Persistence contract used by [`crate::BlockStore`].
pub trait Backend: Send + Sync {
    /// Metadata of a stored block, without loading its data
    fn get_block_by_id(&self, id: &BlockId) -> Result<Option<BlockMetadata>>;

    fn get_block_data(&self, id: &BlockId) -> Result<Option<Vec<u8>>>;

    /// Persist a new block. It must not exist yet.
    fn store_block(&self, id: &BlockId, meta: BlockMetadata, data: &[u8]) -> Result<()>;

    /// Persist new metadata for an existing block; returns the number of
    /// backend operations performed.
    fn update_block(&self, id: &BlockId, meta: BlockMetadata) -> Result<usize>;

    /// Remove an existing block with its data
    fn delete_block(&self, id: &BlockId) -> Result<()>;

    fn get_name(&self, name: &str) -> Result<Option<BlockId>>;

    /// Map `name` to `id`, or remove the mapping
    fn set_name(&self, name: &str, id: Option<&BlockId>) -> Result<()>;

    /// Everything done so far is durable once this returns
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn bytes_available(&self) -> u64;

    fn bytes_used(&self) -> u64;

    /// Called around block store flushes
    fn set_in_flush(&self, _in_flush: bool) {}

    fn close(&self) -> Result<()> {
        self.flush()
    }
}

/// Available backend implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    Memory,
    #[default]
    File,
    Lmdb,
    Log,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::File => "file",
            BackendKind::Lmdb => "lmdb",
            BackendKind::Log => "log",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "inmemory" => Ok(BackendKind::Memory),
            "file" => Ok(BackendKind::File),
            "lmdb" => Ok(BackendKind::Lmdb),
            "log" => Ok(BackendKind::Log),
            other => Err(StorageError::UnknownBackend(other.to_string())),
        }
    }
}

/// Create the raw backend of `kind` rooted at `directory`
pub fn open_backend(kind: BackendKind, directory: &Path) -> Result<Arc<dyn Backend>> {
    debug!(%kind, directory = %directory.display(), "opening backend");
    Ok(match kind {
        BackendKind::Memory => Arc::new(MemoryBackend::new()),
        BackendKind::File => Arc::new(FileBackend::open(directory)?),
        BackendKind::Lmdb => Arc::new(LmdbBackend::open(directory)?),
        BackendKind::Log => Arc::new(LogBackend::open(directory)?),
    })
}

/// How long a filesystem usage sample stays valid
const DISK_STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Cached `statvfs` of a backend directory.
pub(crate) struct DiskStats {
    path: PathBuf,
    sample: Mutex<Option<(Instant, u64, u64)>>,
}

impl DiskStats {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sample: Mutex::new(None),
        }
    }

    /// (available, used) bytes of the filesystem holding the directory
    fn get(&self) -> (u64, u64) {
        let mut sample = self.sample.lock();
        if let Some((at, avail, used)) = *sample {
            if at.elapsed() < DISK_STATS_INTERVAL {
                return (avail, used);
            }
        }
        let (avail, used) = match nix::sys::statvfs::statvfs(&self.path) {
            Ok(st) => {
                let frsize = st.fragment_size() as u64;
                let avail = st.blocks_available() as u64 * frsize;
                let used = (st.blocks() as u64).saturating_sub(st.blocks_free() as u64) * frsize;
                (avail, used)
            }
            Err(err) => {
                debug!(path = %self.path.display(), error = %err, "statvfs failed");
                (0, 0)
            }
        };
        *sample = Some((Instant::now(), avail, used));
        (avail, used)
    }

    pub fn available(&self) -> u64 {
        self.get().0
    }

    pub fn used(&self) -> u64 {
        self.get().1
    }
}
