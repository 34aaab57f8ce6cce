//! Reference-counting block store.
//!
//! All bookkeeping lives on one worker thread; public calls post a job and
//! wait for its reply. Block payloads that are not yet persisted sit in a
//! shared cache so handles can read them without a round trip.
//!
//! A block's references to other blocks (as reported by the
//! [`ReferenceCallback`]) count toward their refcounts while the block has
//! a nonzero refcount and a status that holds references. Whenever that
//! switches, the children are adjusted immediately.

mod handle;
mod worker;

pub use handle::BlockHandle;

use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use tfs_codec::CodecChain;
use tracing::{debug, instrument};

use self::worker::{Job, Worker};
use crate::backend::{open_backend, Backend, BackendKind, CodecBackend, MapRunnerBackend};
use crate::{BlockId, BlockStatus, ReferenceCallback, Result, StorageError};

/// Pending jobs before callers block
const JOB_QUEUE_DEPTH: usize = 1024;

#[derive(Default)]
struct Counters {
    reads: AtomicU64,
    read_bytes: AtomicU64,
    writes: AtomicU64,
    write_bytes: AtomicU64,
    blocks: AtomicUsize,
    dirty: AtomicUsize,
}

impl Counters {
    fn record_read(&self, bytes: usize) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.read_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_write(&self, bytes: usize) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.write_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn set_counts(&self, blocks: usize, dirty: usize) {
        self.blocks.store(blocks, Ordering::Relaxed);
        self.dirty.store(dirty, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StoreStats {
        StoreStats {
            reads: self.reads.load(Ordering::Relaxed),
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            write_bytes: self.write_bytes.load(Ordering::Relaxed),
            blocks: self.blocks.load(Ordering::Relaxed),
            dirty: self.dirty.load(Ordering::Relaxed),
        }
    }

    /// Return and reset the I/O counters
    fn take_io(&self) -> StoreStats {
        StoreStats {
            reads: self.reads.swap(0, Ordering::Relaxed),
            read_bytes: self.read_bytes.swap(0, Ordering::Relaxed),
            writes: self.writes.swap(0, Ordering::Relaxed),
            write_bytes: self.write_bytes.swap(0, Ordering::Relaxed),
            blocks: self.blocks.load(Ordering::Relaxed),
            dirty: self.dirty.load(Ordering::Relaxed),
        }
    }
}

/// Block store statistics; I/O counters cover the time since the last flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub reads: u64,
    pub read_bytes: u64,
    pub writes: u64,
    pub write_bytes: u64,
    /// Blocks resident in memory
    pub blocks: usize,
    pub dirty: usize,
}

struct Shared {
    jobs: Sender<Job>,
    backend: Arc<dyn Backend>,
    cache: DashMap<BlockId, Arc<Vec<u8>>>,
    stats: Counters,
}

pub struct BlockStore {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BlockStore {
    /// Store over `backend` as is
    pub fn new(backend: Arc<dyn Backend>, callback: Option<ReferenceCallback>) -> Self {
        let (jobs, rx) = bounded(JOB_QUEUE_DEPTH);
        let shared = Arc::new(Shared {
            jobs,
            backend,
            cache: DashMap::new(),
            stats: Counters::default(),
        });
        let worker = Worker::new(shared.clone(), callback);
        let handle = thread::Builder::new()
            .name("tfs-store".into())
            .spawn(move || worker.run(rx));
        let handle = match handle {
            Ok(h) => Some(h),
            Err(err) => {
                tracing::error!(error = %err, "failed to spawn block store worker");
                None
            }
        };
        Self {
            shared,
            worker: Mutex::new(handle),
        }
    }

    /// Open a backend of `kind` in `directory`, wrapped with `codec` and
    /// per-block call serialisation.
    pub fn open(
        kind: BackendKind,
        directory: &Path,
        codec: CodecChain,
        callback: Option<ReferenceCallback>,
    ) -> Result<Self> {
        let raw = open_backend(kind, directory)?;
        let coded: Arc<dyn Backend> = Arc::new(CodecBackend::new(raw, codec));
        let backend: Arc<dyn Backend> = Arc::new(MapRunnerBackend::new(coded));
        debug!(%kind, directory = %directory.display(), "opened block store");
        Ok(Self::new(backend, callback))
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.shared.backend
    }

    fn send(&self, job: Job) -> Result<()> {
        self.shared.jobs.send(job).map_err(|_| StorageError::Closed)
    }

    fn call<T>(&self, make: impl FnOnce(worker::Reply<T>) -> Job) -> Result<T> {
        let (tx, rx) = bounded(1);
        self.send(make(tx))?;
        rx.recv().map_err(|_| StorageError::Closed)?
    }

    fn store_job(
        &self,
        id: &BlockId,
        status: BlockStatus,
        data: Vec<u8>,
        refer: bool,
        pin: bool,
    ) -> Result<BlockStatus> {
        self.call(|reply| Job::ReferOrStore {
            id: id.clone(),
            status,
            data: Arc::new(data),
            refer,
            pin,
            reply,
        })
    }

    /// Add a reference to `id`, storing `data` first if the block is new
    pub fn refer_or_store_block(
        &self,
        id: &BlockId,
        status: BlockStatus,
        data: Vec<u8>,
    ) -> Result<BlockHandle> {
        let status = self.store_job(id, status, data, true, true)?;
        Ok(BlockHandle::new(id.clone(), status, self.shared.clone()))
    }

    /// Like [`Self::refer_or_store_block`] without the reference; the block
    /// lives on its handle until something refers to it.
    pub fn refer_or_store_block0(
        &self,
        id: &BlockId,
        status: BlockStatus,
        data: Vec<u8>,
    ) -> Result<BlockHandle> {
        let status = self.store_job(id, status, data, false, true)?;
        Ok(BlockHandle::new(id.clone(), status, self.shared.clone()))
    }

    /// Store a block without referring to or pinning it
    pub fn store_block(&self, id: &BlockId, status: BlockStatus, data: Vec<u8>) -> Result<()> {
        self.store_job(id, status, data, false, false).map(|_| ())
    }

    fn update_ref_count(&self, id: &BlockId, delta: i64) -> Result<()> {
        self.call(|reply| Job::UpdateRefCount {
            id: id.clone(),
            delta,
            reply,
        })
    }

    pub fn refer_block_id(&self, id: &BlockId) -> Result<()> {
        self.update_ref_count(id, 1)
    }

    /// Drop a reference; the block goes away at flush if none remain
    pub fn release_block_id(&self, id: &BlockId) -> Result<()> {
        self.update_ref_count(id, -1)
    }

    /// Pin a block in memory without taking a handle
    pub fn refer_storage_block_id(&self, id: &BlockId) -> Result<()> {
        match self.call(|reply| Job::Pin {
            id: id.clone(),
            reply: Some(reply),
        })? {
            Some(_) => Ok(()),
            None => Err(StorageError::MissingBlock { id: id.clone() }),
        }
    }

    pub fn release_storage_block_id(&self, id: &BlockId) -> Result<()> {
        self.send(Job::Unpin { id: id.clone() })
    }

    pub fn get_block_by_id(&self, id: &BlockId) -> Result<Option<BlockHandle>> {
        let status = self.call(|reply| Job::Pin {
            id: id.clone(),
            reply: Some(reply),
        })?;
        Ok(status.map(|status| BlockHandle::new(id.clone(), status, self.shared.clone())))
    }

    pub fn set_block_status(&self, id: &BlockId, status: BlockStatus) -> Result<()> {
        self.call(|reply| Job::SetStatus {
            id: id.clone(),
            status,
            reply,
        })
    }

    /// Current value of `name`, including changes not yet flushed
    pub fn get_block_id_by_name(&self, name: &str) -> Result<Option<BlockId>> {
        self.call(|reply| Job::GetName {
            name: name.to_string(),
            reply,
        })
    }

    /// Stage a name change; it is published, and the references moved, at
    /// the next flush.
    pub fn set_name_to_block_id(&self, name: &str, id: Option<&BlockId>) -> Result<()> {
        self.send(Job::SetName {
            name: name.to_string(),
            id: id.cloned(),
        })
    }

    /// Persist names and dirty blocks; returns the number of backend operations
    #[instrument(skip(self), level = "debug")]
    pub fn flush(&self) -> Result<usize> {
        self.call(|reply| Job::Flush { reply })
    }

    pub fn stats(&self) -> StoreStats {
        self.shared.stats.snapshot()
    }

    pub fn bytes_available(&self) -> u64 {
        self.shared.backend.bytes_available()
    }

    pub fn bytes_used(&self) -> u64 {
        self.shared.backend.bytes_used()
    }

    /// Flush, stop the worker and close the backend
    pub fn close(&self) -> Result<()> {
        let Some(worker) = self.worker.lock().take() else {
            return Ok(());
        };
        let flushed = self.flush();
        let _ = self.send(Job::Quit);
        if worker.join().is_err() {
            tracing::error!("block store worker panicked");
        }
        flushed?;
        self.shared.backend.close()
    }
}

impl Drop for BlockStore {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().take() {
            let _ = self.send(Job::Quit);
            let _ = worker.join();
        }
    }
}
