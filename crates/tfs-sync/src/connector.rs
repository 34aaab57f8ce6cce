use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use rayon::ThreadPool;
use tfs_btree::BlockId;
use tfs_storage::BlockStatus;
use tracing::{debug, info, instrument, warn};

use crate::{Result, SyncBlock, SyncEndpoint, SyncError};

/// Upper bound on concurrent block copies
pub const MAX_COPY_THREADS: usize = 8;

/// Source-side name of the tree last sent to `other`
pub fn sent_name(other: &str) -> String {
    format!("sent.{other}")
}

fn default_thread_count() -> usize {
    num_cpus::get().clamp(2, MAX_COPY_THREADS)
}

/// One side of a connector.
#[derive(Clone)]
pub struct Connection {
    pub endpoint: Arc<dyn SyncEndpoint>,
    /// Name of the filesystem on this side
    pub root_name: String,
    /// Name this side keeps the other side's tree under
    pub other_root_name: String,
}

impl Connection {
    pub fn new(
        endpoint: Arc<dyn SyncEndpoint>,
        root_name: impl Into<String>,
        other_root_name: impl Into<String>,
    ) -> Self {
        Self {
            endpoint,
            root_name: root_name.into(),
            other_root_name: other_root_name.into(),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("root_name", &self.root_name)
            .field("other_root_name", &self.other_root_name)
            .finish()
    }
}

/// Keeps two filesystems in sync, each direction independently.
pub struct Connector {
    left: Connection,
    right: Connection,
    pool: ThreadPool,
}

impl Connector {
    pub fn new(left: Connection, right: Connection) -> Result<Self> {
        Self::with_threads(left, right, default_thread_count())
    }

    pub fn with_threads(left: Connection, right: Connection, threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(2))
            .thread_name(|i| format!("tfs-sync-{i}"))
            .build()
            .map_err(|err| SyncError::Protocol(format!("thread pool: {err}")))?;
        Ok(Self { left, right, pool })
    }

    /// Sync both directions once; returns the number of blocks copied.
    #[instrument(skip(self), fields(left = %self.left.root_name, right = %self.right.root_name))]
    pub fn run(&self) -> Result<usize> {
        let (to_right, to_left) = self.pool.join(
            || self.sync_inner(&self.left, &self.right),
            || self.sync_inner(&self.right, &self.left),
        );
        Ok(to_right? + to_left?)
    }

    /// Run until `stop` is set, starting a round every `interval`.
    ///
    /// Failed rounds are logged and retried at the next tick.
    pub fn run_every(&self, interval: Duration, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            let started = Instant::now();
            match self.run() {
                Ok(copied) => debug!(copied, "sync round done"),
                Err(err) => warn!(%err, "sync round failed"),
            }
            let deadline = started + interval;
            while !stop.load(Ordering::Relaxed) && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(50).min(interval));
            }
        }
    }

    /// Bring `from`'s filesystem into `to`'s
    pub fn sync(&self, from: &Connection, to: &Connection) -> Result<usize> {
        self.pool.install(|| self.sync_inner(from, to))
    }

    fn sync_inner(&self, from: &Connection, to: &Connection) -> Result<usize> {
        let Some(fid) = from.endpoint.get_block_id_by_name(&from.root_name)? else {
            debug!(name = %from.root_name, "source has no tree yet");
            return Ok(0);
        };
        // Keeps the snapshot alive on the source while it is copied
        from.endpoint
            .set_name_to_block_id(&sent_name(&from.other_root_name), &fid)?;
        let tid = to.endpoint.get_block_id_by_name(&to.other_root_name)?;

        let mut copied = 0;
        if tid.as_ref() != Some(&fid) {
            copied = self.copy_block_to(from, to, &fid)?;
            to.endpoint
                .set_name_to_block_id(&to.other_root_name, &fid)?;
        }
        to.endpoint
            .merge_block_name_to(&to.other_root_name, &to.root_name)?;
        to.endpoint.clear_blocks_in_name(&to.other_root_name)?;
        info!(
            from = %from.root_name,
            to = %to.root_name,
            root = %fid,
            copied,
            "synced"
        );
        Ok(copied)
    }

    /// Copy `id` and everything below it that `to` lacks.
    ///
    /// Blocks arrive weak and are upgraded once their children are in
    /// place, so a partial copy never holds references to absent blocks.
    fn copy_block_to(&self, from: &Connection, to: &Connection, id: &BlockId) -> Result<usize> {
        let mut copied = 0;
        let mut block = match to.endpoint.get_block_by_id(id, false, true)? {
            Some(block) => block,
            None => {
                let source = from
                    .endpoint
                    .get_block_by_id(id, true, false)?
                    .ok_or_else(|| SyncError::MissingBlock { id: id.clone() })?;
                copied += 1;
                to.endpoint.store_block(
                    &to.other_root_name,
                    SyncBlock {
                        id: id.clone(),
                        status: BlockStatus::Weak,
                        data: source.data,
                        missing: Vec::new(),
                    },
                )?
            }
        };

        while block.status.is_weak() {
            copied += block
                .missing
                .par_iter()
                .map(|child| self.copy_block_to(from, to, child))
                .try_reduce(|| 0, |a, b| Ok(a + b))?;
            block = to
                .endpoint
                .upgrade_block_non_weak(id)?
                .ok_or_else(|| SyncError::MissingBlock { id: id.clone() })?;
        }
        Ok(copied)
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("left", &self.left)
            .field("right", &self.right)
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}
