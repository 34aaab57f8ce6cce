use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use super::worker::Job;
use super::Shared;
use crate::{BlockId, BlockStatus, Result, StorageError};

/// Pins one block in the store's memory.
///
/// Data is loaded on first access and kept for the handle's lifetime.
/// Cloning adds a pin; dropping releases it.
pub struct BlockHandle {
    id: BlockId,
    status: BlockStatus,
    data: OnceCell<Arc<Vec<u8>>>,
    shared: Arc<Shared>,
}

impl BlockHandle {
    pub(super) fn new(id: BlockId, status: BlockStatus, shared: Arc<Shared>) -> Self {
        Self {
            id,
            status,
            data: OnceCell::new(),
            shared,
        }
    }

    pub fn id(&self) -> &BlockId {
        &self.id
    }

    /// Status when the handle was obtained
    pub fn status(&self) -> BlockStatus {
        self.status
    }

    pub fn data(&self) -> Result<&[u8]> {
        let data = self.data.get_or_try_init(|| self.shared.load_data(&self.id))?;
        Ok(data.as_slice())
    }

    /// Shared pointer to the payload
    pub fn data_arc(&self) -> Result<Arc<Vec<u8>>> {
        Ok(self
            .data
            .get_or_try_init(|| self.shared.load_data(&self.id))?
            .clone())
    }
}

impl Clone for BlockHandle {
    fn clone(&self) -> Self {
        // The pin held by `self` keeps the entry resident until this lands
        if self
            .shared
            .jobs
            .send(Job::Pin {
                id: self.id.clone(),
                reply: None,
            })
            .is_err()
        {
            tracing::debug!(id = %self.id, "store closed while cloning handle");
        }
        Self {
            id: self.id.clone(),
            status: self.status,
            data: self.data.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl Drop for BlockHandle {
    fn drop(&mut self) {
        let _ = self.shared.jobs.send(Job::Unpin {
            id: self.id.clone(),
        });
    }
}

impl fmt::Debug for BlockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockHandle")
            .field("id", &self.id)
            .field("status", &self.status)
            .finish()
    }
}

impl Shared {
    pub(super) fn load_data(&self, id: &BlockId) -> Result<Arc<Vec<u8>>> {
        if let Some(data) = self.cache.get(id) {
            return Ok(data.clone());
        }
        match self.backend.get_block_data(id)? {
            Some(data) => {
                self.stats.record_read(data.len());
                Ok(Arc::new(data))
            }
            // Deleted meanwhile; a pinned block's data moves to the cache first
            None => self
                .cache
                .get(id)
                .map(|data| data.clone())
                .ok_or_else(|| StorageError::MissingBlock { id: id.clone() }),
        }
    }
}
