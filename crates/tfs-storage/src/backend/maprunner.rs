use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::Backend;
use crate::{BlockId, BlockMetadata, Result};

/// Counting semaphore bounding concurrent backend calls
struct Slots {
    free: Mutex<usize>,
    cond: Condvar,
}

impl Slots {
    fn new(count: usize) -> Self {
        Self {
            free: Mutex::new(count.max(1)),
            cond: Condvar::new(),
        }
    }

    fn acquire(&self) -> SlotGuard<'_> {
        let mut free = self.free.lock();
        while *free == 0 {
            self.cond.wait(&mut free);
        }
        *free -= 1;
        SlotGuard { slots: self }
    }
}

struct SlotGuard<'a> {
    slots: &'a Slots,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        *self.slots.free.lock() += 1;
        self.slots.cond.notify_one();
    }
}

/// Serialises calls per block id and bounds overall parallelism.
///
/// The block store worker is single threaded, but block data is read from
/// caller threads; this keeps concurrent requests for one id from racing in
/// the inner backend.
pub struct MapRunnerBackend {
    inner: Arc<dyn Backend>,
    running: Mutex<HashMap<BlockId, Arc<Mutex<()>>>>,
    slots: Slots,
}

impl MapRunnerBackend {
    pub fn new(inner: Arc<dyn Backend>) -> Self {
        Self::with_parallelism(inner, num_cpus::get())
    }

    pub fn with_parallelism(inner: Arc<dyn Backend>, parallelism: usize) -> Self {
        Self {
            inner,
            running: Mutex::new(HashMap::new()),
            slots: Slots::new(parallelism),
        }
    }

    fn run<T>(&self, id: &BlockId, f: impl FnOnce(&dyn Backend) -> Result<T>) -> Result<T> {
        let lock = self
            .running
            .lock()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _slot = self.slots.acquire();
            let _held = lock.lock();
            f(self.inner.as_ref())
        };
        let mut running = self.running.lock();
        // Map entry plus our clone; nobody else is waiting on it
        if Arc::strong_count(&lock) == 2 {
            running.remove(id);
        }
        result
    }

    #[cfg(test)]
    fn tracked_ids(&self) -> usize {
        self.running.lock().len()
    }
}

impl Backend for MapRunnerBackend {
    fn get_block_by_id(&self, id: &BlockId) -> Result<Option<BlockMetadata>> {
        self.run(id, |be| be.get_block_by_id(id))
    }

    fn get_block_data(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
        self.run(id, |be| be.get_block_data(id))
    }

    fn store_block(&self, id: &BlockId, meta: BlockMetadata, data: &[u8]) -> Result<()> {
        self.run(id, |be| be.store_block(id, meta, data))
    }

    fn update_block(&self, id: &BlockId, meta: BlockMetadata) -> Result<usize> {
        self.run(id, |be| be.update_block(id, meta))
    }

    fn delete_block(&self, id: &BlockId) -> Result<()> {
        self.run(id, |be| be.delete_block(id))
    }

    fn get_name(&self, name: &str) -> Result<Option<BlockId>> {
        let _slot = self.slots.acquire();
        self.inner.get_name(name)
    }

    fn set_name(&self, name: &str, id: Option<&BlockId>) -> Result<()> {
        let _slot = self.slots.acquire();
        self.inner.set_name(name, id)
    }

    fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    fn bytes_available(&self) -> u64 {
        self.inner.bytes_available()
    }

    fn bytes_used(&self) -> u64 {
        self.inner.bytes_used()
    }

    fn set_in_flush(&self, in_flush: bool) {
        self.inner.set_in_flush(in_flush)
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}
