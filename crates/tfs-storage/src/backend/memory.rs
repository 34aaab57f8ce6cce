use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::Backend;
use crate::{BlockId, BlockMetadata, Result, StorageError};

#[derive(Default)]
struct Inner {
    blocks: HashMap<BlockId, (BlockMetadata, Vec<u8>)>,
    names: HashMap<String, BlockId>,
}

/// Non-durable backend for tests and scratch stores.
///
/// Mutations are expected to happen only while the block store flushes.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    in_flush: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_count(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    fn assert_in_flush(&self) {
        debug_assert!(
            self.in_flush.load(Ordering::Relaxed),
            "memory backend mutated outside flush"
        );
    }
}

impl Backend for MemoryBackend {
    fn get_block_by_id(&self, id: &BlockId) -> Result<Option<BlockMetadata>> {
        Ok(self.inner.lock().blocks.get(id).map(|(meta, _)| *meta))
    }

    fn get_block_data(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().blocks.get(id).map(|(_, data)| data.clone()))
    }

    fn store_block(&self, id: &BlockId, meta: BlockMetadata, data: &[u8]) -> Result<()> {
        self.assert_in_flush();
        let mut inner = self.inner.lock();
        if inner.blocks.contains_key(id) {
            return Err(StorageError::BlockExists { id: id.clone() });
        }
        inner.blocks.insert(id.clone(), (meta, data.to_vec()));
        Ok(())
    }

    fn update_block(&self, id: &BlockId, meta: BlockMetadata) -> Result<usize> {
        self.assert_in_flush();
        let mut inner = self.inner.lock();
        let entry = inner
            .blocks
            .get_mut(id)
            .ok_or_else(|| StorageError::MissingBlock { id: id.clone() })?;
        entry.0 = meta;
        Ok(1)
    }

    fn delete_block(&self, id: &BlockId) -> Result<()> {
        self.assert_in_flush();
        self.inner
            .lock()
            .blocks
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StorageError::MissingBlock { id: id.clone() })
    }

    fn get_name(&self, name: &str) -> Result<Option<BlockId>> {
        Ok(self.inner.lock().names.get(name).cloned())
    }

    fn set_name(&self, name: &str, id: Option<&BlockId>) -> Result<()> {
        self.assert_in_flush();
        let mut inner = self.inner.lock();
        match id {
            Some(id) => inner.names.insert(name.to_string(), id.clone()),
            None => inner.names.remove(name),
        };
        Ok(())
    }

    fn bytes_available(&self) -> u64 {
        u64::MAX / 2
    }

    fn bytes_used(&self) -> u64 {
        self.inner
            .lock()
            .blocks
            .values()
            .map(|(_, data)| data.len() as u64)
            .sum()
    }

    fn set_in_flush(&self, in_flush: bool) {
        self.in_flush.store(in_flush, Ordering::Relaxed);
    }
}
