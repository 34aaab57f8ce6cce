use std::sync::Arc;

use tfs_codec::{Codec, CodecChain};

use super::Backend;
use crate::{BlockId, BlockMetadata, Result};

/// Applies a codec chain to block data on its way to and from the inner
/// backend. The block id is the authenticated data, so a payload cannot be
/// moved under another id undetected.
pub struct CodecBackend {
    inner: Arc<dyn Backend>,
    codec: CodecChain,
}

impl CodecBackend {
    pub fn new(inner: Arc<dyn Backend>, codec: CodecChain) -> Self {
        Self { inner, codec }
    }

    pub fn codec(&self) -> &CodecChain {
        &self.codec
    }
}

impl Backend for CodecBackend {
    fn get_block_by_id(&self, id: &BlockId) -> Result<Option<BlockMetadata>> {
        self.inner.get_block_by_id(id)
    }

    fn get_block_data(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
        match self.inner.get_block_data(id)? {
            Some(encoded) => Ok(Some(self.codec.decode(&encoded, id.as_bytes())?)),
            None => Ok(None),
        }
    }

    fn store_block(&self, id: &BlockId, meta: BlockMetadata, data: &[u8]) -> Result<()> {
        let encoded = self.codec.encode(data, id.as_bytes())?;
        self.inner.store_block(id, meta, &encoded)
    }

    fn update_block(&self, id: &BlockId, meta: BlockMetadata) -> Result<usize> {
        self.inner.update_block(id, meta)
    }

    fn delete_block(&self, id: &BlockId) -> Result<()> {
        self.inner.delete_block(id)
    }

    fn get_name(&self, name: &str) -> Result<Option<BlockId>> {
        self.inner.get_name(name)
    }

    fn set_name(&self, name: &str, id: Option<&BlockId>) -> Result<()> {
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
