//! LMDB backend.
//!
//! A single database keyed by a one-byte type prefix:
//! - `"1" ‖ id` → bincode [`BlockMetadata`]
//! - `"2" ‖ id` → block data
//! - `"3" ‖ name` → block id

use std::path::Path;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use tracing::debug;

use super::{Backend, DiskStats};
use crate::{BlockId, BlockMetadata, Result, StorageError};

const PREFIX_META: u8 = b'1';
const PREFIX_DATA: u8 = b'2';
const PREFIX_NAME: u8 = b'3';

fn key(prefix: u8, body: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + body.len());
    key.push(prefix);
    key.extend_from_slice(body);
    key
}

pub struct LmdbBackend {
    env: Env,
    db: Database<Bytes, Bytes>,
    stats: DiskStats,
}

impl LmdbBackend {
    /// Virtual map size; pages are only allocated as they are written
    const DEFAULT_MAP_SIZE: usize = 64 * 1024 * 1024 * 1024;

    const MAX_READERS: u32 = 128;

    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join("lmdb");
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(Self::DEFAULT_MAP_SIZE)
                .max_readers(Self::MAX_READERS)
                .max_dbs(1)
                .open(&path)?
        };

        let mut wtxn = env.write_txn()?;
        let db = env.create_database(&mut wtxn, Some("blocks"))?;
        wtxn.commit()?;

        debug!("Opened LMDB backend at {:?}", path);

        Ok(Self {
            env,
            db,
            stats: DiskStats::new(path),
        })
    }

    fn read_meta(&self, id: &BlockId) -> Result<Option<BlockMetadata>> {
        let rtxn = self.env.read_txn()?;
        match self.db.get(&rtxn, &key(PREFIX_META, id.as_bytes()))? {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes)?)),
            None => Ok(None),
        }
    }
}

impl Backend for LmdbBackend {
    fn get_block_by_id(&self, id: &BlockId) -> Result<Option<BlockMetadata>> {
        self.read_meta(id)
    }

    fn get_block_data(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
        let rtxn = self.env.read_txn()?;
        Ok(self
            .db
            .get(&rtxn, &key(PREFIX_DATA, id.as_bytes()))?
            .map(|data| data.to_vec()))
    }

    fn store_block(&self, id: &BlockId, meta: BlockMetadata, data: &[u8]) -> Result<()> {
        let meta_key = key(PREFIX_META, id.as_bytes());
        let mut wtxn = self.env.write_txn()?;
        if self.db.get(&wtxn, &meta_key)?.is_some() {
            return Err(StorageError::BlockExists { id: id.clone() });
        }
        self.db
            .put(&mut wtxn, &meta_key, &bincode::serialize(&meta)?)?;
        self.db
            .put(&mut wtxn, &key(PREFIX_DATA, id.as_bytes()), data)?;
        wtxn.commit()?;
        Ok(())
    }

    fn update_block(&self, id: &BlockId, meta: BlockMetadata) -> Result<usize> {
        let meta_key = key(PREFIX_META, id.as_bytes());
        let mut wtxn = self.env.write_txn()?;
        if self.db.get(&wtxn, &meta_key)?.is_none() {
            return Err(StorageError::MissingBlock { id: id.clone() });
        }
        self.db
            .put(&mut wtxn, &meta_key, &bincode::serialize(&meta)?)?;
        wtxn.commit()?;
        Ok(1)
    }

    fn delete_block(&self, id: &BlockId) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        if !self.db.delete(&mut wtxn, &key(PREFIX_META, id.as_bytes()))? {
            return Err(StorageError::MissingBlock { id: id.clone() });
        }
        self.db.delete(&mut wtxn, &key(PREFIX_DATA, id.as_bytes()))?;
        wtxn.commit()?;
        Ok(())
    }

    fn get_name(&self, name: &str) -> Result<Option<BlockId>> {
        let rtxn = self.env.read_txn()?;
        Ok(self
            .db
            .get(&rtxn, &key(PREFIX_NAME, name.as_bytes()))?
            .map(BlockId::from_bytes))
    }

    fn set_name(&self, name: &str, id: Option<&BlockId>) -> Result<()> {
        let name_key = key(PREFIX_NAME, name.as_bytes());
        let mut wtxn = self.env.write_txn()?;
        match id {
            Some(id) => self.db.put(&mut wtxn, &name_key, id.as_bytes())?,
            None => {
                self.db.delete(&mut wtxn, &name_key)?;
            }
        }
        wtxn.commit()?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.env.force_sync()?;
        Ok(())
    }

    fn bytes_available(&self) -> u64 {
        self.stats.available()
    }

    fn bytes_used(&self) -> u64 {
        self.stats.used()
    }
}
