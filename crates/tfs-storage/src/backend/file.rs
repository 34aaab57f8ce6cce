//! Directory tree backend with metadata encoded in file names.
//!
//! ## Layout
//!
//! ```text
//! <dir>/
//! ├── blocks/
//! │   └── ab/
//! │       └── cd/
//! │           └── ef01..._<refcount>_<status>   # block data
//! └── names/
//!     └── <hex name>                            # raw block id bytes
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, trace};

use super::{Backend, DiskStats};
use crate::{BlockId, BlockMetadata, BlockStatus, Result, StorageError};

pub struct FileBackend {
    dir: PathBuf,
    stats: DiskStats,
}

impl FileBackend {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join("blocks"))?;
        fs::create_dir_all(dir.join("names"))?;
        debug!(dir = %dir.display(), "opened file backend");
        Ok(Self {
            stats: DiskStats::new(&dir),
            dir,
        })
    }

    /// Fan-out directory and file name prefix for a block
    fn block_dir(&self, id: &BlockId) -> (PathBuf, String) {
        let hex = id.to_hex();
        if hex.len() < 6 {
            return (self.dir.join("blocks").join("short"), format!("{hex}_"));
        }
        let (l1, rest) = hex.split_at(2);
        let (l2, rest) = rest.split_at(2);
        (
            self.dir.join("blocks").join(l1).join(l2),
            format!("{rest}_"),
        )
    }

    fn block_path(&self, id: &BlockId, meta: &BlockMetadata) -> PathBuf {
        let (dir, prefix) = self.block_dir(id);
        dir.join(format!("{prefix}{}_{}", meta.ref_count, meta.status as u8))
    }

    fn name_path(&self, name: &str) -> PathBuf {
        self.dir.join("names").join(hex::encode(name.as_bytes()))
    }

    fn parse_suffix(suffix: &str) -> Option<BlockMetadata> {
        let (refs, status) = suffix.split_once('_')?;
        let ref_count = refs.parse().ok()?;
        let status = BlockStatus::try_from(status.parse::<u8>().ok()?).ok()?;
        Some(BlockMetadata { ref_count, status })
    }

    fn find(&self, id: &BlockId) -> Result<Option<(PathBuf, BlockMetadata)>> {
        let (dir, prefix) = self.block_dir(id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(suffix) = name.strip_prefix(&prefix) else {
                continue;
            };
            if let Some(meta) = Self::parse_suffix(suffix) {
                return Ok(Some((entry.path(), meta)));
            }
        }
        Ok(None)
    }

    fn existing(&self, id: &BlockId) -> Result<(PathBuf, BlockMetadata)> {
        self.find(id)?
            .ok_or_else(|| StorageError::MissingBlock { id: id.clone() })
    }

    /// Write via a temporary file and rename into place
    fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
        let temp_name = format!(
            "{}.{}.tmp",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            std::process::id()
        );
        let temp_path = path.with_file_name(temp_name);
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        if let Err(e) = fs::rename(&temp_path, path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }
        Ok(())
    }
}

impl Backend for FileBackend {
    fn get_block_by_id(&self, id: &BlockId) -> Result<Option<BlockMetadata>> {
        Ok(self.find(id)?.map(|(_, meta)| meta))
    }

    fn get_block_data(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
        match self.find(id)? {
            Some((path, _)) => Ok(Some(fs::read(path)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, data), level = "debug")]
    fn store_block(&self, id: &BlockId, meta: BlockMetadata, data: &[u8]) -> Result<()> {
        if self.find(id)?.is_some() {
            return Err(StorageError::BlockExists { id: id.clone() });
        }
        let path = self.block_path(id, &meta);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Self::write_atomic(&path, data)
    }

    fn update_block(&self, id: &BlockId, meta: BlockMetadata) -> Result<usize> {
        let (old, stored) = self.existing(id)?;
        if stored == meta {
            return Ok(0);
        }
        let new = self.block_path(id, &meta);
        trace!(old = %old.display(), new = %new.display(), "renaming block");
        fs::rename(old, new)?;
        Ok(1)
    }

    fn delete_block(&self, id: &BlockId) -> Result<()> {
        let (path, _) = self.existing(id)?;
        fs::remove_file(path)?;
        Ok(())
    }

    fn get_name(&self, name: &str) -> Result<Option<BlockId>> {
        match fs::read(self.name_path(name)) {
            Ok(bytes) => Ok(Some(BlockId::from_bytes(bytes))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_name(&self, name: &str, id: Option<&BlockId>) -> Result<()> {
        let path = self.name_path(name);
        match id {
            Some(id) => Self::write_atomic(&path, id.as_bytes()),
            None => match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }

    fn bytes_available(&self) -> u64 {
        self.stats.available()
    }

    fn bytes_used(&self) -> u64 {
        self.stats.used()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_metadata_in_file_name() {
        let temp = TempDir::new().unwrap();
        let be = FileBackend::open(temp.path()).unwrap();
        let id = BlockId::for_content(b"x");
        be.store_block(&id, BlockMetadata::new(3, BlockStatus::Weak), b"x")
            .unwrap();

        let hex = id.to_hex();
        let expected = temp
            .path()
            .join("blocks")
            .join(&hex[..2])
            .join(&hex[2..4])
            .join(format!("{}_3_4", &hex[4..]));
        assert!(expected.exists());

        assert_eq!(be.update_block(&id, BlockMetadata::new(3, BlockStatus::Weak)).unwrap(), 0);
        assert_eq!(be.update_block(&id, BlockMetadata::new(1, BlockStatus::Normal)).unwrap(), 1);
        assert!(!expected.exists());
    }

    #[test]
    fn test_store_existing_fails() {
        let temp = TempDir::new().unwrap();
        let be = FileBackend::open(temp.path()).unwrap();
        let id = BlockId::for_content(b"y");
        be.store_block(&id, BlockMetadata::default(), b"y").unwrap();
        assert!(matches!(
            be.store_block(&id, BlockMetadata::default(), b"y"),
            Err(StorageError::BlockExists { .. })
        ));
    }
}
