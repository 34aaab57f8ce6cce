//! File contents: inline bytes for small files, extent blocks beyond.

use tfs_hugger::Transaction;
use tfs_storage::BlockStatus;
use tracing::trace;

use crate::inode;
use crate::key::{BlockKey, SubType};
use crate::meta::InodeMeta;
use crate::{Fs, FsError, FsOptions, Result, EXTENT_TAG};

fn load_extent(tr: &Transaction, ino: u64, index: u64) -> Result<Option<Vec<u8>>> {
    let Some(id) = tr.get(BlockKey::extent(ino, index).as_bytes())? else {
        return Ok(None);
    };
    let id = tfs_btree::BlockId::from_bytes(id);
    let handle = tr
        .hugger()
        .store()
        .get_block_by_id(&id)?
        .ok_or_else(|| FsError::Corrupt(format!("extent {index} of {ino} missing")))?;
    match handle.data()?.split_first() {
        Some((&EXTENT_TAG, bytes)) => Ok(Some(bytes.to_vec())),
        _ => Err(FsError::Corrupt(format!("extent {index} of {ino} has wrong tag"))),
    }
}

fn save_extent(tr: &mut Transaction, ino: u64, index: u64, bytes: &[u8]) -> Result<()> {
    let mut block = Vec::with_capacity(bytes.len() + 1);
    block.push(EXTENT_TAG);
    block.extend_from_slice(bytes);
    let id = tr.store_block_data(BlockStatus::Normal, block)?;
    tr.set(BlockKey::extent(ino, index).as_bytes(), id.as_bytes())?;
    trace!(ino, index, len = bytes.len(), "extent saved");
    Ok(())
}

fn is_inline(meta: &InodeMeta, opts: &FsOptions) -> bool {
    meta.size <= opts.embedded_size as u64
}

/// Up to `size` bytes at `offset`, clamped to the file size
pub(crate) fn read_in(
    tr: &Transaction,
    ino: u64,
    meta: &InodeMeta,
    opts: &FsOptions,
    offset: u64,
    size: usize,
) -> Result<Vec<u8>> {
    if offset >= meta.size || size == 0 {
        return Ok(Vec::new());
    }
    let end = meta.size.min(offset + size as u64);
    let mut out = vec![0u8; (end - offset) as usize];
    if is_inline(meta, opts) {
        let inline = &meta.inline_data;
        let lo = (offset as usize).min(inline.len());
        let hi = (end as usize).min(inline.len());
        out[..hi - lo].copy_from_slice(&inline[lo..hi]);
        return Ok(out);
    }
    let es = opts.extent_size as u64;
    for index in offset / es..=(end - 1) / es {
        let Some(bytes) = load_extent(tr, ino, index)? else {
            continue;
        };
        let start = index * es;
        let lo = offset.max(start);
        let hi = end.min(start + bytes.len() as u64);
        if lo >= hi {
            continue;
        }
        out[(lo - offset) as usize..(hi - offset) as usize]
            .copy_from_slice(&bytes[(lo - start) as usize..(hi - start) as usize]);
    }
    Ok(out)
}

/// Move inline bytes to extent 0
fn spill_inline(tr: &mut Transaction, ino: u64, meta: &mut InodeMeta) -> Result<()> {
    let inline = std::mem::take(&mut meta.inline_data);
    if !inline.is_empty() {
        save_extent(tr, ino, 0, &inline)?;
    }
    Ok(())
}

pub(crate) fn write_in(
    tr: &mut Transaction,
    ino: u64,
    meta: &mut InodeMeta,
    opts: &FsOptions,
    offset: u64,
    data: &[u8],
) -> Result<()> {
    let end = offset + data.len() as u64;
    let new_size = meta.size.max(end);
    if new_size <= opts.embedded_size as u64 {
        let inline = &mut meta.inline_data;
        inline.resize(new_size as usize, 0);
        inline[offset as usize..end as usize].copy_from_slice(data);
    } else {
        if is_inline(meta, opts) {
            spill_inline(tr, ino, meta)?;
        }
        let es = opts.extent_size as u64;
        for index in offset / es..=(end - 1) / es {
            let start = index * es;
            let lo = offset.max(start) - start;
            let hi = end.min(start + es) - start;
            let mut bytes = load_extent(tr, ino, index)?.unwrap_or_default();
            if (bytes.len() as u64) < hi {
                bytes.resize(hi as usize, 0);
            }
            let src = (start + lo - offset) as usize..(start + hi - offset) as usize;
            bytes[lo as usize..hi as usize].copy_from_slice(&data[src]);
            save_extent(tr, ino, index, &bytes)?;
        }
    }
    meta.size = new_size;
    meta.touch_mtime();
    Ok(())
}

pub(crate) fn truncate_in(
    tr: &mut Transaction,
    ino: u64,
    meta: &mut InodeMeta,
    opts: &FsOptions,
    new_size: u64,
) -> Result<()> {
    if new_size == meta.size {
        return Ok(());
    }
    let embedded = opts.embedded_size as u64;
    let es = opts.extent_size as u64;
    if is_inline(meta, opts) {
        if new_size <= embedded {
            meta.inline_data.resize(new_size as usize, 0);
        } else {
            spill_inline(tr, ino, meta)?;
        }
    } else if new_size <= embedded {
        let bytes = read_in(tr, ino, meta, opts, 0, new_size as usize)?;
        let first = BlockKey::first(ino, SubType::Offset2Extent);
        inode::delete_sub_range(tr, &first, ino, SubType::Offset2Extent)?;
        meta.inline_data = bytes;
    } else if new_size < meta.size {
        let last = (new_size - 1) / es;
        let cut = BlockKey::extent(ino, last + 1);
        inode::delete_sub_range(tr, &cut, ino, SubType::Offset2Extent)?;
        let tail = (new_size - last * es) as usize;
        if let Some(mut bytes) = load_extent(tr, ino, last)? {
            if bytes.len() > tail {
                bytes.truncate(tail);
                save_extent(tr, ino, last, &bytes)?;
            }
        }
    }
    meta.size = new_size;
    meta.touch_mtime();
    Ok(())
}

impl Fs {
    fn extent_span(&self, offset: u64, len: u64) -> std::ops::RangeInclusive<u64> {
        let es = self.options.extent_size as u64;
        offset / es..=(offset + len.max(1) - 1) / es
    }

    pub(crate) fn read_data(&self, ino: u64, offset: u64, size: usize) -> Result<Vec<u8>> {
        let _extents: Vec<_> = self
            .extent_span(offset, size as u64)
            .map(|index| self.extent_locks.lock((ino, index)))
            .collect();
        let tr = self.hugger.transaction();
        let meta = inode::meta(&tr, ino)?;
        if meta.is_dir() {
            return Err(FsError::IsDir);
        }
        read_in(&tr, ino, &meta, &self.options, offset, size)
    }

    /// Write `data` at `offset`; returns the bytes written.
    pub(crate) fn write_data(&self, ino: u64, offset: u64, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let _meta = self.meta_locks.lock(ino);
        let span = self.extent_span(offset, data.len() as u64);
        let _permit = (span.end() > span.start()).then(|| self.limiter.acquire());
        let _extents: Vec<_> = span
            .map(|index| self.extent_locks.lock((ino, index)))
            .collect();
        self.hugger.update(|tr| -> Result<()> {
            let mut meta = inode::meta(tr, ino)?;
            if meta.is_dir() {
                return Err(FsError::IsDir);
            }
            write_in(tr, ino, &mut meta, &self.options, offset, data)?;
            inode::set_meta(tr, ino, &meta)
        })?;
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use tfs_codec::CodecChain;
    use tfs_storage::BackendKind;

    use super::*;
    use crate::meta::S_IFREG;

    fn small_fs() -> Fs {
        let store =
            crate::open_store(BackendKind::Memory, Path::new(""), CodecChain::identity()).unwrap();
        let options = FsOptions {
            embedded_size: 8,
            extent_size: 16,
            ..FsOptions::default()
        };
        Fs::mount(Arc::new(store), options).unwrap()
    }

    fn with_file<T>(fs: &Fs, f: impl FnOnce(&mut Transaction, &mut InodeMeta) -> T) -> T {
        let mut tr = fs.hugger().transaction();
        let mut meta = InodeMeta::new(S_IFREG | 0o644, 0, 0, 1);
        f(&mut tr, &mut meta)
    }

    #[test]
    fn test_inline_until_embedded_size() {
        let fs = small_fs();
        with_file(&fs, |tr, meta| {
            write_in(tr, 9, meta, fs.options(), 0, b"12345678").unwrap();
            assert_eq!(meta.inline_data, b"12345678");
            assert!(inode::sub_type_keys(tr, 9, SubType::Offset2Extent).unwrap().is_empty());

            write_in(tr, 9, meta, fs.options(), 8, b"9").unwrap();
            assert!(meta.inline_data.is_empty());
            assert_eq!(meta.size, 9);
            let data = read_in(tr, 9, meta, fs.options(), 0, 100).unwrap();
            assert_eq!(data, b"123456789");
        });
    }

    #[test]
    fn test_write_straddling_extents() {
        let fs = small_fs();
        with_file(&fs, |tr, meta| {
            let data: Vec<u8> = (0..40u8).collect();
            write_in(tr, 9, meta, fs.options(), 10, &data).unwrap();
            assert_eq!(meta.size, 50);
            let keys = inode::sub_type_keys(tr, 9, SubType::Offset2Extent).unwrap();
            let indexes: Vec<_> = keys.iter().filter_map(|k| k.extent_index()).collect();
            assert_eq!(indexes, vec![0, 1, 2, 3]);

            let read = read_in(tr, 9, meta, fs.options(), 0, 50).unwrap();
            assert_eq!(&read[..10], &[0u8; 10]);
            assert_eq!(&read[10..], &data[..]);
            assert_eq!(read_in(tr, 9, meta, fs.options(), 15, 3).unwrap(), vec![5, 6, 7]);
        });
    }

    #[test]
    fn test_truncate_shapes() {
        let fs = small_fs();
        with_file(&fs, |tr, meta| {
            let data: Vec<u8> = (1..=40u8).collect();
            write_in(tr, 9, meta, fs.options(), 0, &data).unwrap();

            truncate_in(tr, 9, meta, fs.options(), 20).unwrap();
            let keys = inode::sub_type_keys(tr, 9, SubType::Offset2Extent).unwrap();
            assert_eq!(keys.len(), 2);
            assert_eq!(read_in(tr, 9, meta, fs.options(), 0, 100).unwrap(), &data[..20]);

            // Growing again must not resurrect the cut bytes
            truncate_in(tr, 9, meta, fs.options(), 40).unwrap();
            let read = read_in(tr, 9, meta, fs.options(), 0, 100).unwrap();
            assert_eq!(&read[..20], &data[..20]);
            assert_eq!(&read[20..], &[0u8; 20]);

            truncate_in(tr, 9, meta, fs.options(), 5).unwrap();
            assert_eq!(meta.inline_data, &data[..5]);
            assert!(inode::sub_type_keys(tr, 9, SubType::Offset2Extent).unwrap().is_empty());

            truncate_in(tr, 9, meta, fs.options(), 12).unwrap();
            assert_eq!(read_in(tr, 9, meta, fs.options(), 0, 100).unwrap(), {
                let mut v = data[..5].to_vec();
                v.resize(12, 0);
                v
            });
        });
    }
}
