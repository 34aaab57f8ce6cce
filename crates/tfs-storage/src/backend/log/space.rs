//! Free space bookkeeping inside the log file's own tree.
//!
//! Every free extent is indexed twice:
//! - `"s" ‖ size BE ‖ offset BE` → empty, ordered for best-size lookups
//! - `"o" ‖ offset BE` → size BE, ordered for coalescing neighbours

use tfs_btree::Transaction;

use super::superblock::{overlapping, SUPERBLOCK_SIZE};
use crate::{Result, StorageError};

/// Allocation granularity
pub(super) const UNIT: u64 = 512;

const SIZE_PREFIX: u8 = b's';
const OFFSET_PREFIX: u8 = b'o';

pub(super) fn round_up(len: u64) -> u64 {
    len.max(1).div_ceil(UNIT) * UNIT
}

fn size_key(size: u64, offset: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.push(SIZE_PREFIX);
    key.extend_from_slice(&size.to_be_bytes());
    key.extend_from_slice(&offset.to_be_bytes());
    key
}

fn offset_key(offset: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(OFFSET_PREFIX);
    key.extend_from_slice(&offset.to_be_bytes());
    key
}

fn be_u64(bytes: &[u8]) -> Option<u64> {
    Some(u64::from_be_bytes(bytes.try_into().ok()?))
}

/// (size, offset) of a size index key
fn parse_size_key(key: &[u8]) -> Option<(u64, u64)> {
    match key {
        [SIZE_PREFIX, rest @ ..] if rest.len() == 16 => {
            Some((be_u64(&rest[..8])?, be_u64(&rest[8..])?))
        }
        _ => None,
    }
}

fn parse_offset_key(key: &[u8]) -> Option<u64> {
    match key {
        [OFFSET_PREFIX, rest @ ..] => be_u64(rest),
        _ => None,
    }
}

fn corrupt(what: &str) -> StorageError {
    StorageError::Corrupt(format!("free space index: {what}"))
}

fn insert_raw(tx: &mut Transaction, offset: u64, size: u64) -> Result<()> {
    tx.set(&size_key(size, offset), &[])?;
    tx.set(&offset_key(offset), &size.to_be_bytes())?;
    Ok(())
}

fn remove(tx: &mut Transaction, offset: u64, size: u64) -> Result<()> {
    let a = tx.delete(&size_key(size, offset))?;
    let b = tx.delete(&offset_key(offset))?;
    if !(a && b) {
        return Err(corrupt("removing an extent that is not free"));
    }
    Ok(())
}

/// Mark an extent free, merging it with free neighbours
pub(super) fn release(tx: &mut Transaction, mut offset: u64, mut size: u64) -> Result<()> {
    if size == 0 {
        return Ok(());
    }
    if let Some(prev) = tx.prev_key(&offset_key(offset))? {
        if let Some(prev_offset) = parse_offset_key(&prev) {
            let prev_size = tx
                .get(&prev)?
                .and_then(|v| be_u64(&v))
                .ok_or_else(|| corrupt("offset entry without size"))?;
            if prev_offset + prev_size > offset {
                return Err(corrupt("double free"));
            }
            if prev_offset + prev_size == offset {
                remove(tx, prev_offset, prev_size)?;
                offset = prev_offset;
                size += prev_size;
            }
        }
    }
    let next = offset + size;
    if let Some(value) = tx.get(&offset_key(next))? {
        let next_size = be_u64(&value).ok_or_else(|| corrupt("offset entry without size"))?;
        remove(tx, next, next_size)?;
        size += next_size;
    }
    insert_raw(tx, offset, size)
}

/// Take the smallest free extent that holds `size` bytes
pub(super) fn take_fit(tx: &mut Transaction, size: u64) -> Result<Option<u64>> {
    let Some((key, _)) = tx.seek(&size_key(size, 0))? else {
        return Ok(None);
    };
    let Some((found, offset)) = parse_size_key(&key) else {
        return Ok(None);
    };
    remove(tx, offset, found)?;
    if found > size {
        insert_raw(tx, offset + size, found - size)?;
    }
    Ok(Some(offset))
}

/// Gather the largest free extents until they add up to `size`.
///
/// Leaves the index untouched and returns `None` if all free space
/// together is not enough.
pub(super) fn take_fragments(tx: &mut Transaction, size: u64) -> Result<Option<Vec<(u64, u64)>>> {
    let mut picked = Vec::new();
    let mut total = 0;
    let mut cursor = vec![SIZE_PREFIX + 1];
    while total < size {
        let Some(key) = tx.prev_key(&cursor)? else {
            break;
        };
        let Some((found, offset)) = parse_size_key(&key) else {
            break;
        };
        picked.push((offset, found));
        total += found;
        cursor = key;
    }
    if total < size {
        return Ok(None);
    }

    let mut out = Vec::with_capacity(picked.len());
    let mut remaining = size;
    for (offset, found) in picked {
        remove(tx, offset, found)?;
        let take = found.min(remaining);
        out.push((offset, take));
        if take < found {
            insert_raw(tx, offset + take, found - take)?;
        }
        remaining -= take;
    }
    Ok(Some(out))
}

/// Place `size` bytes at the end of the file, stepping over superblock
/// slots. Returns the offset and the gaps left in front of skipped slots.
pub(super) fn place_at_end(mut end: u64, size: u64) -> (u64, Vec<(u64, u64)>) {
    let mut gaps = Vec::new();
    while let Some(slot) = overlapping(end, size) {
        if slot > end {
            gaps.push((end, slot - end));
        }
        end = slot + SUPERBLOCK_SIZE;
    }
    (end, gaps)
}

/// Sum of all free extents
pub(super) fn free_bytes(tx: &Transaction) -> Result<u64> {
    let mut total = 0;
    let mut cursor = vec![OFFSET_PREFIX];
    while let Some(key) = tx.next_key(&cursor)? {
        if parse_offset_key(&key).is_none() {
            break;
        }
        total += tx
            .get(&key)?
            .and_then(|v| be_u64(&v))
            .ok_or_else(|| corrupt("offset entry without size"))?;
        cursor = key;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tfs_btree::{MemoryNodeStore, Tree};

    fn tx() -> Transaction {
        let tree = Tree::new(Arc::new(MemoryNodeStore::new()));
        let root = tree.new_root();
        Transaction::new(tree, root)
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0), UNIT);
        assert_eq!(round_up(1), UNIT);
        assert_eq!(round_up(UNIT), UNIT);
        assert_eq!(round_up(UNIT + 1), 2 * UNIT);
    }

    #[test]
    fn test_release_coalesces() {
        let mut t = tx();
        release(&mut t, 1024, 512).unwrap();
        release(&mut t, 2048, 512).unwrap();
        release(&mut t, 1536, 512).unwrap();
        assert_eq!(free_bytes(&t).unwrap(), 1536);
        assert_eq!(take_fit(&mut t, 1536).unwrap(), Some(1024));
        assert_eq!(free_bytes(&t).unwrap(), 0);
    }

    #[test]
    fn test_double_free_detected() {
        let mut t = tx();
        release(&mut t, 1024, 1024).unwrap();
        assert!(release(&mut t, 1536, 512).is_err());
    }

    #[test]
    fn test_fit_prefers_smallest() {
        let mut t = tx();
        release(&mut t, 0, 4096).unwrap();
        release(&mut t, 8192, 1024).unwrap();
        assert_eq!(take_fit(&mut t, 512).unwrap(), Some(8192));
        // Remainder of the split extent stays free
        assert_eq!(take_fit(&mut t, 512).unwrap(), Some(8704));
        assert_eq!(take_fit(&mut t, 8192).unwrap(), None);
    }

    #[test]
    fn test_fragments_largest_first() {
        let mut t = tx();
        release(&mut t, 0, 512).unwrap();
        release(&mut t, 4096, 1024).unwrap();
        release(&mut t, 8192, 512).unwrap();

        assert_eq!(take_fragments(&mut t, 4096).unwrap(), None);
        assert_eq!(free_bytes(&t).unwrap(), 2048);

        let got = take_fragments(&mut t, 1536).unwrap().unwrap();
        assert_eq!(got, vec![(4096, 1024), (8192, 512)]);
        assert_eq!(free_bytes(&t).unwrap(), 512);
    }

    #[test]
    fn test_place_skips_superblocks() {
        assert_eq!(place_at_end(SUPERBLOCK_SIZE, 512), (SUPERBLOCK_SIZE, vec![]));
        let near = (1 << 20) - 512;
        let (at, gaps) = place_at_end(near, 1024);
        assert_eq!(at, (1 << 20) + SUPERBLOCK_SIZE);
        assert_eq!(gaps, vec![(near, 512)]);
    }
}
