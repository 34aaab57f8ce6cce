use std::fs::File;
use std::os::unix::fs::FileExt;

use serde::{Deserialize, Serialize};

use crate::{Result, StorageError};

pub(super) const SUPERBLOCK_SIZE: u64 = 64 * 1024;

/// Second slot; every further slot is 16 times further out
const FIRST_SPREAD: u64 = 1 << 20;

const CHECKSUM_LEN: usize = 32;

/// Upper bound on deferred frees recorded in one superblock
pub(super) const MAX_PENDING_FREE: usize = 3800;

/// Slot offsets in ascending order, unbounded
fn all_slots() -> impl Iterator<Item = u64> {
    std::iter::once(0).chain(std::iter::successors(Some(FIRST_SPREAD), |s| {
        s.checked_mul(16)
    }))
}

/// Slots fully inside a file of `end` bytes
pub(super) fn slots(end: u64) -> Vec<u64> {
    all_slots()
        .take_while(|slot| slot + SUPERBLOCK_SIZE <= end)
        .collect()
}

/// First slot intersecting `[start, start + len)`
pub(super) fn overlapping(start: u64, len: u64) -> Option<u64> {
    all_slots()
        .take_while(|slot| *slot < start + len)
        .find(|slot| slot + SUPERBLOCK_SIZE > start)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(super) struct Superblock {
    pub generation: u64,
    pub bytes_used: u64,
    pub bytes_total: u64,
    /// Extents of the tree root node
    pub root: Vec<(u64, u64)>,
    /// Extents released by the flush that wrote this superblock; they are
    /// free only once it is durable
    pub pending_free: Vec<(u64, u64)>,
}

impl Superblock {
    /// `len u32 LE ‖ bincode body ‖ blake3(body)`
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        let total = 4 + body.len() + CHECKSUM_LEN;
        if total as u64 > SUPERBLOCK_SIZE {
            return Err(StorageError::Corrupt(format!(
                "superblock of {total} bytes does not fit its slot"
            )));
        }
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(blake3::hash(&body).as_bytes());
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        let len = u32::from_le_bytes(buf.get(..4)?.try_into().ok()?) as usize;
        let body = buf.get(4..4 + len)?;
        let checksum = buf.get(4 + len..4 + len + CHECKSUM_LEN)?;
        if blake3::hash(body).as_bytes() != checksum {
            return None;
        }
        bincode::deserialize(body).ok()
    }

    /// The superblock at `slot`, if one is there and intact
    pub fn read(file: &File, slot: u64) -> Option<Self> {
        let mut buf = vec![0u8; SUPERBLOCK_SIZE as usize];
        file.read_exact_at(&mut buf, slot).ok()?;
        Self::decode(&buf)
    }

    pub fn write(&self, file: &File, slot: u64) -> Result<()> {
        file.write_all_at(&self.encode()?, slot)?;
        Ok(())
    }
}
