//! Keyspace of the filesystem tree.
//!
//! ```text
//! key = ino: u64 BE ‖ sub_type: u8 ‖ data
//! ```
//!
//! All keys of one inode are contiguous, and within an inode keys of the
//! same sub type are contiguous, so ranges can be walked with `next_key`
//! and dropped with one range delete.

use std::fmt;

use tfs_btree::BlockId;

const INO_LEN: usize = 8;
const HEADER_LEN: usize = INO_LEN + 1;

/// Bytes of the name hash prefixed to directory entry names
pub const NAME_HASH_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SubType {
    /// Lower bound of an inode's range
    None = 0x00,
    Meta = 0x01,
    Xattr = 0x02,
    DirName2Inode = 0x10,
    InoFilename = 0x20,
    Offset2Extent = 0x21,
    NameHashBlock = 0x30,
    /// Upper bound of an inode's range
    Last = 0xff,
}

impl TryFrom<u8> for SubType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        Ok(match value {
            0x00 => Self::None,
            0x01 => Self::Meta,
            0x02 => Self::Xattr,
            0x10 => Self::DirName2Inode,
            0x20 => Self::InoFilename,
            0x21 => Self::Offset2Extent,
            0x30 => Self::NameHashBlock,
            0xff => Self::Last,
            other => return Err(other),
        })
    }
}

/// 32-bit FNV-1a
pub fn fnv32(data: &[u8]) -> u32 {
    data.iter().fold(0x811c_9dc5u32, |h, &b| {
        (h ^ u32::from(b)).wrapping_mul(0x0100_0193)
    })
}

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockKey(Vec<u8>);

impl BlockKey {
    pub fn new(ino: u64, sub_type: SubType, data: &[u8]) -> Self {
        let mut key = Vec::with_capacity(HEADER_LEN + data.len());
        key.extend_from_slice(&ino.to_be_bytes());
        key.push(sub_type as u8);
        key.extend_from_slice(data);
        Self(key)
    }

    /// Wrap raw tree key bytes; `None` if too short to be a key
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        (bytes.len() >= HEADER_LEN).then(|| Self(bytes.to_vec()))
    }

    pub fn meta(ino: u64) -> Self {
        Self::new(ino, SubType::Meta, &[])
    }

    pub fn xattr(ino: u64, name: &[u8]) -> Self {
        Self::new(ino, SubType::Xattr, name)
    }

    pub fn dir_entry(dir: u64, name: &[u8]) -> Self {
        let mut data = Vec::with_capacity(NAME_HASH_SIZE + name.len());
        data.extend_from_slice(&fnv32(name).to_be_bytes());
        data.extend_from_slice(name);
        Self::new(dir, SubType::DirName2Inode, &data)
    }

    /// Back reference from `ino` to one of its directory entries
    pub fn ino_filename(ino: u64, parent: u64, name: &[u8]) -> Self {
        let mut data = Vec::with_capacity(INO_LEN + name.len());
        data.extend_from_slice(&parent.to_be_bytes());
        data.extend_from_slice(name);
        Self::new(ino, SubType::InoFilename, &data)
    }

    pub fn extent(ino: u64, index: u64) -> Self {
        Self::new(ino, SubType::Offset2Extent, &index.to_be_bytes())
    }

    pub fn name_block(ino: u64, name: &[u8], id: &BlockId) -> Self {
        let mut data = Vec::with_capacity(name.len() + 1 + id.as_bytes().len());
        data.extend_from_slice(name);
        data.push(0);
        data.extend_from_slice(id.as_bytes());
        Self::new(ino, SubType::NameHashBlock, &data)
    }

    /// First key of a sub type range of `ino`
    pub fn first(ino: u64, sub_type: SubType) -> Self {
        Self::new(ino, sub_type, &[])
    }

    pub fn ino(&self) -> u64 {
        let mut b = [0u8; INO_LEN];
        b.copy_from_slice(&self.0[..INO_LEN]);
        u64::from_be_bytes(b)
    }

    pub fn sub_type(&self) -> Option<SubType> {
        SubType::try_from(self.0[INO_LEN]).ok()
    }

    pub fn data(&self) -> &[u8] {
        &self.0[HEADER_LEN..]
    }

    /// Entry name of a directory entry key
    pub fn entry_name(&self) -> &[u8] {
        self.data().get(NAME_HASH_SIZE..).unwrap_or_default()
    }

    /// `(parent, name)` of a back reference key
    pub fn filename_parent(&self) -> Option<(u64, &[u8])> {
        let data = self.data();
        let parent: [u8; INO_LEN] = data.get(..INO_LEN)?.try_into().ok()?;
        Some((u64::from_be_bytes(parent), &data[INO_LEN..]))
    }

    /// Extent index of an extent key
    pub fn extent_index(&self) -> Option<u64> {
        let b: [u8; 8] = self.data().try_into().ok()?;
        Some(u64::from_be_bytes(b))
    }

    /// True if both keys belong to the same inode and sub type
    pub fn same_range(&self, ino: u64, sub_type: SubType) -> bool {
        self.ino() == ino && self.0[INO_LEN] == sub_type as u8
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl AsRef<[u8]> for BlockKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BlockKey({}/{:#04x}/{})",
            self.ino(),
            self.0[INO_LEN],
            String::from_utf8_lossy(self.data())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let key = BlockKey::meta(0x0102_0304_0506_0708);
        assert_eq!(key.as_bytes(), &[1, 2, 3, 4, 5, 6, 7, 8, 0x01]);
        assert_eq!(key.ino(), 0x0102_0304_0506_0708);
        assert_eq!(key.sub_type(), Some(SubType::Meta));
        assert!(key.data().is_empty());
    }

    #[test]
    fn test_inode_keys_sort_together() {
        let ino = 42;
        let keys = [
            BlockKey::first(ino, SubType::None),
            BlockKey::meta(ino),
            BlockKey::xattr(ino, b"user.x"),
            BlockKey::dir_entry(ino, b"file"),
            BlockKey::ino_filename(ino, 1, b"file"),
            BlockKey::extent(ino, 3),
            BlockKey::first(ino, SubType::Last),
            BlockKey::first(ino + 1, SubType::None),
        ];
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        assert!(BlockKey::extent(ino, 255) < BlockKey::extent(ino, 256));
    }

    #[test]
    fn test_entry_accessors() {
        let entry = BlockKey::dir_entry(1, b"name");
        assert_eq!(entry.entry_name(), b"name");
        assert_eq!(&entry.data()[..NAME_HASH_SIZE], &fnv32(b"name").to_be_bytes());

        let back = BlockKey::ino_filename(9, 1, b"name");
        assert_eq!(back.filename_parent(), Some((1, &b"name"[..])));
        assert_eq!(BlockKey::extent(9, 5).extent_index(), Some(5));
    }

    #[test]
    fn test_fnv32_reference_values() {
        assert_eq!(fnv32(b""), 0x811c_9dc5);
        assert_eq!(fnv32(b"a"), 0xe40c_292c);
    }
}
