//! Prefix-scoped view of a transaction.

use crate::{Result, Transaction};

/// Smallest byte string greater than every string starting with `prefix`.
///
/// `None` when no such string exists (empty or all `0xff` prefix).
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// Keys seen through a `SubTree` have the prefix stripped.
pub struct SubTree<'t> {
    tx: &'t mut Transaction,
    prefix: Vec<u8>,
}

impl<'t> SubTree<'t> {
    pub(crate) fn new(tx: &'t mut Transaction, prefix: Vec<u8>) -> Self {
        Self { tx, prefix }
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    fn full(&self, key: &[u8]) -> Vec<u8> {
        let mut k = Vec::with_capacity(self.prefix.len() + key.len());
        k.extend_from_slice(&self.prefix);
        k.extend_from_slice(key);
        k
    }

    fn strip(&self, key: Option<Vec<u8>>) -> Option<Vec<u8>> {
        key.filter(|k| k.starts_with(&self.prefix))
            .map(|k| k[self.prefix.len()..].to_vec())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.tx.get(&self.full(key))
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let k = self.full(key);
        self.tx.set(&k, value)
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        let k = self.full(key);
        self.tx.delete(&k)
    }

    pub fn next_key(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.strip(self.tx.next_key(&self.full(key))?))
    }

    pub fn prev_key(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.strip(self.tx.prev_key(&self.full(key))?))
    }

    pub fn first_key(&self) -> Result<Option<Vec<u8>>> {
        let first = self.tx.seek(&self.prefix)?.map(|(k, _)| k);
        Ok(self.strip(first))
    }

    pub fn delete_range(&mut self, start: &[u8], end: &[u8]) -> Result<()> {
        let (start, end) = (self.full(start), self.full(end));
        self.tx.delete_range(&start, &end)
    }

    /// Remove every key under the prefix
    pub fn clear(&mut self) -> Result<()> {
        let end = prefix_end(&self.prefix);
        let start = self.prefix.clone();
        self.tx.delete_range_bounded(&start, end.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{MemoryNodeStore, Tree};

    #[test]
    fn test_prefix_end() {
        assert_eq!(prefix_end(b"ab"), Some(b"ac".to_vec()));
        assert_eq!(prefix_end(&[1, 0xff]), Some(vec![2]));
        assert_eq!(prefix_end(&[0xff, 0xff]), None);
        assert_eq!(prefix_end(b""), None);
    }

    #[test]
    fn test_subtree_isolation() {
        let tree = Tree::with_max_size(256, Arc::new(MemoryNodeStore::new()));
        let mut t = Transaction::new(tree.clone(), tree.new_root());
        t.set(b"a", b"outside").unwrap();
        t.set(b"z", b"outside").unwrap();

        let mut sub = t.subtree(b"p/");
        for k in ["1", "2", "3"] {
            sub.set(k.as_bytes(), b"in").unwrap();
        }
        assert_eq!(sub.first_key().unwrap(), Some(b"1".to_vec()));
        assert_eq!(sub.next_key(b"1").unwrap(), Some(b"2".to_vec()));
        assert_eq!(sub.next_key(b"3").unwrap(), None);
        assert_eq!(sub.prev_key(b"1").unwrap(), None);

        sub.clear().unwrap();
        assert_eq!(sub.first_key().unwrap(), None);
        assert_eq!(t.get(b"a").unwrap(), Some(b"outside".to_vec()));
        assert_eq!(t.get(b"z").unwrap(), Some(b"outside".to_vec()));
    }
}
