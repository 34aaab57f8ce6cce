//! Copy-on-write mutation of a tree snapshot.

use std::sync::Arc;

use tracing::{debug, instrument, trace};

use crate::node::{Child, NODE_OVERHEAD};
use crate::stack::{descend, Frame};
use crate::{BlockId, Node, Result, SubTree, Tree, TreeError, TreeSaver, MAX_DEPTH};

/// Accumulates mutations against a root snapshot.
///
/// Nothing touches storage until [`Transaction::commit`]; the original
/// root is never modified.
#[derive(Clone)]
pub struct Transaction {
    tree: Tree,
    root: Arc<Node>,
    original: Arc<Node>,
}

impl Transaction {
    pub fn new(tree: Tree, root: Arc<Node>) -> Self {
        Self {
            tree,
            original: root.clone(),
            root,
        }
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Current (possibly uncommitted) root
    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    /// Root the transaction started from
    pub fn original(&self) -> &Arc<Node> {
        &self.original
    }

    /// True while there are uncommitted changes
    pub fn is_dirty(&self) -> bool {
        self.root.is_dirty()
    }

    /// True if the root differs from the one the transaction started from
    pub fn is_changed(&self) -> bool {
        if Arc::ptr_eq(&self.root, &self.original) {
            return false;
        }
        match (self.root.id(), self.original.id()) {
            (Some(a), Some(b)) => a != b,
            _ => true,
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut node = self.root.clone();
        for _ in 0..=MAX_DEPTH {
            if node.is_leafy() {
                return Ok(node
                    .search_leaf(key)
                    .ok()
                    .map(|i| node.children()[i].value().to_vec()));
            }
            if node.is_empty() {
                return Err(TreeError::Corrupt("empty interior node".into()));
            }
            let idx = node.search_interior(key);
            node = self.tree.child(&node, idx)?;
        }
        Err(TreeError::TooDeep)
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let (stack, leaf) = descend(&self.tree, &self.root, key)?;
        let mut children = leaf.children().to_vec();
        match leaf.search_leaf(key) {
            Ok(i) => {
                if children[i].value() == value {
                    return Ok(());
                }
                children[i] = Child::leaf(key.to_vec(), value.to_vec());
            }
            Err(i) => children.insert(i, Child::leaf(key.to_vec(), value.to_vec())),
        }
        let nodes = self.split(true, children);
        self.propagate(stack, nodes)
    }

    /// Remove `key`; returns whether it existed
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        let (stack, leaf) = descend(&self.tree, &self.root, key)?;
        let Ok(i) = leaf.search_leaf(key) else {
            return Ok(false);
        };
        let mut children = leaf.children().to_vec();
        children.remove(i);
        let nodes = self.split(true, children);
        self.propagate(stack, nodes)?;
        Ok(true)
    }

    /// Smallest key strictly greater than `key`
    pub fn next_key(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.find_next(&self.root, key, false, 0)?.map(|(k, _)| k))
    }

    /// Largest key strictly less than `key`
    pub fn prev_key(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.find_prev(&self.root, key, 0)
    }

    /// First entry with a key greater than or equal to `key`
    pub fn seek(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.find_next(&self.root, key, true, 0)
    }

    fn find_next(
        &self,
        node: &Arc<Node>,
        key: &[u8],
        inclusive: bool,
        depth: usize,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if depth > MAX_DEPTH {
            return Err(TreeError::TooDeep);
        }
        if node.is_leafy() {
            let idx = match node.search_leaf(key) {
                Ok(i) if inclusive => i,
                Ok(i) => i + 1,
                Err(i) => i,
            };
            return Ok(node
                .children()
                .get(idx)
                .map(|c| (c.key().to_vec(), c.value().to_vec())));
        }
        for idx in node.search_interior(key)..node.len() {
            let child = self.tree.child(node, idx)?;
            if let Some(found) = self.find_next(&child, key, inclusive, depth + 1)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    fn find_prev(&self, node: &Arc<Node>, key: &[u8], depth: usize) -> Result<Option<Vec<u8>>> {
        if depth > MAX_DEPTH {
            return Err(TreeError::TooDeep);
        }
        if node.is_leafy() {
            let idx = match node.search_leaf(key) {
                Ok(i) | Err(i) => i,
            };
            return Ok(idx
                .checked_sub(1)
                .map(|i| node.children()[i].key().to_vec()));
        }
        let end = node.children().partition_point(|c| c.key() < key);
        for idx in (0..end).rev() {
            let child = self.tree.child(node, idx)?;
            if let Some(found) = self.find_prev(&child, key, depth + 1)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Remove every key `k` with `start <= k < end`
    #[instrument(skip(self), level = "debug")]
    pub fn delete_range(&mut self, start: &[u8], end: &[u8]) -> Result<()> {
        self.delete_range_bounded(start, Some(end))
    }

    /// Like [`Transaction::delete_range`]; `None` means no upper bound
    pub fn delete_range_bounded(&mut self, start: &[u8], end: Option<&[u8]>) -> Result<()> {
        if end.is_some_and(|end| end <= start) {
            return Ok(());
        }
        let root = self.root.clone();
        let nodes = self.delete_range_in(&root, start, end, 0)?;
        if nodes.len() == 1 && Arc::ptr_eq(&nodes[0], &root) {
            return Ok(());
        }
        self.set_root(nodes)
    }

    fn delete_range_in(
        &self,
        node: &Arc<Node>,
        start: &[u8],
        end: Option<&[u8]>,
        depth: usize,
    ) -> Result<Vec<Arc<Node>>> {
        if depth > MAX_DEPTH {
            return Err(TreeError::TooDeep);
        }
        let in_range = |k: &[u8]| start <= k && end.map_or(true, |end| k < end);

        if node.is_leafy() {
            if !node.children().iter().any(|c| in_range(c.key())) {
                return Ok(vec![node.clone()]);
            }
            let kept = node
                .children()
                .iter()
                .filter(|c| !in_range(c.key()))
                .cloned()
                .collect();
            return Ok(self.split(true, kept));
        }

        let all = node.children();
        let mut children = Vec::with_capacity(all.len());
        let mut touched = Vec::new();
        let mut changed = false;
        for (idx, child) in all.iter().enumerate() {
            // Child `idx` holds keys in [key_idx, key_idx+1)
            let lo = child.key();
            let hi = all.get(idx + 1).map(|c| c.key());
            let covered = start <= lo
                && match (hi, end) {
                    (_, None) => true,
                    (Some(hi), Some(end)) => hi <= end,
                    (None, Some(_)) => false,
                };
            let disjoint = hi.is_some_and(|hi| hi <= start) || end.is_some_and(|end| end <= lo);
            if covered {
                changed = true;
                continue;
            }
            if disjoint {
                children.push(child.clone());
                continue;
            }
            let sub = self.tree.child(node, idx)?;
            let replaced = self.delete_range_in(&sub, start, end, depth + 1)?;
            if replaced.len() == 1 && Arc::ptr_eq(&replaced[0], &sub) {
                children.push(child.clone());
                continue;
            }
            changed = true;
            let pos = children.len();
            children.extend(
                replaced
                    .into_iter()
                    .filter(|n| !n.is_empty())
                    .map(Child::interior),
            );
            touched.push((pos, children.len()));
        }
        if !changed {
            return Ok(vec![node.clone()]);
        }
        for &(lo, hi) in touched.iter().rev() {
            self.rebalance(&mut children, lo, hi)?;
        }
        Ok(self.split(false, children))
    }

    /// Persist every dirty node and return the root id.
    ///
    /// Children are saved before their parents. Calling it again without
    /// further changes saves nothing.
    #[instrument(skip_all, level = "debug")]
    pub fn commit(&mut self, saver: &mut dyn TreeSaver) -> Result<BlockId> {
        let root = self.root.clone();
        let committed = Self::commit_node(&root, saver, 0)?;
        let id = committed
            .id()
            .cloned()
            .ok_or_else(|| TreeError::Corrupt("committed root has no id".into()))?;
        debug!(root = %id, "tree committed");
        self.root = committed;
        Ok(id)
    }

    fn commit_node(node: &Arc<Node>, saver: &mut dyn TreeSaver, depth: usize) -> Result<Arc<Node>> {
        if !node.is_dirty() {
            return Ok(node.clone());
        }
        if depth > MAX_DEPTH {
            return Err(TreeError::TooDeep);
        }
        let children = if node.is_leafy() {
            node.children().to_vec()
        } else {
            node.children()
                .iter()
                .map(|c| match c.loaded() {
                    Some(sub) if sub.is_dirty() => {
                        Ok(Child::interior(Self::commit_node(sub, saver, depth + 1)?))
                    }
                    _ if c.value().is_empty() => Err(TreeError::Corrupt(
                        "dirty child without resident node".into(),
                    )),
                    _ => Ok(c.clone()),
                })
                .collect::<Result<Vec<_>>>()?
        };
        let fresh = Node::new(node.is_leafy(), children);
        let id = saver.save_node(fresh.encode()?)?;
        trace!(id = %id, size = fresh.size(), leafy = fresh.is_leafy(), "saved node");
        let saved = Arc::new(fresh.with_id(id));
        saver.node_saved(&saved);
        Ok(saved)
    }

    /// View restricted to keys starting with `prefix`
    pub fn subtree(&mut self, prefix: &[u8]) -> SubTree<'_> {
        SubTree::new(self, prefix.to_vec())
    }

    /// Re-point this transaction at a different root.
    pub fn reset(&mut self, root: Arc<Node>) {
        self.original = root.clone();
        self.root = root;
    }

    /// Rebuild ancestors after the node under the deepest frame was replaced.
    fn propagate(&mut self, mut stack: Vec<Frame>, mut nodes: Vec<Arc<Node>>) -> Result<()> {
        while let Some(Frame { node: parent, idx }) = stack.pop() {
            let all = parent.children();
            let mut children = Vec::with_capacity(all.len() + nodes.len());
            children.extend_from_slice(&all[..idx]);
            let lo = children.len();
            children.extend(
                nodes
                    .into_iter()
                    .filter(|n| !n.is_empty())
                    .map(Child::interior),
            );
            let hi = children.len();
            children.extend_from_slice(&all[idx + 1..]);
            self.rebalance(&mut children, lo, hi)?;
            nodes = self.split(false, children);
        }
        self.set_root(nodes)
    }

    /// Merge or redistribute undersized nodes in `children[lo..hi]`
    /// with a neighbour.
    fn rebalance(&self, children: &mut Vec<Child>, lo: usize, hi: usize) -> Result<()> {
        let mut i = hi.min(children.len());
        while i > lo {
            i -= 1;
            if i >= children.len() || children.len() < 2 {
                continue;
            }
            let node = self.load(&children[i])?;
            if node.size() >= self.tree.small_size() {
                continue;
            }
            let left = match i.checked_sub(1) {
                Some(j) => Some((j, self.load(&children[j])?)),
                None => None,
            };
            let right = match children.get(i + 1) {
                Some(c) => Some((i + 1, self.load(c)?)),
                None => None,
            };
            let (j, sibling) = match (left, right) {
                (Some(l), Some(r)) => {
                    if l.1.size() <= r.1.size() {
                        l
                    } else {
                        r
                    }
                }
                (Some(l), None) => l,
                (None, Some(r)) => r,
                (None, None) => continue,
            };
            let (a, b, first, second) = if j < i {
                (j, i, sibling, node)
            } else {
                (i, j, node, sibling)
            };
            let leafy = first.is_leafy();
            let mut merged = first.children().to_vec();
            merged.extend_from_slice(second.children());
            let half = self.tree.half_size();
            if first.size() > half || second.size() > half {
                let halves = self.halve(leafy, merged);
                children.splice(a..=b, halves.into_iter().map(Child::interior));
                i = a;
            } else {
                let combined = self.split(leafy, merged);
                let merged_one = combined.len() == 1;
                children.splice(a..=b, combined.into_iter().map(Child::interior));
                // A merged node may still be small; look at it again
                i = if merged_one { a + 1 } else { a };
            }
        }
        Ok(())
    }

    fn load(&self, child: &Child) -> Result<Arc<Node>> {
        if let Some(node) = child.loaded() {
            return Ok(node.clone());
        }
        let id = child
            .child_id()
            .ok_or_else(|| TreeError::Corrupt("dirty child without resident node".into()))?;
        self.tree.loader().load_node(&id)
    }

    /// Build nodes of at most `max_size` bytes from `children`.
    fn split(&self, leafy: bool, children: Vec<Child>) -> Vec<Arc<Node>> {
        let node = Node::new(leafy, children);
        if node.size() <= self.tree.max_size() || node.len() < 2 {
            return vec![Arc::new(node)];
        }
        self.halve(leafy, node.into_children())
    }

    /// Split `children` into two nodes of similar encoded size.
    fn halve(&self, leafy: bool, mut children: Vec<Child>) -> Vec<Arc<Node>> {
        if children.len() < 2 {
            return vec![Arc::new(Node::new(leafy, children))];
        }
        let total: usize = children.iter().map(|c| c.encoded_size(leafy)).sum();
        let mut acc = NODE_OVERHEAD;
        let mut cut = children.len() - 1;
        for (i, c) in children.iter().enumerate() {
            acc += c.encoded_size(leafy);
            if acc * 2 >= total + NODE_OVERHEAD * 2 {
                cut = (i + 1).clamp(1, children.len() - 1);
                break;
            }
        }
        let right = children.split_off(cut);
        let mut out = self.split(leafy, children);
        out.extend(self.split(leafy, right));
        out
    }

    fn set_root(&mut self, nodes: Vec<Arc<Node>>) -> Result<()> {
        let mut nodes: Vec<_> = nodes.into_iter().filter(|n| !n.is_empty()).collect();
        while nodes.len() > 1 {
            let children = nodes.into_iter().map(Child::interior).collect();
            nodes = self.split(false, children);
        }
        let mut root = nodes.pop().unwrap_or_else(|| self.tree.new_root());
        // Collapse single-child interior roots
        while !root.is_leafy() && root.len() == 1 {
            root = self.load(&root.children()[0])?;
        }
        self.root = root;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryNodeStore;

    fn tx(max: usize) -> (Arc<MemoryNodeStore>, Transaction) {
        let store = Arc::new(MemoryNodeStore::new());
        let tree = Tree::with_max_size(max, store.clone());
        let root = tree.new_root();
        (store, Transaction::new(tree, root))
    }

    fn key(i: u32) -> Vec<u8> {
        format!("{i:04}").into_bytes()
    }

    #[test]
    fn test_set_get_overwrite() {
        let (_store, mut t) = tx(256);
        t.set(b"a", b"1").unwrap();
        t.set(b"a", b"2").unwrap();
        assert_eq!(t.get(b"a").unwrap(), Some(b"2".to_vec()));
        assert_eq!(t.get(b"b").unwrap(), None);
        assert!(t.is_dirty());
    }

    #[test]
    fn test_root_splits_and_collapses() {
        let (store, mut t) = tx(256);
        for i in 0..200 {
            t.set(&key(i), &key(i)).unwrap();
        }
        assert!(!t.root().is_leafy());
        assert!(t.root().check(store.as_ref()).unwrap() > 1);

        for i in 0..200 {
            assert!(t.delete(&key(i)).unwrap());
        }
        assert!(t.root().is_leafy());
        assert!(t.root().is_empty());
    }

    #[test]
    fn test_delete_missing_key() {
        let (_store, mut t) = tx(256);
        t.set(b"x", b"y").unwrap();
        assert!(!t.delete(b"z").unwrap());
        assert_eq!(t.get(b"x").unwrap(), Some(b"y".to_vec()));
    }

    #[test]
    fn test_next_prev_on_boundaries() {
        let (_store, mut t) = tx(256);
        for i in (0..100).step_by(2) {
            t.set(&key(i), b"v").unwrap();
        }
        assert_eq!(t.next_key(&key(10)).unwrap(), Some(key(12)));
        assert_eq!(t.next_key(&key(11)).unwrap(), Some(key(12)));
        assert_eq!(t.prev_key(&key(11)).unwrap(), Some(key(10)));
        assert_eq!(t.next_key(&key(98)).unwrap(), None);
        assert_eq!(t.prev_key(&key(0)).unwrap(), None);
        assert_eq!(t.next_key(b"").unwrap(), Some(key(0)));
        assert_eq!(t.seek(&key(4)).unwrap().map(|(k, _)| k), Some(key(4)));
    }

    #[test]
    fn test_commit_is_idempotent() {
        let (store, mut t) = tx(256);
        for i in 0..300 {
            t.set(&key(i), &key(i)).unwrap();
        }
        let id = t.commit(&mut store.as_ref()).unwrap();
        let saved = store.saves();
        assert!(!t.is_dirty());
        assert_eq!(t.commit(&mut store.as_ref()).unwrap(), id);
        assert_eq!(store.saves(), saved);
    }

    #[test]
    fn test_reload_after_commit() {
        let (store, mut t) = tx(256);
        for i in 0..500 {
            t.set(&key(i), &key(i)).unwrap();
        }
        let id = t.commit(&mut store.as_ref()).unwrap();
        let first_commit = store.saves();

        let tree = Tree::with_max_size(256, store.clone());
        let root = tree.load_root(&id).unwrap();
        root.check(store.as_ref()).unwrap();
        let mut t2 = Transaction::new(tree, root);
        assert_eq!(t2.get(&key(321)).unwrap(), Some(key(321)));

        // Modifying the reloaded tree keeps untouched nodes by id
        t2.set(&key(1000), b"new").unwrap();
        let before = store.saves();
        t2.commit(&mut store.as_ref()).unwrap();
        assert!(store.saves() - before < first_commit / 4);
    }

    #[test]
    fn test_delete_range_unbounded() {
        let (store, mut t) = tx(256);
        for i in 0..400 {
            t.set(&key(i), b"v").unwrap();
        }
        t.delete_range_bounded(&key(100), None).unwrap();
        t.root().check(store.as_ref()).unwrap();
        assert_eq!(t.get(&key(99)).unwrap(), Some(b"v".to_vec()));
        assert_eq!(t.next_key(&key(99)).unwrap(), None);
    }

    #[test]
    fn test_empty_range_is_noop() {
        let (_store, mut t) = tx(256);
        t.set(b"k", b"v").unwrap();
        let root = t.root().clone();
        t.delete_range(b"z", b"a").unwrap();
        t.delete_range(b"l", b"m").unwrap();
        assert!(Arc::ptr_eq(&root, t.root()));
    }
}
