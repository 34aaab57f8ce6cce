//! Difference between two tree snapshots.

use std::sync::Arc;

use crate::stack::{Cursor, Item};
use crate::{Node, Tree, TreeError};

enum Step {
    Done,
    SkipBoth,
    ExpandOld,
    ExpandNew,
    Deleted(Vec<u8>, Vec<u8>),
    Inserted(Vec<u8>, Vec<u8>),
    Both(Vec<u8>, Vec<u8>, Vec<u8>),
}

fn same_subtree(a: &crate::node::Child, b: &crate::node::Child) -> bool {
    if let (Some(x), Some(y)) = (a.loaded(), b.loaded()) {
        if Arc::ptr_eq(x, y) {
            return true;
        }
    }
    !a.value().is_empty() && a.value() == b.value()
}

/// Call `f(key, old, new)` for every key whose value differs between
/// `old` and `new`, in key order.
///
/// Deleted keys report `(Some, None)`, new keys `(None, Some)`, changed
/// keys `(Some, Some)`. Subtrees shared by both snapshots are skipped
/// without being loaded.
pub fn iterate_delta<F, E>(tree: &Tree, old: &Arc<Node>, new: &Arc<Node>, mut f: F) -> Result<(), E>
where
    F: FnMut(&[u8], Option<&[u8]>, Option<&[u8]>) -> Result<(), E>,
    E: From<TreeError>,
{
    if Arc::ptr_eq(old, new) {
        return Ok(());
    }
    if let (Some(a), Some(b)) = (old.id(), new.id()) {
        if a == b {
            return Ok(());
        }
    }

    let mut a = Cursor::new(tree, old);
    let mut b = Cursor::new(tree, new);
    loop {
        let step = match (a.peek(), b.peek()) {
            (None, None) => Step::Done,
            (Some(Item::Subtree(_)), None) => Step::ExpandOld,
            (Some(Item::Entry(x)), None) => Step::Deleted(x.key().to_vec(), x.value().to_vec()),
            (None, Some(Item::Subtree(_))) => Step::ExpandNew,
            (None, Some(Item::Entry(y))) => Step::Inserted(y.key().to_vec(), y.value().to_vec()),
            (Some(Item::Subtree(x)), Some(Item::Subtree(y)))
                if x.key() == y.key() && same_subtree(x, y) =>
            {
                Step::SkipBoth
            }
            (Some(x @ Item::Subtree(_)), Some(y)) if x.key() <= y.key() => Step::ExpandOld,
            (Some(x), Some(y @ Item::Subtree(_))) if y.key() <= x.key() => Step::ExpandNew,
            (Some(Item::Subtree(_)), Some(Item::Subtree(_))) => Step::ExpandNew,
            // At least one side is an entry with a strictly smaller key than
            // anything the other side can still produce, or both are entries.
            (Some(Item::Entry(x)), Some(Item::Entry(y))) => match x.key().cmp(y.key()) {
                std::cmp::Ordering::Less => Step::Deleted(x.key().to_vec(), x.value().to_vec()),
                std::cmp::Ordering::Greater => {
                    Step::Inserted(y.key().to_vec(), y.value().to_vec())
                }
                std::cmp::Ordering::Equal if x.value() == y.value() => Step::SkipBoth,
                std::cmp::Ordering::Equal => Step::Both(
                    x.key().to_vec(),
                    x.value().to_vec(),
                    y.value().to_vec(),
                ),
            },
            (Some(Item::Entry(x)), Some(Item::Subtree(_))) => {
                Step::Deleted(x.key().to_vec(), x.value().to_vec())
            }
            (Some(Item::Subtree(_)), Some(Item::Entry(y))) => {
                Step::Inserted(y.key().to_vec(), y.value().to_vec())
            }
        };
        match step {
            Step::Done => return Ok(()),
            Step::SkipBoth => {
                a.advance();
                b.advance();
            }
            Step::ExpandOld => a.expand()?,
            Step::ExpandNew => b.expand()?,
            Step::Deleted(k, v) => {
                f(&k, Some(&v), None)?;
                a.advance();
            }
            Step::Inserted(k, v) => {
                f(&k, None, Some(&v))?;
                b.advance();
            }
            Step::Both(k, old, new) => {
                f(&k, Some(&old), Some(&new))?;
                a.advance();
                b.advance();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryNodeStore, Transaction};

    type Change = (Vec<u8>, Option<Vec<u8>>, Option<Vec<u8>>);

    fn collect(tree: &Tree, old: &Arc<Node>, new: &Arc<Node>) -> Vec<Change> {
        let mut out = Vec::new();
        iterate_delta::<_, TreeError>(tree, old, new, |k, o, n| {
            out.push((k.to_vec(), o.map(<[u8]>::to_vec), n.map(<[u8]>::to_vec)));
            Ok(())
        })
        .unwrap();
        out
    }

    fn key(i: u32) -> Vec<u8> {
        format!("{i:04}").into_bytes()
    }

    #[test]
    fn test_same_root_emits_nothing() {
        let store = Arc::new(MemoryNodeStore::new());
        let tree = Tree::with_max_size(256, store.clone());
        let mut t = Transaction::new(tree.clone(), tree.new_root());
        for i in 0..300 {
            t.set(&key(i), b"v").unwrap();
        }
        t.commit(&mut store.as_ref()).unwrap();
        let root = t.root().clone();
        assert!(collect(&tree, &root, &root).is_empty());

        let reloaded = tree.load_root(root.id().unwrap()).unwrap();
        assert!(collect(&tree, &root, &reloaded).is_empty());
    }

    #[test]
    fn test_reports_inserts_updates_deletes() {
        let store = Arc::new(MemoryNodeStore::new());
        let tree = Tree::with_max_size(256, store.clone());
        let mut t = Transaction::new(tree.clone(), tree.new_root());
        for i in 0..500 {
            t.set(&key(i), b"old").unwrap();
        }
        t.commit(&mut store.as_ref()).unwrap();
        let old = t.root().clone();

        t.set(&key(10), b"new").unwrap();
        t.delete(&key(250)).unwrap();
        t.set(&key(777), b"added").unwrap();
        t.commit(&mut store.as_ref()).unwrap();
        let new = t.root().clone();

        let changes = collect(&tree, &old, &new);
        assert_eq!(
            changes,
            vec![
                (key(10), Some(b"old".to_vec()), Some(b"new".to_vec())),
                (key(250), Some(b"old".to_vec()), None),
                (key(777), None, Some(b"added".to_vec())),
            ]
        );

        // Reverse direction swaps the roles
        let back = collect(&tree, &new, &old);
        assert_eq!(back[1], (key(250), None, Some(b"old".to_vec())));
    }

    #[test]
    fn test_delta_against_empty_tree() {
        let store = Arc::new(MemoryNodeStore::new());
        let tree = Tree::with_max_size(256, store.clone());
        let empty = tree.new_root();
        let mut t = Transaction::new(tree.clone(), empty.clone());
        for i in 0..100 {
            t.set(&key(i), &key(i)).unwrap();
        }
        let changes = collect(&tree, &empty, t.root());
        assert_eq!(changes.len(), 100);
        assert!(changes.iter().all(|(_, o, n)| o.is_none() && n.is_some()));
        assert!(changes.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_independent_trees_with_differing_subtrees() {
        let store = Arc::new(MemoryNodeStore::new());
        let tree = Tree::with_max_size(256, store.clone());

        // Same keys, built separately so no node is shared in memory
        let build = |changed: &[u32]| {
            let mut t = Transaction::new(tree.clone(), tree.new_root());
            for i in 0..800 {
                let value: &[u8] = if changed.contains(&i) { b"b" } else { b"a" };
                t.set(&key(i), value).unwrap();
            }
            t.commit(&mut store.as_ref()).unwrap();
            t.root().clone()
        };
        let old = build(&[]);
        let new = build(&[5, 400, 799]);
        assert_ne!(old.id(), new.id());

        let changes = collect(&tree, &old, &new);
        let keys: Vec<_> = changes.iter().map(|(k, _, _)| k.clone()).collect();
        assert_eq!(keys, vec![key(5), key(400), key(799)]);
        assert!(changes
            .iter()
            .all(|(_, o, n)| o.as_deref() == Some(b"a".as_slice()) && n.as_deref() == Some(b"b".as_slice())));

        // Unchanged leaves are shared by id, so reloading both sides still
        // only reports the three changes
        let old = tree.load_root(old.id().unwrap()).unwrap();
        let new = tree.load_root(new.id().unwrap()).unwrap();
        assert_eq!(collect(&tree, &old, &new).len(), 3);
    }
}
