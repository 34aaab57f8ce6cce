//! Root-to-leaf paths and in-order cursors.

use std::sync::Arc;

use crate::node::Child;
use crate::{Node, Result, Tree, TreeError, MAX_DEPTH};

/// One interior step of a path: the node and the child index taken.
pub(crate) struct Frame {
    pub node: Arc<Node>,
    pub idx: usize,
}

/// Walk from `root` to the leaf responsible for `key`.
pub(crate) fn descend(tree: &Tree, root: &Arc<Node>, key: &[u8]) -> Result<(Vec<Frame>, Arc<Node>)> {
    let mut stack = Vec::new();
    let mut node = root.clone();
    while !node.is_leafy() {
        if stack.len() >= MAX_DEPTH {
            return Err(TreeError::TooDeep);
        }
        if node.is_empty() {
            return Err(TreeError::Corrupt("empty interior node".into()));
        }
        let idx = node.search_interior(key);
        let child = tree.child(&node, idx)?;
        stack.push(Frame { node, idx });
        node = child;
    }
    Ok((stack, node))
}

/// Item under a cursor: a leaf entry or a whole not-yet-expanded subtree.
pub(crate) enum Item<'a> {
    Entry(&'a Child),
    Subtree(&'a Child),
}

impl<'a> Item<'a> {
    pub fn key(&self) -> &'a [u8] {
        match self {
            Item::Entry(c) | Item::Subtree(c) => c.key(),
        }
    }
}

/// In-order walk that only loads subtrees it is asked to expand.
pub(crate) struct Cursor<'t> {
    tree: &'t Tree,
    stack: Vec<Frame>,
}

impl<'t> Cursor<'t> {
    pub fn new(tree: &'t Tree, root: &Arc<Node>) -> Self {
        Self {
            tree,
            stack: vec![Frame {
                node: root.clone(),
                idx: 0,
            }],
        }
    }

    fn settle(&mut self) {
        while let Some(top) = self.stack.last() {
            if top.idx < top.node.len() {
                return;
            }
            self.stack.pop();
            if let Some(parent) = self.stack.last_mut() {
                parent.idx += 1;
            }
        }
    }

    pub fn peek(&mut self) -> Option<Item<'_>> {
        self.settle();
        let top = self.stack.last()?;
        let child = &top.node.children()[top.idx];
        Some(if top.node.is_leafy() {
            Item::Entry(child)
        } else {
            Item::Subtree(child)
        })
    }

    pub fn advance(&mut self) {
        if let Some(top) = self.stack.last_mut() {
            top.idx += 1;
        }
    }

    /// Replace the current subtree item with its children.
    pub fn expand(&mut self) -> Result<()> {
        self.settle();
        let Some(top) = self.stack.last() else {
            return Ok(());
        };
        if top.node.is_leafy() {
            return Ok(());
        }
        if self.stack.len() > MAX_DEPTH {
            return Err(TreeError::TooDeep);
        }
        let child = self.tree.child(&top.node, top.idx)?;
        // The parent index moves past the subtree once the child frame drains
        self.stack.push(Frame {
            node: child,
            idx: 0,
        });
        Ok(())
    }
}
