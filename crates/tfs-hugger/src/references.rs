use std::sync::Arc;

use tfs_btree::{BlockId, NodeData, NODE_TAG};
use tfs_storage::ReferenceCallback;
use tracing::warn;

/// Reference callback for stores holding trees.
///
/// Interior nodes reference all their children. For leaf entries `leaf`
/// decides whether the value names a block. Payloads that are not tree
/// nodes reference nothing.
pub fn tree_references<F>(leaf: F) -> ReferenceCallback
where
    F: Fn(&[u8], &[u8]) -> Option<BlockId> + Send + Sync + 'static,
{
    Arc::new(move |id: &BlockId, data: &[u8], cb: &mut dyn FnMut(BlockId)| {
        let Some((&NODE_TAG, body)) = data.split_first() else {
            return;
        };
        let node: NodeData = match bincode::deserialize(body) {
            Ok(node) => node,
            Err(err) => {
                warn!(id = %id, error = %err, "undecodable node block");
                return;
            }
        };
        for (key, value) in &node.children {
            if !node.leafy {
                cb(BlockId::from_bytes(value.clone()));
            } else if let Some(child) = leaf(key, value) {
                cb(child);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tfs_btree::{Child, Node};

    fn collect(cb: &ReferenceCallback, data: &[u8]) -> Vec<BlockId> {
        let mut out = Vec::new();
        cb(&BlockId::from_bytes(b"x".to_vec()), data, &mut |id| out.push(id));
        out
    }

    #[test]
    fn test_interior_children_are_referenced() {
        let a = BlockId::from_bytes(b"aaaa".to_vec());
        let b = BlockId::from_bytes(b"bbbb".to_vec());
        let node = Node::new(
            false,
            vec![Child::stored(b"k1".to_vec(), &a), Child::stored(b"k2".to_vec(), &b)],
        );
        let cb = tree_references(|_, _| None);
        assert_eq!(collect(&cb, &node.encode().unwrap()), vec![a, b]);
    }

    #[test]
    fn test_leaf_values_filtered() {
        let node = Node::new(
            true,
            vec![
                Child::leaf(b"block".to_vec(), b"id1".to_vec()),
                Child::leaf(b"plain".to_vec(), b"text".to_vec()),
            ],
        );
        let cb = tree_references(|k, v| {
            (k == b"block").then(|| BlockId::from_bytes(v.to_vec()))
        });
        assert_eq!(
            collect(&cb, &node.encode().unwrap()),
            vec![BlockId::from_bytes(b"id1".to_vec())]
        );
        assert!(collect(&cb, &[42, 1, 2, 3]).is_empty());
    }
}
