//! Adaptive replacement cache of decoded tree nodes.
//!
//! Nodes are immutable and addressed by content, so entries never need
//! invalidation; the cache only decides what stays resident.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tfs_btree::{BlockId, Node};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum List {
    /// Seen once
    T1 = 0,
    /// Seen more than once
    T2 = 1,
    /// Ghosts of T1
    B1 = 2,
    /// Ghosts of T2
    B2 = 3,
}

/// Ids in recency order; the smallest sequence number is the LRU end.
#[derive(Default)]
struct Lru {
    order: BTreeMap<u64, BlockId>,
}

impl Lru {
    fn len(&self) -> usize {
        self.order.len()
    }
}

struct ArcState {
    capacity: usize,
    /// Target size for T1
    p: usize,
    seq: u64,
    lists: [Lru; 4],
    loc: HashMap<BlockId, (List, u64)>,
    resident: HashMap<BlockId, Arc<Node>>,
}

impl ArcState {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            p: 0,
            seq: 0,
            lists: Default::default(),
            loc: HashMap::new(),
            resident: HashMap::new(),
        }
    }

    fn len(&self, list: List) -> usize {
        self.lists[list as usize].len()
    }

    fn push(&mut self, list: List, id: BlockId) {
        self.seq += 1;
        self.lists[list as usize].order.insert(self.seq, id.clone());
        self.loc.insert(id, (list, self.seq));
    }

    fn unlink(&mut self, id: &BlockId) -> Option<List> {
        let (list, seq) = self.loc.remove(id)?;
        self.lists[list as usize].order.remove(&seq);
        Some(list)
    }

    fn pop_lru(&mut self, list: List) -> Option<BlockId> {
        let (_, id) = self.lists[list as usize].order.pop_first()?;
        self.loc.remove(&id);
        Some(id)
    }

    /// Move one resident entry to its ghost list.
    fn replace(&mut self, hit_in_b2: bool) {
        let t1 = self.len(List::T1);
        let from_t1 = t1 >= 1 && (t1 > self.p || (hit_in_b2 && t1 == self.p));
        let (from, ghost) = if from_t1 || self.len(List::T2) == 0 {
            (List::T1, List::B1)
        } else {
            (List::T2, List::B2)
        };
        if let Some(victim) = self.pop_lru(from) {
            self.resident.remove(&victim);
            self.push(ghost, victim);
        }
    }

    fn on_hit(&mut self, id: &BlockId) {
        if matches!(self.unlink(id), Some(List::T1 | List::T2)) {
            self.push(List::T2, id.clone());
        }
    }

    fn on_miss(&mut self, id: &BlockId) {
        let cache_full = self.len(List::T1) + self.len(List::T2) >= self.capacity;
        match self.loc.get(id).map(|(list, _)| *list) {
            Some(List::B1) => {
                let delta = (self.len(List::B2) / self.len(List::B1).max(1)).max(1);
                self.p = (self.p + delta).min(self.capacity);
                self.unlink(id);
                if cache_full {
                    self.replace(false);
                }
                self.push(List::T2, id.clone());
            }
            Some(List::B2) => {
                let delta = (self.len(List::B1) / self.len(List::B2).max(1)).max(1);
                self.p = self.p.saturating_sub(delta);
                self.unlink(id);
                if cache_full {
                    self.replace(true);
                }
                self.push(List::T2, id.clone());
            }
            _ => {
                let l1 = self.len(List::T1) + self.len(List::B1);
                let total = l1 + self.len(List::T2) + self.len(List::B2);
                if l1 >= self.capacity {
                    if self.len(List::T1) < self.capacity {
                        self.pop_lru(List::B1);
                        self.replace(false);
                    } else if let Some(victim) = self.pop_lru(List::T1) {
                        self.resident.remove(&victim);
                    }
                } else if total >= self.capacity {
                    if total >= 2 * self.capacity {
                        self.pop_lru(List::B2);
                    }
                    if cache_full {
                        self.replace(false);
                    }
                }
                self.push(List::T1, id.clone());
            }
        }
    }
}

/// Bounded map from node id to decoded node.
pub struct NodeCache {
    state: Mutex<ArcState>,
}

impl NodeCache {
    /// `capacity` must be nonzero
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(ArcState::new(capacity.max(1))),
        }
    }

    pub fn get(&self, id: &BlockId) -> Option<Arc<Node>> {
        let mut state = self.state.lock();
        let node = state.resident.get(id).cloned()?;
        state.on_hit(id);
        Some(node)
    }

    pub fn insert(&self, id: BlockId, node: Arc<Node>) {
        let mut state = self.state.lock();
        if state.resident.contains_key(&id) {
            state.on_hit(&id);
        } else {
            state.on_miss(&id);
        }
        state.resident.insert(id, node);
    }

    /// Number of resident nodes
    pub fn len(&self) -> usize {
        self.state.lock().resident.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> BlockId {
        BlockId::from_bytes(n.to_be_bytes().to_vec())
    }

    fn node() -> Arc<Node> {
        Arc::new(Node::empty())
    }

    #[test]
    fn test_capacity_is_respected() {
        let cache = NodeCache::new(8);
        for n in 0..100 {
            cache.insert(id(n), node());
            assert!(cache.len() <= 8);
        }
        assert!(cache.get(&id(99)).is_some());
        assert!(cache.get(&id(0)).is_none());
    }

    #[test]
    fn test_frequent_entries_survive_scan() {
        let cache = NodeCache::new(4);
        cache.insert(id(1), node());
        cache.insert(id(2), node());
        // Second touch promotes both to the frequent list
        assert!(cache.get(&id(1)).is_some());
        assert!(cache.get(&id(2)).is_some());

        for n in 10..30 {
            cache.insert(id(n), node());
        }
        assert!(cache.get(&id(1)).is_some());
        assert!(cache.get(&id(2)).is_some());
    }

    #[test]
    fn test_ghost_hit_grows_recent_target() {
        let cache = NodeCache::new(2);
        cache.insert(id(1), node());
        assert!(cache.get(&id(1)).is_some());
        cache.insert(id(2), node());
        // 2 is pushed out to the recent ghost list
        cache.insert(id(3), node());
        assert!(cache.get(&id(2)).is_none());

        cache.insert(id(2), node());
        assert!(cache.get(&id(2)).is_some());
        assert!(cache.get(&id(3)).is_some());
        assert!(cache.get(&id(1)).is_none());
        assert_eq!(cache.state.lock().p, 1);
    }
}
