//! Recency-ordered ghost history for evicted keys.
//!
//! The cache remembers recently evicted keys in two of these lists (one per
//! resident queue) to detect re-references and steer its adaptation targets.
//! A ghost carries no value; the list membership itself records which queue
//! the key was evicted from.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────┐
//! │                        HistoryList Layout                              │
//! │                                                                        │
//! │   ┌────────────────────────────┐  ┌────────────────────────────────┐  │
//! │   │ index: FxHashMap<K, usize> │  │ nodes: Vec<Node<K>> (slab)     │  │
//! │   │                            │  │                                │  │
//! │   │   "key_a" ─► 2  ──────────────► [2] key_a  prev:- next:0      │  │
//! │   │   "key_b" ─► 0  ──────────────► [0] key_b  prev:2 next:1      │  │
//! │   │   "key_c" ─► 1  ──────────────► [1] key_c  prev:0 next:-      │  │
//! │   └────────────────────────────┘  │ free: [3, 4, ...]              │  │
//! │                                   └────────────────────────────────┘  │
//! │                                                                        │
//! │   front (most recently evicted) ── key_a ── key_b ── key_c ── back    │
//! │                                                                        │
//! │   push_front: new ghost          pop_back: history prune              │
//! │   remove(key): ghost hit promoted back to residency                   │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Operations
//!
//! | Operation    | Description                              | Complexity |
//! |--------------|------------------------------------------|------------|
//! | `push_front` | Record a freshly evicted key             | O(1) avg   |
//! | `pop_back`   | Drop the stalest ghost                   | O(1)       |
//! | `remove`     | Erase a ghost after a history hit        | O(1) avg   |
//! | `contains`   | History-index lookup                     | O(1) avg   |
//!
//! Unlike a bounded recency list, this structure never evicts on its own:
//! which of the two histories gets pruned, and when, is a policy decision
//! made by the replacement engine.
//!
//! ## Thread Safety
//!
//! Not thread-safe; the engine only touches history under its structural
//! lock.

use rustc_hash::FxHashMap;
use std::hash::Hash;

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Node<K> {
    key: Option<K>,
    prev: usize,
    next: usize,
}

/// Ordered list of ghost keys with an O(1) membership index.
///
/// Front = most recently evicted, back = stalest. Nodes live in a slab with
/// an embedded free list so churn does not reallocate.
///
/// # Example
///
/// ```
/// use cartcache::ds::HistoryList;
///
/// let mut history = HistoryList::new();
/// history.push_front("a");
/// history.push_front("b");
/// assert!(history.contains(&"a"));
///
/// // Stalest ghost goes first when the engine prunes.
/// assert_eq!(history.pop_back(), Some("a"));
///
/// // A ghost hit removes the key outright.
/// assert!(history.remove(&"b"));
/// assert!(history.is_empty());
/// ```
#[derive(Debug)]
pub struct HistoryList<K> {
    nodes: Vec<Node<K>>,
    free: Vec<usize>,
    index: FxHashMap<K, usize>,
    head: usize,
    tail: usize,
}

impl<K> Default for HistoryList<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> HistoryList<K>
where
    K: Eq + Hash + Clone,
{
    /// Creates an empty history list.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            index: FxHashMap::default(),
            head: NIL,
            tail: NIL,
        }
    }

    /// Creates an empty history list with room for `capacity` ghosts.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            free: Vec::new(),
            index: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
            head: NIL,
            tail: NIL,
        }
    }

    /// Returns the number of ghosts currently tracked.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns `true` if no ghosts are tracked.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Returns `true` if `key` has a ghost in this list.
    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Records `key` as the most recently evicted ghost.
    ///
    /// A key must not be recorded twice; the engine removes a ghost before
    /// the key re-enters residency, so a duplicate push indicates a
    /// bookkeeping bug upstream.
    pub fn push_front(&mut self, key: K) {
        debug_assert!(!self.contains(&key), "ghost recorded twice");

        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.nodes.push(Node {
                    key: None,
                    prev: NIL,
                    next: NIL,
                });
                self.nodes.len() - 1
            },
        };

        self.nodes[slot].key = Some(key.clone());
        self.nodes[slot].prev = NIL;
        self.nodes[slot].next = self.head;

        if self.head != NIL {
            self.nodes[self.head].prev = slot;
        } else {
            self.tail = slot;
        }
        self.head = slot;
        self.index.insert(key, slot);
    }

    /// Removes and returns the stalest ghost, if any.
    pub fn pop_back(&mut self) -> Option<K> {
        if self.tail == NIL {
            return None;
        }
        let slot = self.tail;
        let key = self.detach(slot);
        self.index.remove(&key);
        Some(key)
    }

    /// Removes `key` from the history; returns `true` if it was present.
    ///
    /// This is the "ghost hit" path: the key is about to become resident
    /// again, so its history entry is consumed.
    pub fn remove(&mut self, key: &K) -> bool {
        let slot = match self.index.remove(key) {
            Some(slot) => slot,
            None => return false,
        };
        self.detach(slot);
        true
    }

    /// Drops all ghosts.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.index.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    /// Unlinks `slot` from the chain and returns its key to the caller.
    fn detach(&mut self, slot: usize) -> K {
        let prev = self.nodes[slot].prev;
        let next = self.nodes[slot].next;

        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }

        self.free.push(slot);
        self.nodes[slot]
            .key
            .take()
            .expect("occupied history node has a key")
    }

    /// Returns keys front-to-back (most recently evicted first).
    #[cfg(any(test, debug_assertions))]
    pub fn debug_snapshot_keys(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while cursor != NIL {
            keys.push(
                self.nodes[cursor]
                    .key
                    .clone()
                    .expect("linked history node has a key"),
            );
            cursor = self.nodes[cursor].next;
        }
        keys
    }

    #[cfg(any(test, debug_assertions))]
    pub fn debug_validate_invariants(&self) {
        // Walk the chain and match it against the index.
        let mut seen = 0;
        let mut cursor = self.head;
        let mut prev = NIL;
        while cursor != NIL {
            assert!(cursor < self.nodes.len(), "cursor out of bounds");
            let node = &self.nodes[cursor];
            let key = node.key.as_ref().expect("linked node has a key");
            assert_eq!(self.index.get(key), Some(&cursor), "index points elsewhere");
            assert_eq!(node.prev, prev, "prev link broken at {cursor}");
            prev = cursor;
            cursor = node.next;
            seen += 1;
            assert!(seen <= self.nodes.len(), "cycle detected");
        }
        assert_eq!(prev, self.tail, "tail does not terminate the chain");
        assert_eq!(seen, self.index.len(), "chain length != index length");
        assert_eq!(
            self.free.len() + seen,
            self.nodes.len(),
            "free list does not account for every vacant slot"
        );
        for &slot in &self.free {
            assert!(self.nodes[slot].key.is_none(), "free slot {slot} occupied");
        }
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Invariants hold after any sequence of operations.
        #[cfg_attr(miri, ignore)]
        #[test]
        fn prop_invariants_always_hold(
            ops in prop::collection::vec((0u8..3, 0u32..32), 0..200)
        ) {
            let mut history: HistoryList<u32> = HistoryList::new();
            for (op, key) in ops {
                match op % 3 {
                    0 => {
                        if !history.contains(&key) {
                            history.push_front(key);
                        }
                    }
                    1 => { history.remove(&key); }
                    2 => { history.pop_back(); }
                    _ => unreachable!(),
                }
                history.debug_validate_invariants();
            }
        }

        /// Behavior matches a reference VecDeque implementation.
        #[cfg_attr(miri, ignore)]
        #[test]
        fn prop_matches_reference_implementation(
            ops in prop::collection::vec((0u8..3, 0u32..16), 0..120)
        ) {
            let mut history: HistoryList<u32> = HistoryList::new();
            let mut reference: std::collections::VecDeque<u32> = Default::default();

            for (op, key) in ops {
                match op % 3 {
                    0 => {
                        if !reference.contains(&key) {
                            history.push_front(key);
                            reference.push_front(key);
                        }
                    }
                    1 => {
                        let in_ref = reference.iter().position(|&k| k == key);
                        prop_assert_eq!(history.remove(&key), in_ref.is_some());
                        if let Some(pos) = in_ref {
                            reference.remove(pos);
                        }
                    }
                    2 => {
                        prop_assert_eq!(history.pop_back(), reference.pop_back());
                    }
                    _ => unreachable!(),
                }

                prop_assert_eq!(history.len(), reference.len());
                let snapshot = history.debug_snapshot_keys();
                prop_assert_eq!(snapshot, reference.iter().copied().collect::<Vec<_>>());
            }
        }
    }
}
