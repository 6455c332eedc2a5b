//! Resident entry node: one cached value plus its clock metadata.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustc_hash::FxHasher;

use crate::store::pin_table::pin_identity;

/// A resident page: the owned value and the replacement bookkeeping bits.
///
/// Entries are shared behind `Arc`: the resident queues hold the strong
/// references that keep a value alive structurally, handles hold additional
/// strong references for the duration of an access, and the primary index
/// observes entries through `Weak`.
///
/// The `referenced` bit is written by lock-free lookups with relaxed
/// ordering; a lost update only costs replacement quality, never safety. The
/// `long_term` and `in_recent` bits are only touched under the structural
/// lock.
pub(crate) struct PageEntry<K, V> {
    key: K,
    value: V,
    referenced: AtomicBool,
    long_term: AtomicBool,
    in_recent: AtomicBool,
}

impl<K, V> PageEntry<K, V> {
    /// Creates an entry with all bits clear except residence in the recent
    /// queue.
    pub(crate) fn new(key: K, value: V) -> Self {
        Self {
            key,
            value,
            referenced: AtomicBool::new(false),
            long_term: AtomicBool::new(false),
            in_recent: AtomicBool::new(true),
        }
    }

    pub(crate) fn key(&self) -> &K {
        &self.key
    }

    pub(crate) fn value(&self) -> &V {
        &self.value
    }

    /// Consumes the entry, returning key and value for the releaser.
    pub(crate) fn into_parts(self) -> (K, V) {
        (self.key, self.value)
    }

    pub(crate) fn mark_referenced(&self) {
        self.referenced.store(true, Ordering::Relaxed);
    }

    pub(crate) fn clear_referenced(&self) {
        self.referenced.store(false, Ordering::Relaxed);
    }

    pub(crate) fn is_referenced(&self) -> bool {
        self.referenced.load(Ordering::Relaxed)
    }

    pub(crate) fn set_long_term(&self, long_term: bool) {
        self.long_term.store(long_term, Ordering::Relaxed);
    }

    pub(crate) fn is_long_term(&self) -> bool {
        self.long_term.load(Ordering::Relaxed)
    }

    pub(crate) fn set_in_recent(&self, in_recent: bool) {
        self.in_recent.store(in_recent, Ordering::Relaxed);
    }

    pub(crate) fn is_in_recent(&self) -> bool {
        self.in_recent.load(Ordering::Relaxed)
    }
}

impl<K: Hash, V> PageEntry<K, V> {
    /// Pin-table identity for this incarnation of the key.
    ///
    /// Mixes the key's hash with the entry's allocation address so that an
    /// evicted-but-not-yet-released value and its freshly loaded replacement
    /// keep separate pin counts.
    pub(crate) fn pin_id(self: &Arc<Self>) -> u64 {
        let mut hasher = FxHasher::default();
        self.key.hash(&mut hasher);
        pin_identity(hasher.finish(), Arc::as_ptr(self) as usize)
    }
}
