//! Concurrent primary index: key → resident entry.
//!
//! The index serves two jobs:
//!
//! 1. **Fast lookups.** A published slot holds a `Weak` reference to the
//!    resident entry; lookups upgrade and pin it *while the shard guard is
//!    still held*, which orders every new pin strictly before a concurrent
//!    demotion's `remove` — after `remove` returns, the pin table sees every
//!    handle that will ever exist for that incarnation.
//!
//! 2. **Per-key insertion serialization.** A miss reserves the key by
//!    installing an empty once-cell slot. Exactly one thread wins the
//!    reservation and runs the loader; racing threads block on the cell and
//!    re-check once it is published, so one (cache-miss, key) epoch produces
//!    exactly one loader call.
//!
//! ```text
//!            lookup(key)                         install(key)
//!                │                                    │
//!        ┌───────▼────────┐                   ┌───────▼────────┐
//!        │ get → slot     │                   │ entry(key)     │
//!        └───────┬────────┘                   └───────┬────────┘
//!        filled? │                        Occupied────┤────Vacant
//!        ┌───────▼──────────────┐      (pin existing, │    (insert empty
//!        │ upgrade + pin under  │       or wait on    │     slot: caller
//!        │ the shard guard      │       the cell)     │     owns filling)
//!        └──────────────────────┘                     ▼
//!                                             load → link → publish
//! ```
//!
//! Slots store `Weak` rather than `Arc` so a waiter can never extend a
//! value's lifetime past its release; strong ownership lives only in the
//! resident queues and in handles.

use std::hash::Hash;
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use rustc_hash::FxBuildHasher;

use crate::policy::entry::PageEntry;
use crate::store::pin_table::PinTable;

/// A shared slot: empty while an installation is in flight, then published.
pub(crate) type SlotRef<K, V> = Arc<OnceCell<Weak<PageEntry<K, V>>>>;

/// Outcome of the exclusive-insert primitive.
pub(crate) enum IndexSlot<K, V> {
    /// Another thread's entry is resident; it has been pinned for the caller.
    Resident(Arc<PageEntry<K, V>>),
    /// The caller won the reservation and owns the filling rights.
    Reserved(SlotRef<K, V>),
}

/// Concurrent mapping from key to resident-entry slot.
pub(crate) struct PageIndex<K, V> {
    map: DashMap<K, SlotRef<K, V>, FxBuildHasher>,
}

impl<K, V> PageIndex<K, V>
where
    K: Eq + Hash + Clone,
{
    pub(crate) fn new() -> Self {
        Self {
            map: DashMap::with_hasher(FxBuildHasher::default()),
        }
    }

    /// Shared lookup: pins and returns the resident entry for `key`, if any.
    ///
    /// Blocks while an installation for `key` is in flight. With `mark`, the
    /// entry's reference bit is set before returning. The pin is taken while
    /// the shard guard is held; see the module docs for why that matters.
    pub(crate) fn pin_resident(
        &self,
        pins: &PinTable,
        key: &K,
        mark: bool,
    ) -> Option<Arc<PageEntry<K, V>>> {
        loop {
            let slot = self.map.get(key)?;
            match slot.value().get() {
                Some(weak) => {
                    // A dead weak marks an aborted installation; the slot is
                    // torn down by the install path, treat it as a miss.
                    let entry = weak.upgrade()?;
                    pins.pin(entry.pin_id());
                    if mark {
                        entry.mark_referenced();
                    }
                    return Some(entry);
                },
                None => {
                    let cell = Arc::clone(slot.value());
                    drop(slot);
                    cell.wait();
                },
            }
        }
    }

    /// Exclusive insert: returns the existing resident entry (pinned), or a
    /// fresh reservation whose filling rights belong to the caller.
    pub(crate) fn find_or_reserve(&self, pins: &PinTable, key: &K) -> IndexSlot<K, V> {
        loop {
            match self.map.entry(key.clone()) {
                Entry::Occupied(occupied) => match occupied.get().get() {
                    Some(weak) => match weak.upgrade() {
                        Some(entry) => {
                            pins.pin(entry.pin_id());
                            return IndexSlot::Resident(entry);
                        },
                        None => {
                            // Aborted installation left a dead slot behind.
                            occupied.remove();
                        },
                    },
                    None => {
                        let cell = Arc::clone(occupied.get());
                        drop(occupied);
                        cell.wait();
                    },
                },
                Entry::Vacant(vacant) => {
                    let slot: SlotRef<K, V> = Arc::new(OnceCell::new());
                    vacant.insert(Arc::clone(&slot));
                    return IndexSlot::Reserved(slot);
                },
            }
        }
    }

    /// Publishes `entry` into a reserved slot, waking any waiters.
    pub(crate) fn publish(&self, slot: &SlotRef<K, V>, entry: &Arc<PageEntry<K, V>>) {
        let filled = slot.set(Arc::downgrade(entry)).is_ok();
        debug_assert!(filled, "reservation published twice");
    }

    /// Tears down a reservation whose installation did not complete: waiters
    /// wake to a dead slot and re-run their lookup as a miss.
    pub(crate) fn abort_reservation(&self, key: &K, slot: &SlotRef<K, V>) {
        let _ = slot.set(Weak::new());
        self.map.remove(key);
    }

    /// Returns the resident entry for `key` without pinning it, or `None`
    /// when the key is absent or its installation has not yet published.
    pub(crate) fn peek_resident(&self, key: &K) -> Option<Arc<PageEntry<K, V>>> {
        let slot = self.map.get(key)?;
        slot.value().get()?.upgrade()
    }

    /// Returns `true` if `key` has a published, live entry. Does not pin,
    /// block, or touch replacement state.
    pub(crate) fn is_published(&self, key: &K) -> bool {
        self.map
            .get(key)
            .is_some_and(|slot| slot.value().get().is_some_and(|weak| weak.strong_count() > 0))
    }

    /// Unpublishes `key`. After this returns, no new handle can pin the old
    /// incarnation.
    pub(crate) fn remove(&self, key: &K) {
        self.map.remove(key);
    }

    /// Snapshot of published entries, for invariant validation.
    #[cfg(any(test, debug_assertions))]
    pub(crate) fn resident_entries(&self) -> Vec<Arc<PageEntry<K, V>>> {
        self.map
            .iter()
            .filter_map(|slot| slot.value().get().and_then(Weak::upgrade))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn entry(key: u64, value: &'static str) -> Arc<PageEntry<u64, &'static str>> {
        Arc::new(PageEntry::new(key, value))
    }

    #[test]
    fn reserve_then_publish_then_lookup() {
        let index: PageIndex<u64, &str> = PageIndex::new();
        let pins = PinTable::new();

        let slot = match index.find_or_reserve(&pins, &1) {
            IndexSlot::Reserved(slot) => slot,
            IndexSlot::Resident(_) => panic!("fresh key must reserve"),
        };

        let page = entry(1, "one");
        pins.pin(page.pin_id()); // the cache's own reference
        index.publish(&slot, &page);

        let found = index.pin_resident(&pins, &1, true).expect("published");
        assert!(Arc::ptr_eq(&found, &page));
        assert!(found.is_referenced());
        assert_eq!(pins.count(page.pin_id()), 2);
    }

    #[test]
    fn second_reserver_gets_resident_entry() {
        let index: PageIndex<u64, &str> = PageIndex::new();
        let pins = PinTable::new();

        let slot = match index.find_or_reserve(&pins, &1) {
            IndexSlot::Reserved(slot) => slot,
            IndexSlot::Resident(_) => panic!(),
        };
        let page = entry(1, "one");
        pins.pin(page.pin_id());
        index.publish(&slot, &page);

        match index.find_or_reserve(&pins, &1) {
            IndexSlot::Resident(existing) => assert!(Arc::ptr_eq(&existing, &page)),
            IndexSlot::Reserved(_) => panic!("resident key must not reserve"),
        }
    }

    #[test]
    fn lookup_misses_on_vacant_and_removed() {
        let index: PageIndex<u64, &str> = PageIndex::new();
        let pins = PinTable::new();
        assert!(index.pin_resident(&pins, &5, false).is_none());

        let slot = match index.find_or_reserve(&pins, &5) {
            IndexSlot::Reserved(slot) => slot,
            IndexSlot::Resident(_) => panic!(),
        };
        let page = entry(5, "five");
        pins.pin(page.pin_id());
        index.publish(&slot, &page);
        index.remove(&5);
        assert!(index.pin_resident(&pins, &5, false).is_none());
        assert!(pins.unpin(page.pin_id(), true));
    }

    #[test]
    fn aborted_reservation_reads_as_miss() {
        let index: PageIndex<u64, &str> = PageIndex::new();
        let pins = PinTable::new();

        let slot = match index.find_or_reserve(&pins, &9) {
            IndexSlot::Reserved(slot) => slot,
            IndexSlot::Resident(_) => panic!(),
        };
        index.abort_reservation(&9, &slot);

        assert!(index.pin_resident(&pins, &9, false).is_none());
        // The key is reservable again.
        match index.find_or_reserve(&pins, &9) {
            IndexSlot::Reserved(_) => {},
            IndexSlot::Resident(_) => panic!("aborted slot must not read as resident"),
        }
    }

    #[test]
    fn waiters_block_until_publication() {
        let index: Arc<PageIndex<u64, &str>> = Arc::new(PageIndex::new());
        let pins = Arc::new(PinTable::new());

        let slot = match index.find_or_reserve(&pins, &3) {
            IndexSlot::Reserved(slot) => slot,
            IndexSlot::Resident(_) => panic!(),
        };

        let waiter = {
            let index = Arc::clone(&index);
            let pins = Arc::clone(&pins);
            thread::spawn(move || {
                index
                    .pin_resident(&pins, &3, false)
                    .expect("resolves after publication")
            })
        };

        thread::sleep(std::time::Duration::from_millis(20));
        let page = entry(3, "three");
        pins.pin(page.pin_id());
        index.publish(&slot, &page);

        let found = waiter.join().unwrap();
        assert!(Arc::ptr_eq(&found, &page));
        assert_eq!(pins.count(page.pin_id()), 2);
    }
}
