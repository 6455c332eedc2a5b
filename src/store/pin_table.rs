//! Concurrent pin counts keyed by (key, value-identity).
//!
//! Every resident value carries one implicit pin held by the cache itself;
//! each live [`PageHandle`] adds one more. A value may only be handed back to
//! the embedder once its count reaches zero, and the structural eviction path
//! waits — bounded spin, then cooperative yield — for outstanding handles to
//! drain before taking the last pin.
//!
//! [`PageHandle`]: crate::policy::handle::PageHandle
//!
//! ## Identity
//!
//! The table is keyed by a 64-bit identity mixing the key's hash with the
//! entry's allocation address through a splitmix64 finalizer. Two successive
//! incarnations of the same key (an old value pending release while its
//! replacement is already resident) therefore never share a counter.
//!
//! ## Thread Safety
//!
//! All operations are lock-free per shard (`DashMap`). `unpin` with
//! `wait_for_last` may block cooperatively; progress depends on every handle
//! being eventually dropped.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rustc_hash::FxBuildHasher;

/// Tight spins before falling back to `yield_now` while waiting for handles.
const MAX_SPIN_TRIES: u32 = 100;

/// splitmix64 finalizer; full-avalanche mixing for pin identities.
#[inline]
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Derives a pin identity from a key hash and a value allocation address.
#[inline]
pub fn pin_identity(key_hash: u64, address: usize) -> u64 {
    splitmix64(key_hash ^ splitmix64(address as u64))
}

/// Concurrent map from pin identity to outstanding reference count.
///
/// # Example
///
/// ```
/// use cartcache::store::pin_table::{pin_identity, PinTable};
///
/// let pins = PinTable::new();
/// let id = pin_identity(0xfeed, 0x1000);
///
/// pins.pin(id); // the cache's own reference
/// pins.pin(id); // a handle
/// assert_eq!(pins.count(id), 2);
///
/// assert!(!pins.unpin(id, false)); // handle dropped
/// assert!(pins.unpin(id, true));   // cache releases; count reached zero
/// ```
#[derive(Debug, Default)]
pub struct PinTable {
    counts: DashMap<u64, u32, FxBuildHasher>,
}

impl PinTable {
    /// Creates an empty pin table.
    pub fn new() -> Self {
        Self {
            counts: DashMap::with_hasher(FxBuildHasher::default()),
        }
    }

    /// Insert-or-increment; the count is at least 1 on return.
    pub fn pin(&self, id: u64) {
        *self.counts.entry(id).or_insert(0) += 1;
    }

    /// Decrements the count for `id`, returning `true` if it reached zero
    /// (the counter is removed in that case).
    ///
    /// With `wait_for_last`, the call blocks while the count exceeds 1 —
    /// i.e. until every handle has been dropped and only the caller's pin
    /// remains — using a bounded spin followed by cooperative yields. This is
    /// the mode used by structural eviction.
    pub fn unpin(&self, id: u64, wait_for_last: bool) -> bool {
        let mut tries = 0u32;
        loop {
            match self.counts.entry(id) {
                Entry::Occupied(mut occupied) => {
                    if wait_for_last && *occupied.get() > 1 {
                        drop(occupied);
                        tries += 1;
                        if tries < MAX_SPIN_TRIES {
                            std::hint::spin_loop();
                        } else {
                            std::thread::yield_now();
                        }
                        continue;
                    }
                    let count = occupied.get_mut();
                    *count -= 1;
                    if *count == 0 {
                        occupied.remove();
                        return true;
                    }
                    return false;
                },
                Entry::Vacant(_) => {
                    debug_assert!(false, "unpin on missing pin count");
                    return true;
                },
            }
        }
    }

    /// Observes the current count for `id`.
    ///
    /// The read is unsynchronized with respect to concurrent pins; callers
    /// that act on it (victim selection) re-check through
    /// [`unpin`](Self::unpin).
    pub fn count(&self, id: u64) -> u32 {
        match self.counts.get(&id) {
            Some(count) => *count,
            None => {
                debug_assert!(false, "count on missing pin count");
                0
            },
        }
    }

    /// Number of distinct pinned identities. Primarily for diagnostics.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Returns `true` if nothing is pinned.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}
