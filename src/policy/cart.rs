//! Concurrent page cache with CART replacement.
//!
//! Implements CART (Clock with Adaptive Replacement and Temporal filtering):
//! ARC-style adaptivity with Clock mechanics, plus a short/long temporal
//! filter that keeps one-shot pages from displacing pages with proven
//! long-term utility. Hits only set a reference bit — no list moves, no
//! structural lock — which is what makes the lookup path cheap under
//! contention.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        CartCache<K, V, S> Layout                        │
//! │                                                                         │
//! │   Lock-free lookup plane:                                               │
//! │   ┌──────────────────────────────┐  ┌─────────────────────────────┐    │
//! │   │ PageIndex                    │  │ PinTable                    │    │
//! │   │ DashMap<K, slot>             │  │ DashMap<identity, count>    │    │
//! │   │ slot = OnceCell<Weak<entry>> │  │ cache holds 1, handles +1   │    │
//! │   └──────────────┬───────────────┘  └─────────────┬───────────────┘    │
//! │                  │ hit: upgrade, pin, set ref bit  │                    │
//! │                  ▼                                 ▼                    │
//! │   Structural plane (parking_lot::Mutex<CartState>):                     │
//! │   ┌─────────────────────────────────────────────────────────────────┐  │
//! │   │  recent (T1)             frequent (T2)                          │  │
//! │   │  head ─► [a][b][c] ◄tail head ─► [x][y] ◄tail   (VecDeque)      │  │
//! │   │   ref=1 head: rotate,     ref=1 head: back to recent            │  │
//! │   │   maybe promote to Long   ref=0 head: eviction candidate        │  │
//! │   │   ref=0 Long head: ───► frequent                                │  │
//! │   │                                                                 │  │
//! │   │  ghost_recent (B1)       ghost_frequent (B2)    (HistoryList)   │  │
//! │   │  front = newest ghost    hit ⇒ target_recent ± max(1, ratio)    │  │
//! │   │                                                                 │  │
//! │   │  target_recent (p), target_ghost_recent (q),                    │  │
//! │   │  num_short / num_long, used_memory                              │  │
//! │   └─────────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Operations
//!
//! | Operation        | Locking                  | Notes                      |
//! |------------------|--------------------------|----------------------------|
//! | `find_or_create` | lock-free on hit         | miss runs loader + install |
//! | `insert`         | structural lock          | pre-supplied value         |
//! | `is_in_cache`    | lock-free                | no reference-bit update    |
//! | `remove`         | structural lock          | ghost history untouched    |
//! | `clear`          | structural lock          | waits for handle drains    |
//!
//! ## Value lifecycle
//!
//! Values enter through [`PageSource::load`] (or [`CartCache::insert`]) and
//! leave through [`PageSource::release`], exactly once per instance, never
//! while a [`PageHandle`] for that instance is live. Eviction waits — bounded
//! spin, then cooperative yield — for outstanding handles to drain; progress
//! therefore depends on every handle being eventually dropped. Do not hold a
//! handle while blocking on this cache from the same thread (e.g. calling
//! `clear`), or the drain can deadlock against itself.
//!
//! ## Memory bound
//!
//! With `max_memory > 0`, fullness reserves the incoming value's size and
//! eviction repeats until the byte budget holds, so `used_memory` only
//! exceeds `max_memory` while pinned entries (or a single value larger than
//! the whole budget) prevent eviction.
//!
//! ## Example Usage
//!
//! ```
//! use cartcache::policy::cart::CartCache;
//!
//! let cache = CartCache::new(|key: &u64| key.to_string(), 3, 0);
//!
//! let page = cache.find_or_create(1);
//! assert_eq!(page.value(), "1");
//! drop(page);
//!
//! assert!(!cache.is_in_cache(&1).is_empty());
//! assert_eq!(cache.len(), 1);
//! assert_eq!(cache.metrics().loads, 1);
//! ```
//!
//! ## Thread Safety
//!
//! All public operations are safe to call concurrently. Two concurrent
//! lookups of the same cold key trigger exactly one loader call and observe
//! the same value instance.
//!
//! ## References
//!
//! - Bansal & Modha, "CAR: Clock with Adaptive Replacement", FAST 2004
//!   (§V describes CART's temporal filter)

use std::collections::VecDeque;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::ds::HistoryList;
use crate::error::ConfigError;
use crate::policy::entry::PageEntry;
use crate::policy::handle::PageHandle;
use crate::store::page_index::{IndexSlot, PageIndex, SlotRef};
use crate::store::pin_table::PinTable;
use crate::traits::PageSource;

/// Snapshot of the cache's activity counters.
///
/// Counters are cumulative since construction and use relaxed atomics; a
/// snapshot taken under concurrent traffic is internally consistent only per
/// field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    /// `find_or_create` calls answered from the index without the loader.
    pub hits: u64,
    /// `find_or_create` calls that escalated to the install path.
    pub misses: u64,
    /// Loader invocations (at most one per cache-miss epoch per key).
    pub loads: u64,
    /// Resident entries demoted to ghost history.
    pub evictions: u64,
    /// Installs that re-referenced a ghost (B1 or B2 hit).
    pub history_hits: u64,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    evictions: AtomicU64,
    history_hits: AtomicU64,
}

impl CacheCounters {
    fn snapshot(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            history_hits: self.history_hits.load(Ordering::Relaxed),
        }
    }

    fn inc_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_load(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_history_hit(&self) {
        self.history_hits.fetch_add(1, Ordering::Relaxed);
    }
}

/// Everything the structural lock protects.
struct CartState<K, V> {
    /// T1: pages seen recently, head = oldest.
    recent: VecDeque<Arc<PageEntry<K, V>>>,
    /// T2: pages with demonstrated long-term utility, head = oldest.
    frequent: VecDeque<Arc<PageEntry<K, V>>>,
    /// B1: ghosts of pages demoted out of `recent`.
    ghost_recent: HistoryList<K>,
    /// B2: ghosts of pages demoted out of `frequent`.
    ghost_frequent: HistoryList<K>,
    /// p: adaptive target size for `recent`.
    target_recent: usize,
    /// q: adaptive target size for `ghost_recent`.
    target_ghost_recent: usize,
    /// Short (filter bit clear) residents. Shorts only ever live in `recent`.
    num_short: usize,
    /// Long (filter bit set) residents.
    num_long: usize,
    /// Sum of `size_of` over resident values, as last queried.
    used_memory: usize,
}

impl<K, V> CartState<K, V>
where
    K: Eq + Hash + Clone,
{
    fn new() -> Self {
        Self {
            recent: VecDeque::new(),
            frequent: VecDeque::new(),
            ghost_recent: HistoryList::new(),
            ghost_frequent: HistoryList::new(),
            target_recent: 0,
            target_ghost_recent: 0,
            num_short: 0,
            num_long: 0,
            used_memory: 0,
        }
    }

    fn resident_len(&self) -> usize {
        self.recent.len() + self.frequent.len()
    }
}

/// Removes a reservation again if the installation unwinds (loader panic);
/// waiters wake to a clean miss instead of hanging on the slot.
struct ReservationGuard<'a, K, V>
where
    K: Eq + Hash + Clone,
{
    index: &'a PageIndex<K, V>,
    key: &'a K,
    slot: &'a SlotRef<K, V>,
    armed: bool,
}

impl<K, V> Drop for ReservationGuard<'_, K, V>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        if self.armed {
            self.index.abort_reservation(self.key, self.slot);
        }
    }
}

/// Concurrent, bounded page cache with CART replacement.
///
/// # Type Parameters
///
/// - `K`: Key type, `Eq + Hash + Clone`
/// - `V`: Value type (opaque to the cache)
/// - `S`: The [`PageSource`] port supplying load/release/size
///
/// # Bounds
///
/// `max_elements` caps the resident entry count, `max_memory` caps the sum of
/// [`PageSource::size_of`] over resident values; zero disables a bound and at
/// least one must be positive.
///
/// # Example
///
/// ```
/// use cartcache::policy::cart::CartCache;
///
/// let cache = CartCache::new(|key: &u64| *key, 2, 0);
/// for key in [1, 2, 3, 4] {
///     drop(cache.find_or_create(key));
/// }
/// assert_eq!(cache.len(), 2);
/// assert_eq!(cache.ghost_recent_len() + cache.ghost_frequent_len(), 2);
/// ```
#[must_use]
pub struct CartCache<K, V, S>
where
    K: Eq + Hash + Clone,
    S: PageSource<K, V>,
{
    source: S,
    index: PageIndex<K, V>,
    pins: PinTable,
    state: Mutex<CartState<K, V>>,
    max_elements: usize,
    max_memory: usize,
    counters: CacheCounters,
}

impl<K, V, S> CartCache<K, V, S>
where
    K: Eq + Hash + Clone,
    S: PageSource<K, V>,
{
    /// Creates a cache, validating the bounds.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if both `max_elements` and `max_memory` are
    /// zero.
    ///
    /// # Example
    ///
    /// ```
    /// use cartcache::policy::cart::CartCache;
    ///
    /// let cache = CartCache::try_new(|key: &u64| *key, 100, 0).unwrap();
    /// assert_eq!(cache.max_elements(), 100);
    ///
    /// assert!(CartCache::<u64, u64, _>::try_new(|key: &u64| *key, 0, 0).is_err());
    /// ```
    pub fn try_new(source: S, max_elements: usize, max_memory: usize) -> Result<Self, ConfigError> {
        if max_elements == 0 && max_memory == 0 {
            return Err(ConfigError::new(
                "at least one bound (max_elements or max_memory) must be positive",
            ));
        }
        Ok(Self {
            source,
            index: PageIndex::new(),
            pins: PinTable::new(),
            state: Mutex::new(CartState::new()),
            max_elements,
            max_memory,
            counters: CacheCounters::default(),
        })
    }

    /// Creates a cache.
    ///
    /// # Panics
    ///
    /// Panics if both bounds are zero; use [`try_new`](Self::try_new) to
    /// validate without panicking.
    pub fn new(source: S, max_elements: usize, max_memory: usize) -> Self {
        Self::try_new(source, max_elements, max_memory).expect("invalid cache configuration")
    }

    /// Finds the value for `key`, loading it through the source on miss.
    ///
    /// On hit the entry's reference bit is set (a benign race: a lost write
    /// is corrected at the next clock sweep) and no lock is taken. On miss,
    /// exactly one of the racing callers runs the loader; the rest block on
    /// the per-key reservation and receive handles to the same instance.
    pub fn find_or_create(&self, key: K) -> PageHandle<'_, K, V, S> {
        if let Some(entry) = self.index.pin_resident(&self.pins, &key, true) {
            self.counters.inc_hit();
            return PageHandle::from_pinned(self, entry);
        }
        self.counters.inc_miss();
        self.install(key, None)
    }

    /// Inserts a pre-materialized value, without updating an existing entry.
    ///
    /// This is the publication point: the returned handle refers to whichever
    /// value ended up resident. If another thread installed `key` first (or
    /// it was already resident), the supplied `value` is not adopted — it is
    /// handed straight back to the embedder through [`PageSource::release`].
    ///
    /// # Example
    ///
    /// ```
    /// use cartcache::policy::cart::CartCache;
    ///
    /// let cache = CartCache::new(|key: &u64| *key, 4, 0);
    /// let loaded = cache.find_or_create(1); // resident value is 1
    /// let raced = cache.insert(1, 99);      // 99 is released, not adopted
    /// assert_eq!(*raced.value(), 1);
    /// drop((loaded, raced));
    /// ```
    pub fn insert(&self, key: K, value: V) -> PageHandle<'_, K, V, S> {
        self.install(key, Some(value))
    }

    /// Hit-only lookup: returns an empty handle on miss and does not set the
    /// reference bit.
    pub fn is_in_cache(&self, key: &K) -> PageHandle<'_, K, V, S> {
        match self.index.pin_resident(&self.pins, key, false) {
            Some(entry) => PageHandle::from_pinned(self, entry),
            None => PageHandle::empty(self),
        }
    }

    /// Returns `true` if `key` is resident, without pinning it or touching
    /// replacement state.
    pub fn contains(&self, key: &K) -> bool {
        self.index.is_published(key)
    }

    /// Force-removes `key` from the cache and releases its value.
    ///
    /// Blocks until outstanding handles for the value drain. Ghost history is
    /// not touched, so a later re-insert of `key` still reads as a
    /// re-reference. Removing an absent key is a no-op.
    pub fn remove(&self, key: &K) {
        let mut state = self.state.lock();
        let Some(found) = self.index.peek_resident(key) else {
            return;
        };

        let entry = if found.is_in_recent() {
            let Some(at) = state.recent.iter().position(|e| Arc::ptr_eq(e, &found)) else {
                debug_assert!(false, "resident entry missing from the recent queue");
                return;
            };
            let entry = state.recent.remove(at).expect("position in range");
            if entry.is_long_term() {
                state.num_long -= 1;
            } else {
                state.num_short -= 1;
            }
            entry
        } else {
            let Some(at) = state.frequent.iter().position(|e| Arc::ptr_eq(e, &found)) else {
                debug_assert!(false, "resident entry missing from the frequent queue");
                return;
            };
            let entry = state.frequent.remove(at).expect("position in range");
            state.num_long -= 1;
            entry
        };
        drop(found);

        state.used_memory = state
            .used_memory
            .saturating_sub(self.source.size_of(entry.value()));
        self.index.remove(key);
        self.release_entry(entry);
        tracing::trace!(
            recent = state.recent.len(),
            frequent = state.frequent.len(),
            "removed page"
        );
    }

    /// Drains the cache: releases every resident value (waiting for handles
    /// to drain), drops all ghost history, and resets the adaptation targets.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        while let Some(entry) = state.recent.pop_front() {
            self.index.remove(entry.key());
            self.release_entry(entry);
        }
        while let Some(entry) = state.frequent.pop_front() {
            self.index.remove(entry.key());
            self.release_entry(entry);
        }
        state.ghost_recent.clear();
        state.ghost_frequent.clear();
        state.target_recent = 0;
        state.target_ghost_recent = 0;
        state.num_short = 0;
        state.num_long = 0;
        state.used_memory = 0;
        tracing::debug!("cleared cache");
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.state.lock().resident_len()
    }

    /// Returns `true` if nothing is resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The entry-count bound (0 = unbounded).
    pub fn max_elements(&self) -> usize {
        self.max_elements
    }

    /// The byte bound (0 = unbounded).
    pub fn max_memory(&self) -> usize {
        self.max_memory
    }

    /// Sum of `size_of` over resident values, as last queried.
    pub fn used_memory(&self) -> usize {
        self.state.lock().used_memory
    }

    /// Number of entries in the recent (T1) queue.
    pub fn recent_len(&self) -> usize {
        self.state.lock().recent.len()
    }

    /// Number of entries in the frequent (T2) queue.
    pub fn frequent_len(&self) -> usize {
        self.state.lock().frequent.len()
    }

    /// Number of ghosts remembered for the recent queue (B1).
    pub fn ghost_recent_len(&self) -> usize {
        self.state.lock().ghost_recent.len()
    }

    /// Number of ghosts remembered for the frequent queue (B2).
    pub fn ghost_frequent_len(&self) -> usize {
        self.state.lock().ghost_frequent.len()
    }

    /// Current adaptation target for the recent queue (p). Grows on B1
    /// re-references, shrinks on B2 re-references.
    pub fn target_recent_len(&self) -> usize {
        self.state.lock().target_recent
    }

    /// Snapshot of the activity counters.
    pub fn metrics(&self) -> CacheMetrics {
        self.counters.snapshot()
    }

    /// The loader/releaser/sizer port this cache was built over.
    pub fn source(&self) -> &S {
        &self.source
    }

    pub(crate) fn pins(&self) -> &PinTable {
        &self.pins
    }

    // =========================================================================
    // Structural core
    // =========================================================================

    fn is_full(&self, state: &CartState<K, V>, incoming: usize) -> bool {
        (self.max_elements > 0 && state.resident_len() >= self.max_elements)
            || (self.max_memory > 0 && state.used_memory + incoming > self.max_memory)
    }

    /// Miss path: reserve the key, materialize the value, make room, link,
    /// publish.
    fn install(&self, key: K, preloaded: Option<V>) -> PageHandle<'_, K, V, S> {
        let slot = match self.index.find_or_reserve(&self.pins, &key) {
            IndexSlot::Resident(entry) => {
                if let Some(value) = preloaded {
                    // Lost the publication race; the value is not adopted.
                    self.source.release(&key, value);
                }
                return PageHandle::from_pinned(self, entry);
            },
            IndexSlot::Reserved(slot) => slot,
        };

        let mut guard = ReservationGuard {
            index: &self.index,
            key: &key,
            slot: &slot,
            armed: true,
        };

        let value = match preloaded {
            Some(value) => value,
            None => {
                self.counters.inc_load();
                self.source.load(&key)
            },
        };
        let incoming = self.source.size_of(&value);
        let entry = Arc::new(PageEntry::new(key.clone(), value));
        self.pins.pin(entry.pin_id()); // the cache's own reference

        {
            let mut state = self.state.lock();
            // Effective capacity: the element bound, or the current resident
            // count when the cache is bounded by memory alone.
            let mut eff_cap = if self.max_elements > 0 {
                self.max_elements
            } else {
                state.resident_len()
            };
            if self.is_full(&state, incoming) {
                eff_cap = state.resident_len();
                self.replace(&mut state, eff_cap, incoming);
                self.prune_history(&mut state, eff_cap, &key);
            }
            self.link_new_entry(&mut state, &entry, eff_cap);
            self.index.publish(&slot, &entry);
            state.used_memory += incoming;
            // The returned handle's pin, taken before the lock drops so a
            // concurrent structural pass cannot victimize the new entry
            // while it still looks unreferenced.
            self.pins.pin(entry.pin_id());
        }
        guard.armed = false;

        PageHandle::from_pinned(self, entry)
    }

    /// Clock sweeps plus victim demotion, repeated until the bounds hold or
    /// only pinned entries remain.
    fn replace(&self, state: &mut CartState<K, V>, eff_cap: usize, incoming: usize) {
        loop {
            // Referenced heads of the frequent queue earned another round of
            // recency: rotate them back into the recent queue.
            while state
                .frequent
                .front()
                .is_some_and(|head| head.is_referenced())
            {
                let entry = state.frequent.pop_front().expect("checked non-empty");
                entry.clear_referenced();
                entry.set_in_recent(true);
                state.recent.push_back(entry);
                if state.frequent.len() + state.ghost_frequent.len() + state.recent.len()
                    >= eff_cap + state.num_short
                {
                    state.target_ghost_recent = (state.target_ghost_recent + 1)
                        .min((2 * eff_cap).saturating_sub(state.recent.len()));
                }
            }

            // Clock sweep over the recent queue. Referenced heads rotate to
            // the tail (and may earn the Long filter bit); unreferenced Long
            // heads migrate to the frequent queue. The sweep stops at the
            // first unreferenced Short head, the natural eviction candidate.
            while state
                .recent
                .front()
                .is_some_and(|head| head.is_referenced() || head.is_long_term())
            {
                let entry = state.recent.pop_front().expect("checked non-empty");
                if entry.is_referenced() {
                    entry.clear_referenced();
                    let long_term = entry.is_long_term();
                    state.recent.push_back(Arc::clone(&entry));
                    if state.recent.len() >= (state.target_recent + 1).min(state.ghost_recent.len())
                        && !long_term
                    {
                        entry.set_long_term(true);
                        state.num_short -= 1;
                        state.num_long += 1;
                    }
                } else {
                    entry.set_in_recent(false);
                    state.frequent.push_back(entry);
                    state.target_ghost_recent = state
                        .target_ghost_recent
                        .saturating_sub(1)
                        .max(eff_cap.saturating_sub(state.recent.len()));
                }
            }

            if !self.demote_one(state) {
                // Every candidate is pinned: permit a transient overshoot.
                break;
            }
            if !self.is_full(state, incoming) {
                break;
            }
        }
    }

    /// Demotes one unpinned resident to ghost history and releases its value.
    /// Returns `false` if everything is pinned.
    fn demote_one(&self, state: &mut CartState<K, V>) -> bool {
        let mut victim = None;
        if state.recent.len() >= state.target_recent.max(1) {
            victim = state
                .recent
                .iter()
                .position(|entry| self.pins.count(entry.pin_id()) <= 1)
                .map(|at| (true, at));
        }
        if victim.is_none() {
            victim = state
                .frequent
                .iter()
                .position(|entry| self.pins.count(entry.pin_id()) <= 1)
                .map(|at| (false, at));
        }
        let Some((from_recent, at)) = victim else {
            return false;
        };

        let entry = if from_recent {
            let entry = state.recent.remove(at).expect("victim position in range");
            if entry.is_long_term() {
                state.num_long -= 1;
            } else {
                state.num_short -= 1;
            }
            state.ghost_recent.push_front(entry.key().clone());
            entry
        } else {
            let entry = state.frequent.remove(at).expect("victim position in range");
            state.num_long -= 1;
            state.ghost_frequent.push_front(entry.key().clone());
            entry
        };

        state.used_memory = state
            .used_memory
            .saturating_sub(self.source.size_of(entry.value()));
        self.index.remove(entry.key());
        self.release_entry(entry);
        self.counters.inc_eviction();
        tracing::trace!(
            recent = state.recent.len(),
            frequent = state.frequent.len(),
            ghost_recent = state.ghost_recent.len(),
            ghost_frequent = state.ghost_frequent.len(),
            used_memory = state.used_memory,
            "demoted resident page to history"
        );
        true
    }

    /// Drops one ghost once the combined history outgrows the cache.
    fn prune_history(&self, state: &mut CartState<K, V>, eff_cap: usize, incoming_key: &K) {
        let incoming_is_ghost = state.ghost_recent.contains(incoming_key)
            || state.ghost_frequent.contains(incoming_key);
        if incoming_is_ghost
            || state.ghost_recent.len() + state.ghost_frequent.len() < eff_cap + 1
        {
            return;
        }
        if state.ghost_recent.len() > state.target_ghost_recent || state.ghost_frequent.is_empty() {
            state.ghost_recent.pop_back();
        } else {
            state.ghost_frequent.pop_back();
        }
        tracing::trace!(
            ghost_recent = state.ghost_recent.len(),
            ghost_frequent = state.ghost_frequent.len(),
            "pruned ghost history"
        );
    }

    /// Links the freshly materialized entry into the recent queue, adapting
    /// the targets when the key re-references ghost history.
    fn link_new_entry(&self, state: &mut CartState<K, V>, entry: &Arc<PageEntry<K, V>>, eff_cap: usize) {
        let key = entry.key();
        if state.ghost_recent.contains(key) {
            // Recent re-reference: the recent queue was too small.
            let step = (state.num_short / state.ghost_recent.len()).max(1);
            state.target_recent = (state.target_recent + step).min(eff_cap);
            state.ghost_recent.remove(key);
            entry.set_long_term(true);
            state.num_long += 1;
            state.recent.push_back(Arc::clone(entry));
            self.counters.inc_history_hit();
        } else if state.ghost_frequent.contains(key) {
            // Long-term re-reference: the frequent side deserves more room.
            let step = (state.num_long / state.ghost_frequent.len()).max(1);
            state.target_recent = state.target_recent.saturating_sub(step);
            state.ghost_frequent.remove(key);
            entry.set_long_term(true);
            state.num_long += 1;
            state.recent.push_back(Arc::clone(entry));
            if state.frequent.len() + state.ghost_frequent.len() + state.recent.len()
                >= eff_cap + state.num_short
            {
                state.target_ghost_recent = (state.target_ghost_recent + 1)
                    .min((2 * eff_cap).saturating_sub(state.recent.len()));
            }
            self.counters.inc_history_hit();
        } else {
            state.num_short += 1;
            state.recent.push_back(Arc::clone(entry));
        }
    }

    /// Takes the cache's own pin (waiting for handles to drain) and hands the
    /// value back to the embedder.
    fn release_entry(&self, entry: Arc<PageEntry<K, V>>) {
        let reached_zero = self.pins.unpin(entry.pin_id(), true);
        debug_assert!(reached_zero, "the cache's reference must be the last pin");
        match Arc::try_unwrap(entry) {
            Ok(page) => {
                let (key, value) = page.into_parts();
                self.source.release(&key, value);
            },
            Err(_still_shared) => {
                debug_assert!(false, "resident entry still shared at release time");
            },
        }
    }

    /// Validates internal invariants. Available in debug/test builds.
    ///
    /// Panics if any invariant is violated. Intended for quiescent moments;
    /// concurrent installs can legitimately hold unpublished reservations.
    #[cfg(any(test, debug_assertions))]
    pub fn debug_validate_invariants(&self) {
        let state = self.state.lock();
        let resident = state.resident_len();

        // 1. Filter-bit counters partition the residents.
        assert_eq!(
            state.num_short + state.num_long,
            resident,
            "num_short({}) + num_long({}) != resident({})",
            state.num_short,
            state.num_long,
            resident
        );

        // 2. The frequent queue holds Long entries only; Shorts live in the
        //    recent queue.
        for entry in &state.frequent {
            assert!(entry.is_long_term(), "Short entry in the frequent queue");
            assert!(!entry.is_in_recent(), "frequent entry flagged in_recent");
        }
        for entry in &state.recent {
            assert!(entry.is_in_recent(), "recent entry not flagged in_recent");
        }
        let shorts = state
            .recent
            .iter()
            .filter(|entry| !entry.is_long_term())
            .count();
        assert_eq!(shorts, state.num_short, "num_short out of sync");

        // 3. Bounds on the adaptation targets and history size.
        if self.max_elements > 0 && resident <= self.max_elements {
            assert!(
                state.target_recent <= self.max_elements,
                "p({}) > max_elements({})",
                state.target_recent,
                self.max_elements
            );
            assert!(
                state.target_ghost_recent <= 2 * self.max_elements,
                "q({}) > 2 * max_elements({})",
                state.target_ghost_recent,
                self.max_elements
            );
            assert!(
                state.ghost_recent.len() + state.ghost_frequent.len() <= self.max_elements + 1,
                "history overflow: {} + {}",
                state.ghost_recent.len(),
                state.ghost_frequent.len()
            );
        }

        // 4. Residency and history are disjoint; every resident is pinned at
        //    least by the cache itself.
        for entry in state.recent.iter().chain(state.frequent.iter()) {
            assert!(
                !state.ghost_recent.contains(entry.key()),
                "resident key also in ghost_recent"
            );
            assert!(
                !state.ghost_frequent.contains(entry.key()),
                "resident key also in ghost_frequent"
            );
            assert!(self.pins.count(entry.pin_id()) >= 1, "unpinned resident");
        }
        state.ghost_recent.debug_validate_invariants();
        state.ghost_frequent.debug_validate_invariants();

        // 5. The published index agrees with the queues.
        let published = self.index.resident_entries();
        assert_eq!(
            published.len(),
            resident,
            "published slots({}) != resident entries({})",
            published.len(),
            resident
        );
        for entry in &published {
            let queue = if entry.is_in_recent() {
                &state.recent
            } else {
                &state.frequent
            };
            assert!(
                queue.iter().any(|e| Arc::ptr_eq(e, entry)),
                "published entry missing from its queue"
            );
        }

        // 6. Memory accounting matches a fresh sizing pass.
        let total: usize = state
            .recent
            .iter()
            .chain(state.frequent.iter())
            .map(|entry| self.source.size_of(entry.value()))
            .sum();
        assert_eq!(state.used_memory, total, "used_memory out of sync");
    }
}

impl<K, V, S> Drop for CartCache<K, V, S>
where
    K: Eq + Hash + Clone,
    S: PageSource<K, V>,
{
    fn drop(&mut self) {
        self.clear();
    }
}

impl<K, V, S> fmt::Debug for CartCache<K, V, S>
where
    K: Eq + Hash + Clone,
    S: PageSource<K, V>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CartCache")
            .field("max_elements", &self.max_elements)
            .field("max_memory", &self.max_memory)
            .field("recent_len", &state.recent.len())
            .field("frequent_len", &state.frequent.len())
            .field("ghost_recent_len", &state.ghost_recent.len())
            .field("ghost_frequent_len", &state.ghost_frequent.len())
            .field("target_recent", &state.target_recent)
            .field("used_memory", &state.used_memory)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
