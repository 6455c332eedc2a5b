//! Scoped, pinned access to one resident value.

use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::Arc;

use crate::policy::cart::CartCache;
use crate::policy::entry::PageEntry;
use crate::traits::PageSource;

/// A reference-counted accessor for one resident value.
///
/// While a handle is live, the pin count for its (key, value-identity) stays
/// positive and the replacement engine will not hand the value back to the
/// embedder — the entry may still migrate between the recent and frequent
/// queues, or even be demoted to history, but the value outlives the handle.
///
/// Cloning a handle takes an additional pin ([`duplicate`](Self::duplicate)
/// is an alias); moving transfers the pin without touching the count;
/// dropping releases it. A handle is never the *last* pin — the cache holds
/// its own reference until the structural release path takes it — so a drop
/// that reaches zero is a contract violation (asserted in debug builds,
/// benign in release: the entry is orphaned and reclaimed without the
/// releaser on the next structural pass).
///
/// # Example
///
/// ```
/// use cartcache::policy::cart::CartCache;
///
/// let cache = CartCache::new(|key: &u64| key * 2, 4, 0);
///
/// let page = cache.find_or_create(21);
/// assert_eq!(*page.value(), 42);
/// assert_eq!(*page.key(), 21);
///
/// let copy = page.duplicate();
/// drop(page);
/// assert_eq!(*copy, 42); // still pinned through `copy`
/// ```
pub struct PageHandle<'a, K, V, S>
where
    K: Eq + Hash + Clone,
    S: PageSource<K, V>,
{
    cache: &'a CartCache<K, V, S>,
    entry: Option<Arc<PageEntry<K, V>>>,
}

impl<'a, K, V, S> PageHandle<'a, K, V, S>
where
    K: Eq + Hash + Clone,
    S: PageSource<K, V>,
{
    /// Wraps an entry whose pin has already been taken by the lookup
    /// protocol.
    pub(crate) fn from_pinned(cache: &'a CartCache<K, V, S>, entry: Arc<PageEntry<K, V>>) -> Self {
        Self {
            cache,
            entry: Some(entry),
        }
    }

    /// An empty handle (miss outcome of [`CartCache::is_in_cache`]).
    pub(crate) fn empty(cache: &'a CartCache<K, V, S>) -> Self {
        Self { cache, entry: None }
    }

    /// Returns `true` if the handle holds no entry.
    pub fn is_empty(&self) -> bool {
        self.entry.is_none()
    }

    /// The pinned value.
    ///
    /// # Panics
    ///
    /// Panics if the handle is empty.
    pub fn value(&self) -> &V {
        self.entry
            .as_ref()
            .expect("value() on an empty page handle")
            .value()
    }

    /// The pinned entry's key.
    ///
    /// # Panics
    ///
    /// Panics if the handle is empty.
    pub fn key(&self) -> &K {
        self.entry
            .as_ref()
            .expect("key() on an empty page handle")
            .key()
    }

    /// Yields a second handle pinning the same entry.
    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    /// Drops the pin early, leaving the handle empty.
    pub fn release(&mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(entry) = self.entry.take() {
            let id = entry.pin_id();
            // Give up the strong reference before the count drops, so the
            // structural release path can take unique ownership the moment
            // the pin table reads 1.
            drop(entry);
            let last = self.cache.pins().unpin(id, false);
            debug_assert!(!last, "a handle must never hold the last pin");
        }
    }
}

impl<K, V, S> Clone for PageHandle<'_, K, V, S>
where
    K: Eq + Hash + Clone,
    S: PageSource<K, V>,
{
    fn clone(&self) -> Self {
        if let Some(entry) = &self.entry {
            self.cache.pins().pin(entry.pin_id());
        }
        Self {
            cache: self.cache,
            entry: self.entry.clone(),
        }
    }
}

impl<K, V, S> Drop for PageHandle<'_, K, V, S>
where
    K: Eq + Hash + Clone,
    S: PageSource<K, V>,
{
    fn drop(&mut self) {
        self.detach();
    }
}

impl<K, V, S> Deref for PageHandle<'_, K, V, S>
where
    K: Eq + Hash + Clone,
    S: PageSource<K, V>,
{
    type Target = V;

    fn deref(&self) -> &V {
        self.value()
    }
}

impl<K, V, S> fmt::Debug for PageHandle<'_, K, V, S>
where
    K: Eq + Hash + Clone,
    S: PageSource<K, V>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageHandle")
            .field("empty", &self.is_empty())
            .finish_non_exhaustive()
    }
}
