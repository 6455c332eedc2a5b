//! Builder for cache construction parameters.
//!
//! A thin, readable alternative to positional bounds in
//! [`CartCache::new`](crate::policy::cart::CartCache::new).
//!
//! ## Example
//!
//! ```
//! use cartcache::builder::CartCacheBuilder;
//! use cartcache::policy::cart::CartCache;
//!
//! let cache: CartCache<u64, String, _> = CartCacheBuilder::new()
//!     .max_elements(1024)
//!     .max_memory(64 << 20)
//!     .try_build(|key: &u64| key.to_string())
//!     .unwrap();
//!
//! assert_eq!(cache.max_elements(), 1024);
//! assert_eq!(cache.max_memory(), 64 << 20);
//! ```

use std::hash::Hash;

use crate::error::ConfigError;
use crate::policy::cart::CartCache;
use crate::traits::PageSource;

/// Accumulates the cache bounds; `try_build` validates them.
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct CartCacheBuilder {
    max_elements: usize,
    max_memory: usize,
}

impl CartCacheBuilder {
    /// Starts with both bounds unset (zero).
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the number of resident entries (0 = unbounded).
    pub fn max_elements(mut self, max_elements: usize) -> Self {
        self.max_elements = max_elements;
        self
    }

    /// Caps the total byte footprint of resident values (0 = unbounded).
    pub fn max_memory(mut self, max_memory: usize) -> Self {
        self.max_memory = max_memory;
        self
    }

    /// Builds the cache over `source`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if both bounds are zero.
    pub fn try_build<K, V, S>(self, source: S) -> Result<CartCache<K, V, S>, ConfigError>
    where
        K: Eq + Hash + Clone,
        S: PageSource<K, V>,
    {
        CartCache::try_new(source, self.max_elements, self.max_memory)
    }
}
