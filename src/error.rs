//! Error types for the cartcache library.
//!
//! ## Key Components
//!
//! - [`ConfigError`]: Returned when cache construction parameters are invalid
//!   (e.g. both the element bound and the memory bound are zero).
//! - [`InvariantError`]: Returned when internal data-structure invariants are
//!   violated (debug-only `check_invariants` methods).
//!
//! ## Example Usage
//!
//! ```
//! use cartcache::error::ConfigError;
//! use cartcache::policy::cart::CartCache;
//!
//! // Fallible constructor for user-configurable parameters
//! let cache: Result<CartCache<u64, u64, _>, ConfigError> =
//!     CartCache::try_new(|key: &u64| *key, 100, 0);
//! assert!(cache.is_ok());
//!
//! // Unbounded in both dimensions is caught without panicking
//! let bad = CartCache::<u64, u64, _>::try_new(|key: &u64| *key, 0, 0);
//! assert!(bad.is_err());
//! ```

use std::fmt;

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Error returned when cache configuration parameters are invalid.
///
/// Produced by fallible constructors such as
/// [`CartCache::try_new`](crate::policy::cart::CartCache::try_new) and
/// [`CartCacheBuilder::try_build`](crate::builder::CartCacheBuilder::try_build).
/// Carries a human-readable description of which parameter failed validation.
///
/// # Example
///
/// ```
/// use cartcache::policy::cart::CartCache;
///
/// let err = CartCache::<u64, u64, _>::try_new(|key: &u64| *key, 0, 0).unwrap_err();
/// assert!(err.to_string().contains("bound"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(String);

impl ConfigError {
    /// Creates a new `ConfigError` with the given description.
    #[inline]
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    /// Returns the error description.
    #[inline]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// InvariantError
// ---------------------------------------------------------------------------

/// Error returned when internal cache invariants are violated.
///
/// Carries a human-readable description of which invariant failed. The
/// debug-only validation entry points panic with the same descriptions; this
/// type exists for callers that prefer a fallible probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantError(String);

impl InvariantError {
    /// Creates a new `InvariantError` with the given description.
    #[inline]
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    /// Returns the error description.
    #[inline]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for InvariantError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- ConfigError ------------------------------------------------------

    #[test]
    fn config_display_shows_message() {
        let err = ConfigError::new("at least one bound must be positive");
        assert_eq!(err.to_string(), "at least one bound must be positive");
    }

    #[test]
    fn config_debug_includes_message() {
        let err = ConfigError::new("bad bound");
        let dbg = format!("{:?}", err);
        assert!(dbg.contains("bad bound"));
    }

    #[test]
    fn config_message_accessor() {
        let err = ConfigError::new("test");
        assert_eq!(err.message(), "test");
    }

    #[test]
    fn config_clone_and_eq() {
        let a = ConfigError::new("x");
        let b = a.clone();
        assert_eq!(a, b);
    }

    #[test]
    fn config_implements_std_error() {
        fn assert_error<T: std::error::Error>() {}
        assert_error::<ConfigError>();
    }

    // -- InvariantError ---------------------------------------------------

    #[test]
    fn invariant_display_shows_message() {
        let err = InvariantError::new("queue length mismatch");
        assert_eq!(err.to_string(), "queue length mismatch");
    }

    #[test]
    fn invariant_clone_and_eq() {
        let a = InvariantError::new("x");
        let b = a.clone();
        assert_eq!(a, b);
    }

    #[test]
    fn invariant_implements_std_error() {
        fn assert_error<T: std::error::Error>() {}
        assert_error::<InvariantError>();
    }
}
