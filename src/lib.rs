//! cartcache: a concurrent in-memory page cache with CART replacement.
//!
//! Lookups are lock-free on the hit path; structural mutation (install,
//! demotion, history rebalance) is serialized behind one lock; pinned values
//! are never released while a handle is live. See
//! [`policy::cart::CartCache`] for the full picture.

pub mod ds;
pub mod policy;
pub mod store;

pub mod builder;
pub mod error;
pub mod prelude;
pub mod traits;
