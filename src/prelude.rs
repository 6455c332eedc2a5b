pub use crate::builder::CartCacheBuilder;
pub use crate::ds::HistoryList;
pub use crate::error::{ConfigError, InvariantError};
pub use crate::policy::cart::{CacheMetrics, CartCache};
pub use crate::policy::handle::PageHandle;
pub use crate::store::pin_table::PinTable;
pub use crate::traits::{CompoundKey, PageSource};
