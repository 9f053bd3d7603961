pub mod error;
pub mod types;

pub use error::{CacheError, Result};
pub use types::{CacheEntry, CacheStats, KeyTable, Lookup, PutOptions, RowLocation, Tier};
