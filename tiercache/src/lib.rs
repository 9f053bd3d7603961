pub mod cache;
pub mod compression;
pub mod config;
pub mod core;
pub mod persistence;

// Re-export commonly used types
pub use cache::{ArcTier, TieredCache};
pub use compression::{CompressionAlgorithm, CompressionConfig, Compressor};
pub use config::{CacheConfig, PartitionConfig};
pub use crate::core::{
    CacheEntry, CacheError, CacheStats, Lookup, PutOptions, Result, RowLocation, Tier,
};
pub use persistence::{CorruptPartition, DiscoveryReport, PartitionIndex, PartitionMeta};
