use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::compression::CompressionConfig;

/// Main cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Memory tier capacity in entries
    pub capacity: usize,
    /// Maximum size of a single value in bytes; larger puts are rejected
    pub max_entry_size: usize,
    /// Directory holding all partition files
    pub directory: PathBuf,
    /// Depth of the write-behind queue; puts block when it is full
    pub queue_capacity: usize,
    pub partition: PartitionConfig,
    pub compression: CompressionConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            max_entry_size: 8 * 1024 * 1024,
            directory: PathBuf::from("./data/cache"),
            queue_capacity: 1024,
            partition: PartitionConfig::default(),
            compression: CompressionConfig::default(),
        }
    }
}

/// Partition rotation and flush thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Rotate the active partition once it holds this many rows
    pub max_rows: u64,
    /// Rotate the active partition once its body reaches this many bytes
    pub max_bytes: u64,
    /// Durably flush after this many unflushed rows
    pub flush_rows: u64,
    /// Durably flush after this many unflushed bytes
    pub flush_bytes: u64,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            max_rows: 65_536,
            max_bytes: 256 * 1024 * 1024,
            flush_rows: 512,
            flush_bytes: 4 * 1024 * 1024,
        }
    }
}

impl CacheConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: CacheConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}
