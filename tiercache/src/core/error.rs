use std::path::PathBuf;
use thiserror::Error;

/// Main error type for cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("entry too large: {size} bytes (max {max})")]
    EntryTooLarge { size: usize, max: usize },

    #[error("partition write failed: {0}")]
    PartitionWrite(String),

    #[error("partition {id} corrupt: {reason}")]
    PartitionCorrupt { id: u64, reason: String },

    #[error("partition id {id} claimed by both {first:?} and {second:?}")]
    PartitionIdConflict {
        id: u64,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("cache is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for CacheError {
    fn from(e: bincode::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;
