use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Which tier an entry was served from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Memory, recency list (seen once)
    Recent,
    /// Memory, frequency list (reused)
    Frequent,
    /// On-disk partition or the write-behind buffer
    Disk,
}

/// A cache entry as returned to callers
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Content identifier
    pub key: String,
    /// Raw value bytes
    pub value: Vec<u8>,
    /// Size of the value in bytes
    pub size_bytes: usize,
    /// Tier the entry was found in
    pub tier: Tier,
}

/// Result of a cache lookup
#[derive(Debug)]
pub enum Lookup {
    Hit(CacheEntry),
    /// Key absent everywhere; the caller must consult the primary content store
    Miss,
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }

    pub fn into_value(self) -> Option<Vec<u8>> {
        match self {
            Lookup::Hit(entry) => Some(entry.value),
            Lookup::Miss => None,
        }
    }
}

/// Where a persisted row lives: partition id plus byte offset within the file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowLocation {
    pub partition_id: u64,
    pub offset: u64,
}

/// Key -> on-disk location table
pub type KeyTable = HashMap<String, RowLocation, ahash::RandomState>;

/// Options for a single put
#[derive(Debug, Clone, Copy, Default)]
pub struct PutOptions {
    /// Block until the write is durably flushed instead of the default
    /// write-behind acknowledgement
    pub sync_flush: bool,
}

/// Statistics for the tiered cache
#[derive(Debug, Default, Clone, Serialize)]
pub struct CacheStats {
    /// Hits served from the memory tier
    pub memory_hits: u64,
    /// Hits served from partitions or the write-behind buffer
    pub disk_hits: u64,
    /// Misses (key absent everywhere)
    pub misses: u64,
    /// Entries in the recency list
    pub t1_len: usize,
    /// Entries in the frequency list
    pub t2_len: usize,
    /// Keys in the recency ghost list
    pub b1_len: usize,
    /// Keys in the frequency ghost list
    pub b2_len: usize,
    /// Adaptive target size for the recency list
    pub p: usize,
    /// Resident entries in memory
    pub entries: usize,
    /// Partitions on disk (finalized plus the active one)
    pub partition_count: usize,
    /// Total bytes on disk
    pub disk_bytes: u64,
    /// Writes queued but not yet appended
    pub pending_writes: usize,
}

impl CacheStats {
    /// Calculate overall hit rate
    pub fn hit_rate(&self) -> f64 {
        let hits = self.memory_hits + self.disk_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Current Unix timestamp in seconds
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}
