use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::compression::CompressionAlgorithm;

/// Magic bytes at the start of every partition file
pub const PARTITION_MAGIC: &[u8; 8] = b"TIERPAR1";

/// Magic bytes at the very end of a finalized partition file
pub const FOOTER_MAGIC: &[u8; 8] = b"TIERFTR1";

/// Bytes of header before the first row
pub const PARTITION_HEADER_LEN: u64 = 8;

/// Bytes of footer trailer: crc (u32) + payload length (u32) + magic (8)
pub const FOOTER_TRAILER_LEN: u64 = 16;

/// A single persisted operation record.
/// Row scans replay these in order, so a tombstone written after a put
/// keeps an invalidated key dead across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Row {
    pub timestamp: u64,
    pub op: RowOp,
}

/// Operations that can be persisted in a partition row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RowOp {
    /// Store a value for a key
    Put {
        key: String,
        value: Vec<u8>,
        compression: CompressionAlgorithm,
    },
    /// Tombstone: the key was invalidated
    Delete { key: String },
}

impl Row {
    pub fn key(&self) -> &str {
        match &self.op {
            RowOp::Put { key, .. } => key,
            RowOp::Delete { key } => key,
        }
    }
}

/// Footer written when a partition is finalized, enabling metadata-only
/// reads from the file tail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionFooter {
    /// Rows actually serialized into the body
    pub row_count: u64,
    /// Length of the body region in bytes
    pub body_bytes: u64,
    /// CRC32 over the whole body region
    pub body_crc: u32,
    /// Smallest row timestamp
    pub min_timestamp: u64,
    /// Largest row timestamp
    pub max_timestamp: u64,
}

/// Catalog entry for one on-disk partition
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionMeta {
    /// Strictly increasing integer id, parsed from the filename
    pub id: u64,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub row_count: u64,
    pub created_at: u64,
    pub modified_at: u64,
    pub finalized: bool,
}

/// A partition file that discovery refused to index.
/// The file is left on disk untouched; recovery is manual.
#[derive(Debug, Clone)]
pub struct CorruptPartition {
    pub id: Option<u64>,
    pub path: PathBuf,
    pub reason: String,
}

/// Everything discovery observed, successes and failures both
#[derive(Debug, Clone, Default)]
pub struct DiscoveryReport {
    /// Candidate partition files seen in the directory
    pub scanned: usize,
    /// Files excluded from the index
    pub corrupt: Vec<CorruptPartition>,
    /// Id of the crashed active partition recovered by salvage, if any
    pub salvaged: Option<u64>,
    /// Whether the sidecar index supplied the key table
    pub sidecar_used: bool,
}
