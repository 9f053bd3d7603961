//! Partitioned append-only persistence
//!
//! One file per partition, numbered `cache_<id>.part`: a row-oriented
//! body plus a footer enabling metadata-only reads. Discovery scans the
//! directory once at startup; an `index.json` sidecar is the fast-path.

pub mod index;
pub mod partition;
pub mod types;

pub use index::{Discovery, PartitionIndex, SharedIndex, discover, parse_partition_filename, partition_filename};
pub use partition::{AppendOutcome, PartitionStore};
pub use types::{CorruptPartition, DiscoveryReport, PartitionFooter, PartitionMeta, Row, RowOp};
