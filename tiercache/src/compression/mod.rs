//! Value compression for persisted rows
//!
//! Values above a configurable size floor are compressed before they are
//! appended to the active partition; the algorithm is recorded in the row
//! so reads are self-describing.

mod compressor;

pub use compressor::{CompressionAlgorithm, CompressionConfig, Compressor};
