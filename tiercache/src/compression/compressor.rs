use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::debug;

/// Compression algorithm selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// No compression
    #[default]
    None,
    /// LZ4 - Fast compression/decompression
    Lz4,
    /// Zstandard - Better compression ratio
    Zstd,
}

/// Compression configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Enable compression of persisted values
    pub enabled: bool,
    /// Minimum payload size to compress (bytes)
    pub min_payload_size: usize,
    /// Default algorithm
    pub default_algorithm: CompressionAlgorithm,
    /// Zstd compression level (1-22)
    pub zstd_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_payload_size: 1024, // Don't compress < 1KB
            default_algorithm: CompressionAlgorithm::Lz4,
            zstd_level: 3, // Balanced compression
        }
    }
}

/// Compressor for values written into partition rows
pub struct Compressor {
    config: CompressionConfig,
}

impl Compressor {
    /// Create new compressor with configuration
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Compress data, returning the bytes and the algorithm actually applied.
    /// Rows record the algorithm so reads are self-describing.
    pub fn compress(&self, data: &[u8]) -> Result<(Vec<u8>, CompressionAlgorithm), std::io::Error> {
        if !self.config.enabled || data.len() < self.config.min_payload_size {
            return Ok((data.to_vec(), CompressionAlgorithm::None));
        }

        match self.config.default_algorithm {
            CompressionAlgorithm::None => Ok((data.to_vec(), CompressionAlgorithm::None)),
            CompressionAlgorithm::Lz4 => {
                Ok((self.compress_lz4(data)?, CompressionAlgorithm::Lz4))
            }
            CompressionAlgorithm::Zstd => {
                Ok((self.compress_zstd(data)?, CompressionAlgorithm::Zstd))
            }
        }
    }

    /// Decompress data using the algorithm recorded in the row
    pub fn decompress(
        &self,
        data: &[u8],
        algorithm: CompressionAlgorithm,
    ) -> Result<Vec<u8>, std::io::Error> {
        match algorithm {
            CompressionAlgorithm::None => Ok(data.to_vec()),
            CompressionAlgorithm::Lz4 => self.decompress_lz4(data),
            CompressionAlgorithm::Zstd => self.decompress_zstd(data),
        }
    }

    /// Compress using LZ4
    fn compress_lz4(&self, data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        let mut encoder = lz4::EncoderBuilder::new()
            .level(4) // Fast compression
            .build(Vec::new())?;

        encoder.write_all(data)?;
        let (compressed, result) = encoder.finish();
        result?;

        debug!(
            "LZ4 compressed: {} → {} bytes",
            data.len(),
            compressed.len()
        );

        Ok(compressed)
    }

    /// Decompress using LZ4
    fn decompress_lz4(&self, data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        let mut decoder = lz4::Decoder::new(data)?;
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed)?;
        Ok(decompressed)
    }

    /// Compress using Zstandard
    fn compress_zstd(&self, data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        let compressed = zstd::stream::encode_all(data, self.config.zstd_level)?;

        debug!(
            "Zstd compressed: {} → {} bytes",
            data.len(),
            compressed.len()
        );

        Ok(compressed)
    }

    /// Decompress using Zstandard
    fn decompress_zstd(&self, data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        zstd::stream::decode_all(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressor(enabled: bool, algorithm: CompressionAlgorithm) -> Compressor {
        Compressor::new(CompressionConfig {
            enabled,
            min_payload_size: 64,
            default_algorithm: algorithm,
            zstd_level: 3,
        })
    }

    #[test]
    fn test_disabled_passthrough() {
        let c = compressor(false, CompressionAlgorithm::Lz4);
        let data = vec![42u8; 4096];

        let (out, algo) = c.compress(&data).unwrap();
        assert_eq!(algo, CompressionAlgorithm::None);
        assert_eq!(out, data);
    }

    #[test]
    fn test_small_payload_skipped() {
        let c = compressor(true, CompressionAlgorithm::Lz4);
        let data = b"tiny".to_vec();

        let (out, algo) = c.compress(&data).unwrap();
        assert_eq!(algo, CompressionAlgorithm::None);
        assert_eq!(out, data);
    }

    #[test]
    fn test_lz4_round_trip() {
        let c = compressor(true, CompressionAlgorithm::Lz4);
        let data = vec![7u8; 8192];

        let (compressed, algo) = c.compress(&data).unwrap();
        assert_eq!(algo, CompressionAlgorithm::Lz4);
        assert!(compressed.len() < data.len());

        let restored = c.decompress(&compressed, algo).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn test_zstd_round_trip() {
        let c = compressor(true, CompressionAlgorithm::Zstd);
        let data = b"abcdefgh".repeat(1024);

        let (compressed, algo) = c.compress(&data).unwrap();
        assert_eq!(algo, CompressionAlgorithm::Zstd);
        assert!(compressed.len() < data.len());

        let restored = c.decompress(&compressed, algo).unwrap();
        assert_eq!(restored, data);
    }
}
