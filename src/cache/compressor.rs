//! Value compression for the on-disk tier.
//!
//! Values at or above a size threshold are zstd-compressed before they are
//! appended to a segment. Each record carries a flag so mixed segments decode
//! correctly after the threshold or level changes.

use thiserror::Error;

use crate::config::CompressionConfig;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Zstd compression failed: {0}")]
    ZstdError(#[from] std::io::Error),
}

/// The result of preparing a value for disk.
#[derive(Debug)]
pub struct Encoded {
    pub data: Vec<u8>,
    pub compressed: bool,
}

/// The compression engine for segment records.
#[derive(Debug, Clone)]
pub struct Compressor {
    config: CompressionConfig,
}

impl Compressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Encode a value for storage, compressing only when it pays off.
    pub fn encode(&self, value: &[u8]) -> Result<Encoded, CompressionError> {
        if !self.config.enabled || value.len() < self.config.min_size_bytes {
            return Ok(Encoded {
                data: value.to_vec(),
                compressed: false,
            });
        }

        let compressed = self.zstd_compress(value)?;
        if compressed.len() >= value.len() {
            return Ok(Encoded {
                data: value.to_vec(),
                compressed: false,
            });
        }
        Ok(Encoded {
            data: compressed,
            compressed: true,
        })
    }

    /// Decode a stored value.
    pub fn decode(&self, data: &[u8], compressed: bool) -> Result<Vec<u8>, CompressionError> {
        if compressed {
            self.zstd_decompress(data)
        } else {
            Ok(data.to_vec())
        }
    }

    fn zstd_compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let compressed = zstd::encode_all(data, self.config.zstd_level)?;
        Ok(compressed)
    }

    fn zstd_decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let decompressed = zstd::decode_all(data)?;
        Ok(decompressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zstd_roundtrip() {
        let compressor = Compressor::new(CompressionConfig::default());
        let data = vec![42u8; 4096];

        let encoded = compressor.encode(&data).unwrap();
        assert!(encoded.compressed);
        assert!(encoded.data.len() < data.len());

        let decoded = compressor.decode(&encoded.data, encoded.compressed).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_small_values_stay_raw() {
        let compressor = Compressor::new(CompressionConfig::default());
        let encoded = compressor.encode(b"tiny").unwrap();
        assert!(!encoded.compressed);
        assert_eq!(encoded.data, b"tiny");
    }

    #[test]
    fn test_disabled_never_compresses() {
        let compressor = Compressor::new(CompressionConfig {
            enabled: false,
            ..Default::default()
        });
        let encoded = compressor.encode(&vec![0u8; 1 << 16]).unwrap();
        assert!(!encoded.compressed);
    }
}
