//! Payload compression for persisted records.
//!
//! Optional zstd on the write path. A payload is stored compressed only when
//! that actually makes it smaller, so already-compressed media passes through.

use bytes::Bytes;
use thiserror::Error;

use crate::config::CompressionConfig;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Zstd compression failed: {0}")]
    ZstdError(#[from] std::io::Error),

    #[error("Decompressed size {actual} does not match recorded size {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
}

/// A payload ready to be written, and whether it is zstd-encoded.
#[derive(Debug, Clone)]
pub struct EncodedPayload {
    pub data: Bytes,
    pub compressed: bool,
}

#[derive(Debug, Clone)]
pub struct Compressor {
    config: CompressionConfig,
}

impl Compressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Encode a payload for storage.
    pub fn encode(&self, data: &Bytes) -> Result<EncodedPayload, CompressionError> {
        if !self.config.enabled || data.is_empty() {
            return Ok(EncodedPayload {
                data: data.clone(),
                compressed: false,
            });
        }

        let compressed = self.zstd_compress(data)?;
        if compressed.len() >= data.len() {
            return Ok(EncodedPayload {
                data: data.clone(),
                compressed: false,
            });
        }

        Ok(EncodedPayload {
            data: Bytes::from(compressed),
            compressed: true,
        })
    }

    /// Decode a stored payload and check it against the recorded size.
    pub fn decode(
        &self,
        data: Bytes,
        compressed: bool,
        expected_size: u64,
    ) -> Result<Bytes, CompressionError> {
        let payload = if compressed {
            Bytes::from(self.zstd_decompress(&data)?)
        } else {
            data
        };

        if payload.len() as u64 != expected_size {
            return Err(CompressionError::SizeMismatch {
                expected: expected_size,
                actual: payload.len() as u64,
            });
        }
        Ok(payload)
    }

    /// Compress data with zstd.
    fn zstd_compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let compressed = zstd::encode_all(data, self.config.zstd_level)?;
        Ok(compressed)
    }

    /// Decompress zstd data.
    fn zstd_decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let decompressed = zstd::decode_all(data)?;
        Ok(decompressed)
    }
}
