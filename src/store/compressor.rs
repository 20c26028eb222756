//! Column value-area compression.
//!
//! Columns declared with `compression = zstd` store their value area as a
//! single zstd frame inside the chunk image; the columnar view inflates it
//! on first access.

use thiserror::Error;

use crate::config::Compression;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Zstd compression failed: {0}")]
    ZstdError(#[from] std::io::Error),

    #[error("decompressed column area is {actual} bytes, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Compresses and inflates column areas.
#[derive(Debug, Clone, Copy)]
pub struct Compressor {
    zstd_level: i32,
}

impl Compressor {
    pub fn new(zstd_level: i32) -> Self {
        Self { zstd_level }
    }

    /// Encode `data` for a column with the given mode.
    pub fn compress(&self, mode: Compression, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        match mode {
            Compression::None => Ok(data.to_vec()),
            Compression::Zstd => self.zstd_compress(data),
        }
    }

    /// Decode a column area whose raw length is known.
    pub fn decompress(
        &self,
        mode: Compression,
        data: &[u8],
        raw_len: usize,
    ) -> Result<Vec<u8>, CompressionError> {
        let out = match mode {
            Compression::None => data.to_vec(),
            Compression::Zstd => zstd_decompress(data)?,
        };
        if out.len() != raw_len {
            return Err(CompressionError::LengthMismatch {
                expected: raw_len,
                actual: out.len(),
            });
        }
        Ok(out)
    }

    fn zstd_compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let compressed = zstd::encode_all(data, self.zstd_level)?;
        Ok(compressed)
    }
}

fn zstd_decompress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let decompressed = zstd::decode_all(data)?;
    Ok(decompressed)
}
