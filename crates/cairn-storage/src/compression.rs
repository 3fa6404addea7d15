//! zlib encoding of canonical objects.
//!
//! Loose objects on disk are the zlib-compressed canonical encoding
//! `"<type> <len>\0" + content`, identical to git's own layout.

use crate::{GitObject, ObjectType, Result, StorageError};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

/// Compression level configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    /// No compression
    None,
    /// Fast compression (lower ratio)
    Fast,
    /// Default compression (balanced)
    #[default]
    Default,
    /// Best compression (slower, higher ratio)
    Best,
}

impl CompressionLevel {
    /// Converts to flate2 compression level.
    pub fn to_flate2(self) -> flate2::Compression {
        match self {
            CompressionLevel::None => flate2::Compression::none(),
            CompressionLevel::Fast => flate2::Compression::fast(),
            CompressionLevel::Default => flate2::Compression::default(),
            CompressionLevel::Best => flate2::Compression::best(),
        }
    }
}

/// Compresses the canonical encoding of an object.
pub fn compress(object: &GitObject, level: CompressionLevel) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), level.to_flate2());
    encoder
        .write_all(&object.object_type.header(object.data.len()))
        .map_err(|e| StorageError::Compression(e.to_string()))?;
    encoder
        .write_all(&object.data)
        .map_err(|e| StorageError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| StorageError::Compression(e.to_string()))
}

/// Decompresses a loose object and parses its header.
///
/// The declared length must match the content length.
pub fn decompress(compressed: &[u8]) -> Result<GitObject> {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| StorageError::Compression(e.to_string()))?;

    let null_pos = decompressed
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| StorageError::InvalidObject("missing null byte in header".to_string()))?;

    let header = std::str::from_utf8(&decompressed[..null_pos])
        .map_err(|_| StorageError::InvalidObject("non-utf8 header".to_string()))?;
    let (kind, size) = header
        .split_once(' ')
        .ok_or_else(|| StorageError::InvalidObject(format!("invalid header: {}", header)))?;

    let object_type = ObjectType::parse(kind)?;
    let size: usize = size
        .parse()
        .map_err(|_| StorageError::InvalidObject("invalid size".to_string()))?;

    let data = decompressed.split_off(null_pos + 1);
    if data.len() != size {
        return Err(StorageError::InvalidObject(format!(
            "size mismatch: header says {}, content is {}",
            size,
            data.len()
        )));
    }

    Ok(GitObject::new(object_type, data))
}

/// Compression statistics for monitoring.
#[derive(Debug, Default)]
pub struct CompressionStats {
    input_bytes: AtomicU64,
    output_bytes: AtomicU64,
}

impl CompressionStats {
    /// Records a compression operation.
    pub fn record(&self, input_size: u64, output_size: u64) {
        self.input_bytes.fetch_add(input_size, Ordering::Relaxed);
        self.output_bytes.fetch_add(output_size, Ordering::Relaxed);
    }

    /// Returns the compression ratio (output/input).
    pub fn compression_ratio(&self) -> f64 {
        let input = self.input_bytes.load(Ordering::Relaxed);
        let output = self.output_bytes.load(Ordering::Relaxed);
        if input == 0 {
            1.0
        } else {
            output as f64 / input as f64
        }
    }
}
