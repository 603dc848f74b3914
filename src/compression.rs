//! gzip codec for durable-tier bodies.
//!
//! Non-file resources at or above `compression_min_size` bytes are stored
//! gzip-compressed with a `gzip` content encoding. Reads decode by that label
//! only; an unlabeled body is returned as stored, gzip header or not.
//!
//! # Example
//!
//! ```
//! use resource_engine::compression::{compress, decompress, is_compressed};
//!
//! let body = br#"{"messages":[{"role":"user","content":"hello"}]}"#;
//! let packed = compress(body).unwrap();
//! assert!(is_compressed(&packed));
//! assert_eq!(decompress(&packed).unwrap(), body.to_vec());
//! ```

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// Content-Encoding label for gzip bodies.
pub const GZIP_ENCODING: &str = "gzip";

/// gzip magic bytes: 0x1F 0x8B
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("compression failed: {0}")]
    CompressFailed(String),

    #[error("decompression failed: {0}")]
    DecompressFailed(String),

    #[error("unsupported content encoding: {0}")]
    UnsupportedEncoding(String),
}

#[inline]
#[must_use]
pub fn is_compressed(data: &[u8]) -> bool {
    data.len() >= 2 && data[..2] == GZIP_MAGIC
}

pub fn compress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| CompressionError::CompressFailed(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CompressionError::CompressFailed(e.to_string()))
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CompressionError::DecompressFailed(e.to_string()))?;
    Ok(out)
}

/// Decode a stored body according to its content encoding.
pub fn decode(data: Vec<u8>, content_encoding: Option<&str>) -> Result<Vec<u8>, CompressionError> {
    match content_encoding {
        Some(enc) if enc.eq_ignore_ascii_case(GZIP_ENCODING) => decompress(&data),
        Some(enc) if enc.eq_ignore_ascii_case("identity") => Ok(data),
        Some(other) => Err(CompressionError::UnsupportedEncoding(other.to_string())),
        None => Ok(data),
    }
}

/// Compress `data` if it is at least `min_size` bytes.
///
/// Returns the body to store and its content encoding.
pub fn maybe_compress(data: Vec<u8>, min_size: usize) -> Result<(Vec<u8>, Option<&'static str>), CompressionError> {
    if data.len() >= min_size {
        Ok((compress(&data)?, Some(GZIP_ENCODING)))
    } else {
        Ok((data, None))
    }
}
