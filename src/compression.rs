//! (De)compression of chunk data.

use crate::error::PadoccError;

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::{GzEncoder, ZlibEncoder};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use zune_inflate::{DeflateDecoder, DeflateOptions};

/// Compression codec as written in a `.zarray` `compressor` entry.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "id", rename_all = "lowercase")]
pub enum Compression {
    /// Gzip compression
    Gzip {
        #[serde(default = "default_level")]
        level: u32,
    },
    /// Zlib compression
    Zlib {
        #[serde(default = "default_level")]
        level: u32,
    },
}

fn default_level() -> u32 {
    1
}

impl Compression {
    /// Parse a `compressor` entry.
    ///
    /// Unknown codec ids are reported as unsupported.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, PadoccError> {
        serde_json::from_value(value.clone()).map_err(|_| PadoccError::UnsupportedOperation {
            operation: format!("decompression with {}", value),
        })
    }
}

/// Decompresses some Bytes and returns the uncompressed data.
///
/// # Arguments
///
/// * `compression`: Compression algorithm
/// * `data`: Compressed data [Bytes](bytes::Bytes)
pub fn decompress(compression: &Compression, data: &Bytes) -> Result<Bytes, PadoccError> {
    match compression {
        Compression::Gzip { .. } => decompress_flate2_gzip(data),
        Compression::Zlib { .. } => decompress_zune_zlib(data),
    }
}

/// Compresses a chunk for writing.
///
/// # Arguments
///
/// * `compression`: Compression algorithm and level
/// * `data`: Uncompressed data
pub fn compress(compression: &Compression, data: &[u8]) -> Result<Bytes, PadoccError> {
    let compressed = match compression {
        Compression::Gzip { level } => {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::new(*level));
            encoder.write_all(data)?;
            encoder.finish()?
        }
        Compression::Zlib { level } => {
            let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::new(*level));
            encoder.write_all(data)?;
            encoder.finish()?
        }
    };
    Ok(compressed.into())
}

fn decompress_flate2_gzip(data: &Bytes) -> Result<Bytes, PadoccError> {
    let mut decoder = GzDecoder::<&[u8]>::new(data);
    // Chunks are reinterpreted as arrays of numbers, so keep the buffer 8-byte aligned.
    let mut buf = maligned::align_first::<u8, maligned::A8>(data.len());
    decoder.read_to_end(&mut buf)?;
    buf.shrink_to(0);
    Ok(buf.into())
}

fn decompress_zune_zlib(data: &Bytes) -> Result<Bytes, PadoccError> {
    let options = DeflateOptions::default().set_size_hint(data.len());
    let mut decoder = DeflateDecoder::new_with_options(data, options);
    let data = decoder.decode_zlib()?;
    Ok(data.into())
}
