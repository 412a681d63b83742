//! Brick payload compression

use crate::error::{Error, Result};
use flate2::write::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Codec applied to every raster brick payload in a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum BrickCodec {
    None = 0,
    Deflate = 1,
    Zstd = 2,
}

impl Default for BrickCodec {
    fn default() -> Self {
        BrickCodec::Zstd
    }
}

impl BrickCodec {
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            BrickCodec::None => Ok(data.to_vec()),
            BrickCodec::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
                encoder
                    .write_all(data)
                    .and_then(|_| encoder.finish())
                    .map_err(|e| Error::Compression(e.to_string()))
            }
            BrickCodec::Zstd => {
                zstd::encode_all(data, 0).map_err(|e| Error::Compression(e.to_string()))
            }
        }
    }

    pub fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        let out = match self {
            BrickCodec::None => data.to_vec(),
            BrickCodec::Deflate => {
                let mut decoder = DeflateDecoder::new(Vec::with_capacity(expected_len));
                decoder
                    .write_all(data)
                    .and_then(|_| decoder.finish())
                    .map_err(|e| Error::Decompression(e.to_string()))?
            }
            BrickCodec::Zstd => {
                zstd::decode_all(data).map_err(|e| Error::Decompression(e.to_string()))?
            }
        };
        if out.len() != expected_len {
            return Err(Error::Decompression(format!(
                "expected {} bytes, got {}",
                expected_len,
                out.len()
            )));
        }
        Ok(out)
    }
}
