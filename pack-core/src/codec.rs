//! Codec seam: the core never compresses by itself, it asks a `Codec`.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::archive::CompressionMethod;

/// Block codec consumed by the archive reader (decompress) and the packaging side (compress).
pub trait Codec: Send + Sync {
    fn compress(&self, method: CompressionMethod, input: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Decompress `input`; the result must be exactly `original_size` bytes.
    fn decompress(
        &self,
        method: CompressionMethod,
        input: &[u8],
        original_size: usize,
    ) -> Result<Vec<u8>, CodecError>;
}

/// Registry-crate backed codec: `lz4_flex` block format for the LZ4 tags, raw deflate for RFC1951.
/// LZ4 and LZ4HC share a block format, so both tags decode the same way.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCodec;

impl Codec for DefaultCodec {
    fn compress(&self, method: CompressionMethod, input: &[u8]) -> Result<Vec<u8>, CodecError> {
        match method {
            CompressionMethod::None => Ok(input.to_vec()),
            CompressionMethod::Lz4 | CompressionMethod::Lz4Hc => Ok(lz4_flex::block::compress(input)),
            CompressionMethod::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
                encoder.write_all(input)?;
                Ok(encoder.finish()?)
            }
        }
    }

    fn decompress(
        &self,
        method: CompressionMethod,
        input: &[u8],
        original_size: usize,
    ) -> Result<Vec<u8>, CodecError> {
        let out = match method {
            CompressionMethod::None => input.to_vec(),
            CompressionMethod::Lz4 | CompressionMethod::Lz4Hc => {
                lz4_flex::block::decompress(input, original_size)
                    .map_err(|e| CodecError::Corrupt(e.to_string()))?
            }
            CompressionMethod::Deflate => {
                // One byte past the declared size is enough to detect an overrun.
                let mut out = Vec::with_capacity(original_size);
                DeflateDecoder::new(input)
                    .take(original_size as u64 + 1)
                    .read_to_end(&mut out)?;
                out
            }
        };
        if out.len() != original_size {
            return Err(CodecError::SizeMismatch {
                expected: original_size,
                actual: out.len(),
            });
        }
        Ok(out)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("corrupt compressed data: {0}")]
    Corrupt(String),
    #[error("decoded {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("codec io: {0}")]
    Io(#[from] std::io::Error),
}
