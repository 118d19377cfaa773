//! Compression codec layer (spec.md §4.2).
//!
//! Every block in a block-based SST is compressed independently and
//! tagged with a one-byte [`CompressionTag`]. Some codecs (Snappy,
//! Xpress) embed the uncompressed size in their own framing; for the
//! others, when used inside a format-version-≥-2 block, the *caller*
//! prepends a varint32 uncompressed size ahead of the compressed bytes
//! (see [`crate::block`] for the varint helpers and the table
//! builder/reader for where that prefix is written/consumed).

use std::io::{self, Read, Write};

use thiserror::Error;

/// Errors from compressing or decompressing a block.
#[derive(Debug, Error)]
pub enum CompressionError {
    /// Underlying I/O error from a streaming codec.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The compression tag is recognised but not supported at runtime,
    /// or is not a recognised tag at all.
    #[error("unsupported compression tag {0}")]
    Unsupported(u8),

    /// The compressed payload was corrupt or truncated.
    #[error("corrupt compressed payload: {0}")]
    Corrupt(String),
}

/// Compression tag stored in each block's trailer. Numeric values are
/// fixed by the on-disk format and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionTag {
    /// No compression; block bytes are stored verbatim.
    None = 0,
    /// Snappy (embeds uncompressed size itself).
    Snappy = 1,
    /// Zlib / raw DEFLATE.
    Zlib = 2,
    /// BZip2 — recognised, not supported at runtime.
    BZip2 = 3,
    /// LZ4 block format.
    LZ4 = 4,
    /// LZ4HC — same wire format as LZ4, higher encode effort.
    LZ4HC = 5,
    /// Xpress — recognised, not supported at runtime.
    Xpress = 6,
    /// Zstandard.
    ZSTD = 7,
}

impl CompressionTag {
    /// Decode a raw tag byte, or `None` for an unrecognised value.
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::None),
            1 => Some(Self::Snappy),
            2 => Some(Self::Zlib),
            3 => Some(Self::BZip2),
            4 => Some(Self::LZ4),
            5 => Some(Self::LZ4HC),
            6 => Some(Self::Xpress),
            7 => Some(Self::ZSTD),
            _ => None,
        }
    }

    /// Whether this codec embeds the uncompressed size itself, so a
    /// caller must NOT prepend a varint32 size prefix.
    pub fn embeds_size(self) -> bool {
        matches!(self, Self::None | Self::Snappy | Self::Xpress)
    }
}

/// Compress `bytes` under `tag`. Returns the raw bytes unchanged for
/// `None`. Unsupported tags (`BZip2`, `Xpress`, or any unrecognised byte
/// that slipped through) return [`CompressionError::Unsupported`].
pub fn compress(tag: CompressionTag, bytes: &[u8]) -> Result<Vec<u8>, CompressionError> {
    match tag {
        CompressionTag::None => Ok(bytes.to_vec()),
        CompressionTag::Snappy => {
            let mut encoder = snap::raw::Encoder::new();
            encoder
                .compress_vec(bytes)
                .map_err(|e| CompressionError::Corrupt(e.to_string()))
        }
        CompressionTag::Zlib => {
            let mut encoder =
                flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(bytes)?;
            Ok(encoder.finish()?)
        }
        CompressionTag::LZ4 | CompressionTag::LZ4HC => Ok(lz4_flex::block::compress(bytes)),
        CompressionTag::ZSTD => {
            zstd::stream::encode_all(bytes, 0).map_err(CompressionError::Io)
        }
        CompressionTag::BZip2 | CompressionTag::Xpress => {
            Err(CompressionError::Unsupported(tag as u8))
        }
    }
}

/// Decompress `bytes` that were compressed under `tag`.
///
/// `expected_size` is required for codecs that do not embed their own
/// uncompressed size (everything except Snappy/Xpress); it is ignored
/// for codecs that do. Never panics on garbage input — always returns
/// `Err` instead.
pub fn decompress(
    tag: CompressionTag,
    bytes: &[u8],
    expected_size: Option<usize>,
) -> Result<Vec<u8>, CompressionError> {
    match tag {
        CompressionTag::None => Ok(bytes.to_vec()),
        CompressionTag::Snappy => {
            let mut decoder = snap::raw::Decoder::new();
            decoder
                .decompress_vec(bytes)
                .map_err(|e| CompressionError::Corrupt(e.to_string()))
        }
        CompressionTag::Zlib => decompress_zlib(bytes),
        CompressionTag::LZ4 | CompressionTag::LZ4HC => {
            let size = expected_size
                .ok_or_else(|| CompressionError::Corrupt("missing expected size for LZ4".into()))?;
            lz4_flex::block::decompress(bytes, size)
                .map_err(|e| CompressionError::Corrupt(e.to_string()))
        }
        CompressionTag::ZSTD => {
            let mut out = Vec::new();
            let mut decoder =
                zstd::stream::Decoder::new(bytes).map_err(|e| CompressionError::Corrupt(e.to_string()))?;
            decoder.read_to_end(&mut out)?;
            Ok(out)
        }
        CompressionTag::BZip2 | CompressionTag::Xpress => {
            Err(CompressionError::Unsupported(tag as u8))
        }
    }
}

/// Zlib decompression tries raw DEFLATE first (what this codec's own
/// `compress` emits), then falls back to a zlib-wrapped stream, per
/// spec.md §4.2.
fn decompress_zlib(bytes: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut out = Vec::new();
    let mut raw = flate2::read::DeflateDecoder::new(bytes);
    if raw.read_to_end(&mut out).is_ok() {
        return Ok(out);
    }

    out.clear();
    let mut wrapped = flate2::read::ZlibDecoder::new(bytes);
    wrapped
        .read_to_end(&mut out)
        .map_err(|e| CompressionError::Corrupt(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(tag: CompressionTag) {
        let data = b"the quick brown fox jumps over the lazy dog, repeated. ".repeat(50);
        let compressed = compress(tag, &data).expect("compress");
        let size_hint = if tag.embeds_size() { None } else { Some(data.len()) };
        let decompressed = decompress(tag, &compressed, size_hint).expect("decompress");
        assert_eq!(decompressed, data);
    }

    #[test]
    fn none_roundtrip() {
        roundtrip(CompressionTag::None);
    }

    #[test]
    fn snappy_roundtrip() {
        roundtrip(CompressionTag::Snappy);
    }

    #[test]
    fn zlib_roundtrip() {
        roundtrip(CompressionTag::Zlib);
    }

    #[test]
    fn lz4_roundtrip() {
        roundtrip(CompressionTag::LZ4);
    }

    #[test]
    fn zstd_roundtrip() {
        roundtrip(CompressionTag::ZSTD);
    }

    #[test]
    fn unsupported_tags_error_both_ways() {
        assert!(matches!(
            compress(CompressionTag::BZip2, b"x"),
            Err(CompressionError::Unsupported(_))
        ));
        assert!(matches!(
            decompress(CompressionTag::Xpress, b"x", Some(1)),
            Err(CompressionError::Unsupported(_))
        ));
    }

    #[test]
    fn garbage_input_never_panics() {
        let garbage = [0xFFu8; 37];
        for tag in [
            CompressionTag::Snappy,
            CompressionTag::Zlib,
            CompressionTag::ZSTD,
        ] {
            let _ = decompress(tag, &garbage, Some(1024));
        }
        let _ = decompress(CompressionTag::LZ4, &garbage, Some(1024));
    }

    #[test]
    fn from_u8_rejects_unknown_tags() {
        assert!(CompressionTag::from_u8(200).is_none());
        assert_eq!(CompressionTag::from_u8(7), Some(CompressionTag::ZSTD));
    }
}
