//! Compression codec registry.
//!
//! # Identity rules
//! Every algorithm has a frozen `u16` wire id written into each block
//! header (`compressalgo` key). Ids are permanent; a deprecated algorithm
//! keeps its id forever and readers MUST reject unknown ids rather than
//! guessing. There is no negotiation.
//!
//! Id 1 (`none`) is also what a compressor worker falls back to when the
//! selected algorithm fails to shrink a block: the original bytes are
//! stored verbatim so that decompression is always well-defined.

use std::io;
use thiserror::Error;

// ── Frozen wire ids ──────────────────────────────────────────────────────────

pub const ALGO_NULL: u16 = 0; // invalid / unset
pub const ALGO_NONE: u16 = 1; // stored verbatim
pub const ALGO_LZ4:  u16 = 2;
pub const ALGO_ZSTD: u16 = 3;
pub const ALGO_LZMA: u16 = 4;

// ── CompressAlgo ─────────────────────────────────────────────────────────────

/// Runtime compression discriminant. Carries the frozen wire id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressAlgo {
    None,
    Lz4,
    Zstd,
    Lzma,
}

impl CompressAlgo {
    /// The id written to block headers. Frozen.
    #[inline]
    pub fn wire_id(self) -> u16 {
        match self {
            CompressAlgo::None => ALGO_NONE,
            CompressAlgo::Lz4 => ALGO_LZ4,
            CompressAlgo::Zstd => ALGO_ZSTD,
            CompressAlgo::Lzma => ALGO_LZMA,
        }
    }

    /// Resolve a wire id found in a block header.
    /// Returns `None` for ids this build does not recognise.
    pub fn from_wire_id(id: u16) -> Option<Self> {
        match id {
            ALGO_NONE => Some(CompressAlgo::None),
            ALGO_LZ4 => Some(CompressAlgo::Lz4),
            ALGO_ZSTD => Some(CompressAlgo::Zstd),
            ALGO_LZMA => Some(CompressAlgo::Lzma),
            _ => None,
        }
    }

    /// Human-readable name (diagnostics only — never parsed back).
    pub fn name(self) -> &'static str {
        match self {
            CompressAlgo::None => "none",
            CompressAlgo::Lz4 => "lz4",
            CompressAlgo::Zstd => "zstd",
            CompressAlgo::Lzma => "lzma",
        }
    }

    /// Parse from a CLI string.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" => Some(CompressAlgo::None),
            "lz4" => Some(CompressAlgo::Lz4),
            "zstd" => Some(CompressAlgo::Zstd),
            "lzma" => Some(CompressAlgo::Lzma),
            _ => None,
        }
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("compression error: {0}")]
    Compression(String),
    #[error("decompression error: {0}")]
    Decompression(String),
    /// A block header names an algorithm id this build cannot supply.
    /// Decoding MUST NOT continue for that block.
    #[error("unknown compression algorithm id {0}")]
    UnknownAlgo(u16),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn algo(&self) -> CompressAlgo;
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError>;
    fn decompress(&self, data: &[u8], realsize: usize) -> Result<Vec<u8>, CodecError>;
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct NoneCodec;
impl Codec for NoneCodec {
    fn algo(&self) -> CompressAlgo { CompressAlgo::None }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
    fn decompress(&self, data: &[u8], _: usize) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
}

pub struct Lz4Codec;
impl Codec for Lz4Codec {
    fn algo(&self) -> CompressAlgo { CompressAlgo::Lz4 }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> {
        Ok(lz4_flex::compress_prepend_size(data))
    }
    fn decompress(&self, data: &[u8], _: usize) -> Result<Vec<u8>, CodecError> {
        lz4_flex::decompress_size_prepended(data)
            .map_err(|e| CodecError::Decompression(e.to_string()))
    }
}

pub struct ZstdCodec;
impl Codec for ZstdCodec {
    fn algo(&self) -> CompressAlgo { CompressAlgo::Zstd }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        zstd::encode_all(data, level).map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress(&self, data: &[u8], _: usize) -> Result<Vec<u8>, CodecError> {
        zstd::decode_all(data).map_err(|e| CodecError::Decompression(e.to_string()))
    }
}

pub struct LzmaCodec;
impl Codec for LzmaCodec {
    fn algo(&self) -> CompressAlgo { CompressAlgo::Lzma }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_compress(&mut std::io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(out)
    }
    fn decompress(&self, data: &[u8], _: usize) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_decompress(&mut std::io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Resolve a wire id to a codec. Fails hard on unknown ids — a reader must
/// never fall back to a different algorithm.
pub fn get_codec_by_id(id: u16) -> Result<Box<dyn Codec>, CodecError> {
    match CompressAlgo::from_wire_id(id) {
        Some(a) => Ok(get_codec(a)),
        None => Err(CodecError::UnknownAlgo(id)),
    }
}

pub fn get_codec(algo: CompressAlgo) -> Box<dyn Codec> {
    match algo {
        CompressAlgo::None => Box::new(NoneCodec),
        CompressAlgo::Lz4 => Box::new(Lz4Codec),
        CompressAlgo::Zstd => Box::new(ZstdCodec),
        CompressAlgo::Lzma => Box::new(LzmaCodec),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn wire_ids_are_frozen() {
        assert_eq!(CompressAlgo::None.wire_id(), 1);
        assert_eq!(CompressAlgo::Lz4.wire_id(), 2);
        assert_eq!(CompressAlgo::Zstd.wire_id(), 3);
        assert_eq!(CompressAlgo::Lzma.wire_id(), 4);
    }

    #[test]
    fn unknown_id_is_rejected() {
        assert!(get_codec_by_id(0x7777).is_err());
    }

    proptest! {
        #[test]
        fn roundtrip_all_algos(data in proptest::collection::vec(any::<u8>(), 0..8192)) {
            for algo in [CompressAlgo::None, CompressAlgo::Lz4, CompressAlgo::Zstd, CompressAlgo::Lzma] {
                let c = get_codec(algo);
                let packed = c.compress(&data, 3).unwrap();
                let unpacked = c.decompress(&packed, data.len()).unwrap();
                prop_assert_eq!(&unpacked, &data);
            }
        }
    }
}
