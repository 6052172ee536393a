//! Block-compression dispatch.
//!
//! Archive headers and storage blocks carry a 6-bit compression kind in
//! their flag words. The kind is resolved once into a [`CompressionKind`]
//! and dispatched through [`decompress`]; an id with no implemented handler
//! fails hard with [`CodecError::Unsupported`] naming the offending value —
//! decoding MUST NOT continue past an unknown codec.
//!
//! Kind 5 is title-dependent: current archive families assign it to zstd,
//! while a few titles ship an obfuscated LZ4 variant under the same id.
//! The active meaning comes from the caller's title configuration.

use std::io::Cursor;
use thiserror::Error;

/// Mask selecting the compression kind inside archive/block flag words.
pub const COMPRESSION_KIND_MASK: u32 = 0x3f;

#[derive(Error, Debug)]
pub enum CodecError {
    /// Compression kind with no implemented handler. Fatal for the
    /// affected container.
    #[error("unsupported compression kind {0} — cannot decode without it")]
    Unsupported(u8),
    #[error("decompression error ({codec}): {reason}")]
    Decompression { codec: &'static str, reason: String },
    /// Output length disagreed with the size declared in the block table.
    #[error("decompressed {actual} bytes, block table declared {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

// ── Kind resolution ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionKind {
    None,
    Lzma,
    Lz4,
    Lz4Hc,
    Lzham,
    /// Kind 5 — resolved against the title's [`CustomCodec`].
    Custom,
}

impl CompressionKind {
    /// Resolve the low 6 bits of a flag word.
    pub fn from_bits(bits: u8) -> Result<Self, CodecError> {
        match bits {
            0 => Ok(CompressionKind::None),
            1 => Ok(CompressionKind::Lzma),
            2 => Ok(CompressionKind::Lz4),
            3 => Ok(CompressionKind::Lz4Hc),
            4 => Ok(CompressionKind::Lzham),
            5 => Ok(CompressionKind::Custom),
            other => Err(CodecError::Unsupported(other)),
        }
    }

    /// Diagnostic name (never parsed).
    pub fn name(self) -> &'static str {
        match self {
            CompressionKind::None => "none",
            CompressionKind::Lzma => "lzma",
            CompressionKind::Lz4 => "lz4",
            CompressionKind::Lz4Hc => "lz4hc",
            CompressionKind::Lzham => "lzham",
            CompressionKind::Custom => "custom",
        }
    }
}

/// Title-dependent meaning of compression kind 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomCodec {
    /// Current archive families: plain zstd.
    Zstd,
    /// Title variant: LZ4 whose first bytes are XOR-masked before
    /// compression; the mask is a reverse-engineered per-title constant.
    ObfuscatedLz4 { mask: [u8; 16] },
}

impl Default for CustomCodec {
    fn default() -> Self {
        CustomCodec::Zstd
    }
}

// ── Decompression dispatch ───────────────────────────────────────────────────

/// Decompress one block. `expected` is the uncompressed size declared by
/// the block table; every codec output is checked against it.
pub fn decompress(
    kind: CompressionKind,
    custom: CustomCodec,
    data: &[u8],
    expected: usize,
) -> Result<Vec<u8>, CodecError> {
    let out = match kind {
        CompressionKind::None => data.to_vec(),
        CompressionKind::Lzma => decompress_lzma(data, expected)?,
        CompressionKind::Lz4 | CompressionKind::Lz4Hc => decompress_lz4(data, expected)?,
        CompressionKind::Lzham => return Err(CodecError::Unsupported(4)),
        CompressionKind::Custom => match custom {
            CustomCodec::Zstd => zstd::decode_all(data).map_err(|e| {
                CodecError::Decompression { codec: "zstd", reason: e.to_string() }
            })?,
            CustomCodec::ObfuscatedLz4 { mask } => {
                let mut masked = data.to_vec();
                for (b, m) in masked.iter_mut().zip(mask.iter()) {
                    *b ^= m;
                }
                decompress_lz4(&masked, expected)?
            }
        },
    };
    if out.len() != expected {
        return Err(CodecError::LengthMismatch { expected, actual: out.len() });
    }
    Ok(out)
}

/// Archive LZMA payloads are 5 props bytes followed by the raw stream —
/// no embedded unpacked-size field, so the size is supplied out of band.
fn decompress_lzma(data: &[u8], expected: usize) -> Result<Vec<u8>, CodecError> {
    let options = lzma_rs::decompress::Options {
        unpacked_size: lzma_rs::decompress::UnpackedSize::UseProvided(Some(expected as u64)),
        memlimit: None,
        allow_incomplete: false,
    };
    let mut out = Vec::with_capacity(expected);
    lzma_rs::lzma_decompress_with_options(&mut Cursor::new(data), &mut out, &options)
        .map_err(|e| CodecError::Decompression { codec: "lzma", reason: format!("{e:?}") })?;
    Ok(out)
}

fn decompress_lz4(data: &[u8], expected: usize) -> Result<Vec<u8>, CodecError> {
    lz4_flex::block::decompress(data, expected)
        .map_err(|e| CodecError::Decompression { codec: "lz4", reason: e.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_kind_is_a_named_error() {
        match CompressionKind::from_bits(63) {
            Err(CodecError::Unsupported(63)) => {}
            other => panic!("expected Unsupported(63), got {other:?}"),
        }
    }

    #[test]
    fn lz4_roundtrip_with_declared_size() {
        let plain = b"the quick brown fox jumps over the lazy dog".repeat(8);
        let packed = lz4_flex::block::compress(&plain);
        let out =
            decompress(CompressionKind::Lz4, CustomCodec::Zstd, &packed, plain.len()).unwrap();
        assert_eq!(out, plain);
    }

    #[test]
    fn declared_size_mismatch_is_rejected() {
        let plain = b"0123456789abcdef".to_vec();
        let err = decompress(CompressionKind::None, CustomCodec::Zstd, &plain, 20).unwrap_err();
        assert!(matches!(err, CodecError::LengthMismatch { expected: 20, actual: 16 }));
    }

    #[test]
    fn obfuscated_lz4_unmasks_before_decompressing() {
        let plain = b"masked block payload, masked block payload".to_vec();
        let mask = [0x5au8; 16];
        let mut packed = lz4_flex::block::compress(&plain);
        for (b, m) in packed.iter_mut().zip(mask.iter()) {
            *b ^= m;
        }
        let out = decompress(
            CompressionKind::Custom,
            CustomCodec::ObfuscatedLz4 { mask },
            &packed,
            plain.len(),
        )
        .unwrap();
        assert_eq!(out, plain);
    }
}
