//! Outer archive ("bundle") reader.
//!
//! Parsing walks four stages in order: header → block table → block
//! decode → directory. The block table is decompressed with the codec
//! named by the header flags, every storage block is decompressed (after
//! the per-block title cipher when active) into one contiguous reassembled
//! stream, and directory entries slice that stream into named sub-streams.
//!
//! Reassembled streams and oversized entries past
//! [`LARGE_STREAM_THRESHOLD`] are backed by delete-on-close temporary
//! files instead of memory; downstream readers only ever see a seekable
//! [`ByteSource`].

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

use tracing::debug;

use crate::cipher::{ArchiveCipher, CipherError, TitleConfig, CIPHER_SECTION_LEN};
use crate::codec::{self, CompressionKind, CustomCodec, COMPRESSION_KIND_MASK};
use crate::error::{Error, Result};
use crate::reader::{Endian, EndianReader};
use crate::version::EngineVersion;

// ── Constants ────────────────────────────────────────────────────────────────

pub const SIGNATURE_CURRENT: &str = "UnityFS";
pub const SIGNATURE_WEB: &str = "UnityWeb";
pub const SIGNATURE_RAW: &str = "UnityRaw";
pub const SIGNATURE_ARCHIVE: &str = "UnityArchive";

/// Archive header flag bits past the 6-bit compression kind.
pub const FLAG_BLOCKS_COMBINED: u32 = 0x40;
pub const FLAG_BLOCKS_AT_END: u32 = 0x80;
pub const FLAG_LEGACY_WEB_COMPAT: u32 = 0x100;
pub const FLAG_PADDING: u32 = 0x200;
pub const FLAG_CIPHER: u32 = 0x400;

/// Storage-block flag bits: low 6 bits compression kind, bit 6 streamed.
pub const BLOCK_FLAG_STREAMED: u16 = 0x40;

/// Buffers at or above this size are materialized to a delete-on-close
/// temporary file instead of memory.
pub const LARGE_STREAM_THRESHOLD: u64 = 256 * 1024 * 1024;

// ── ByteSource ───────────────────────────────────────────────────────────────

/// Seekable byte stream backed by memory or by a temporary file that the
/// OS deletes when the handle drops. Transparent to readers.
pub enum ByteSource {
    Memory(Cursor<Vec<u8>>),
    Temp(File),
}

impl ByteSource {
    pub fn from_vec(data: Vec<u8>) -> Self {
        ByteSource::Memory(Cursor::new(data))
    }

    pub fn len(&mut self) -> io::Result<u64> {
        match self {
            ByteSource::Memory(c) => Ok(c.get_ref().len() as u64),
            ByteSource::Temp(f) => {
                let pos = f.stream_position()?;
                let len = f.seek(SeekFrom::End(0))?;
                f.seek(SeekFrom::Start(pos))?;
                Ok(len)
            }
        }
    }

    pub fn is_empty(&mut self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Rewind and read the full contents.
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        self.seek(SeekFrom::Start(0))?;
        let mut out = Vec::new();
        self.read_to_end(&mut out)?;
        Ok(out)
    }
}

impl Read for ByteSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ByteSource::Memory(c) => c.read(buf),
            ByteSource::Temp(f) => f.read(buf),
        }
    }
}

impl Seek for ByteSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            ByteSource::Memory(c) => c.seek(pos),
            ByteSource::Temp(f) => f.seek(pos),
        }
    }
}

/// Write-side counterpart used while reassembling the block stream.
enum StreamSink {
    Memory(Vec<u8>),
    Temp(File),
}

impl StreamSink {
    fn for_size(total: u64) -> io::Result<Self> {
        if total >= LARGE_STREAM_THRESHOLD {
            Ok(StreamSink::Temp(tempfile::tempfile()?))
        } else {
            Ok(StreamSink::Memory(Vec::with_capacity(total as usize)))
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            StreamSink::Memory(v) => {
                v.extend_from_slice(data);
                Ok(())
            }
            StreamSink::Temp(f) => f.write_all(data),
        }
    }

    fn into_source(self) -> io::Result<ByteSource> {
        match self {
            StreamSink::Memory(v) => Ok(ByteSource::from_vec(v)),
            StreamSink::Temp(mut f) => {
                f.seek(SeekFrom::Start(0))?;
                Ok(ByteSource::Temp(f))
            }
        }
    }
}

// ── On-disk structures ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ArchiveHeader {
    pub signature: String,
    pub version: u32,
    /// Minimum engine version string (e.g. `5.x.x`).
    pub engine_version: String,
    /// Concrete engine revision string (e.g. `2019.4.31f1`).
    pub engine_revision: String,
    /// Declared total archive size.
    pub size: u64,
    pub compressed_table_size: u32,
    pub uncompressed_table_size: u32,
    pub flags: u32,
}

impl ArchiveHeader {
    pub fn compression(&self) -> Result<CompressionKind> {
        Ok(CompressionKind::from_bits((self.flags & COMPRESSION_KIND_MASK) as u8)?)
    }

    pub fn blocks_at_end(&self) -> bool {
        self.flags & FLAG_BLOCKS_AT_END != 0
    }

    pub fn blocks_combined(&self) -> bool {
        self.flags & FLAG_BLOCKS_COMBINED != 0
    }

    pub fn engine(&self) -> EngineVersion {
        EngineVersion::parse(&self.engine_revision)
    }

    /// Which flag bit gates the title stream cipher depends on the engine
    /// revision: older releases reused the padding bit.
    pub fn cipher_flag_set(&self) -> bool {
        if self.engine().uses_dedicated_cipher_flag() {
            self.flags & FLAG_CIPHER != 0
        } else {
            self.flags & FLAG_PADDING != 0
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StorageBlock {
    pub uncompressed_size: u32,
    pub compressed_size: u32,
    pub flags: u16,
}

impl StorageBlock {
    pub fn compression(&self) -> Result<CompressionKind> {
        Ok(CompressionKind::from_bits((self.flags as u32 & COMPRESSION_KIND_MASK) as u8)?)
    }

    pub fn is_streamed(&self) -> bool {
        self.flags & BLOCK_FLAG_STREAMED != 0
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub offset: i64,
    pub size: i64,
    pub flags: u32,
    pub path: String,
}

// ── Signature sniffing ───────────────────────────────────────────────────────

/// Recognize a NUL-terminated archive signature at the start of `data`.
pub fn sniff_signature(data: &[u8]) -> Option<&'static str> {
    for sig in [SIGNATURE_CURRENT, SIGNATURE_WEB, SIGNATURE_RAW, SIGNATURE_ARCHIVE] {
        let bytes = sig.as_bytes();
        if data.len() > bytes.len()
            && data.starts_with(bytes)
            && data[bytes.len()] == 0
        {
            return Some(sig);
        }
    }
    None
}

// ── Bundle reader ────────────────────────────────────────────────────────────

pub struct BundleFile {
    pub header: ArchiveHeader,
    pub entries: Vec<DirectoryEntry>,
    stream: ByteSource,
}

impl BundleFile {
    /// Parse a complete archive. `name` is used for diagnostics only; the
    /// title transform (if any) must already have been applied to the
    /// bytes behind `source`.
    pub fn read<R: Read + Seek>(source: R, name: &str, config: &TitleConfig) -> Result<Self> {
        let mut r = EndianReader::new(source, Endian::Big);

        let mut signature = r.read_cstring()?;
        match signature.as_str() {
            SIGNATURE_CURRENT | SIGNATURE_WEB | SIGNATURE_RAW => {}
            SIGNATURE_ARCHIVE => return Err(Error::UnsupportedSignature(signature)),
            _ if config.rewrites_signature => {
                // The active title rewrites the signature; retry as the
                // canonical current family.
                debug!(container = name, found = %signature, "treating rewritten signature as canonical");
                signature = SIGNATURE_CURRENT.to_owned();
            }
            _ => return Err(Error::UnsupportedSignature(signature)),
        }

        let version = r.read_u32()?;
        let engine_version = r.read_cstring()?;
        let engine_revision = r.read_cstring()?;
        let header = ArchiveHeader {
            signature,
            version,
            engine_version,
            engine_revision,
            size: 0,
            compressed_table_size: 0,
            uncompressed_table_size: 0,
            flags: 0,
        };

        if header.signature == SIGNATURE_CURRENT {
            Self::read_current(r, header, name, config)
        } else {
            Self::read_legacy(r, header, name)
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Slice one directory entry out of the reassembled stream. Entries at
    /// or above [`LARGE_STREAM_THRESHOLD`] land in a temporary file.
    pub fn read_entry(&mut self, index: usize) -> Result<ByteSource> {
        let entry = self
            .entries
            .get(index)
            .cloned()
            .ok_or_else(|| {
                Error::corrupt(
                    "entry",
                    format!("index {index} out of range for {} entries", self.entries.len()),
                )
            })?;
        self.stream.seek(SeekFrom::Start(entry.offset as u64))?;
        if entry.size as u64 >= LARGE_STREAM_THRESHOLD {
            let mut file = tempfile::tempfile()?;
            let copied = io::copy(&mut (&mut self.stream).take(entry.size as u64), &mut file)?;
            if copied != entry.size as u64 {
                return Err(Error::corrupt(
                    &entry.path,
                    format!("entry truncated: {copied} of {} bytes", entry.size),
                ));
            }
            file.seek(SeekFrom::Start(0))?;
            Ok(ByteSource::Temp(file))
        } else {
            let mut buf = vec![0u8; entry.size as usize];
            self.stream.read_exact(&mut buf)?;
            Ok(ByteSource::from_vec(buf))
        }
    }

    // ── Current family ───────────────────────────────────────────────────────

    fn read_current<R: Read + Seek>(
        mut r: EndianReader<R>,
        mut header: ArchiveHeader,
        name: &str,
        config: &TitleConfig,
    ) -> Result<Self> {
        header.size = r.read_i64()? as u64;
        header.compressed_table_size = r.read_u32()?;
        header.uncompressed_table_size = r.read_u32()?;
        header.flags = r.read_u32()?;

        let stream_len = r.stream_len()?;
        if header.size > stream_len {
            return Err(Error::corrupt(
                name,
                format!("declared size {} exceeds stream length {stream_len}", header.size),
            ));
        }
        if header.compressed_table_size == 0 || header.uncompressed_table_size == 0 {
            return Err(Error::corrupt(name, "empty block table".to_owned()));
        }

        // Title stream cipher. On engines predating the dedicated flag bit
        // the padding bit gates it, so the bit alone is ambiguous there: a
        // configured key disambiguates.
        let dedicated = header.engine().uses_dedicated_cipher_flag();
        let mut cipher = None;
        if header.cipher_flag_set() && (dedicated || config.archive_key.is_some()) {
            let key = config
                .archive_key
                .ok_or(CipherError::MissingKey("archive-cipher"))?;
            let section: [u8; CIPHER_SECTION_LEN] = r.read_exact_array()?;
            cipher = Some(ArchiveCipher::new(&section, &key)?);
        }

        if header.version >= 7 {
            r.align(16)?;
        } else if header.flags & FLAG_PADDING != 0 && dedicated {
            r.align(16)?;
        }

        // HeaderParsed → BlockTableParsed
        let mut table = if header.blocks_at_end() {
            let pos = r.position()?;
            let table_at = header
                .size
                .checked_sub(header.compressed_table_size as u64)
                .ok_or_else(|| {
                    Error::corrupt(
                        name,
                        format!(
                            "block table size {} exceeds archive size {}",
                            header.compressed_table_size, header.size
                        ),
                    )
                })?;
            r.seek_to(table_at)?;
            let t = r.read_bytes(header.compressed_table_size as usize)?;
            r.seek_to(pos)?;
            t
        } else {
            r.read_bytes(header.compressed_table_size as usize)?
        };
        if let Some(c) = &cipher {
            c.decrypt_block_table(&mut table);
        }
        let table = codec::decompress(
            header.compression()?,
            config.custom_codec,
            &table,
            header.uncompressed_table_size as usize,
        )?;
        let (blocks, entries) = parse_block_table(&table, name)?;

        // BlockTableParsed → BlocksDecoded
        let stream = decode_blocks(&mut r, &blocks, cipher.as_ref(), config.custom_codec)?;

        // BlocksDecoded → DirectoryParsed
        let total: u64 = blocks.iter().map(|b| b.uncompressed_size as u64).sum();
        validate_entries(&entries, total, name)?;

        debug!(
            container = name,
            blocks = blocks.len(),
            entries = entries.len(),
            "archive decoded"
        );
        Ok(Self { header, entries, stream })
    }

    // ── Legacy family ────────────────────────────────────────────────────────

    /// Legacy archives have no block table or flags; one block covering
    /// the rest of the stream is synthesized (LZMA-compressed for the web
    /// family, stored for raw).
    fn read_legacy<R: Read + Seek>(
        mut r: EndianReader<R>,
        mut header: ArchiveHeader,
        name: &str,
    ) -> Result<Self> {
        let _minimum_streamed_bytes = r.read_u32()?;
        let header_size = r.read_u32()?;
        let _levels_before_streaming = r.read_u32()?;
        let level_count = r.read_i32()?;
        if level_count < 0 {
            return Err(Error::corrupt(name, format!("negative level count {level_count}")));
        }
        // Per-level sizes are download hints; the payload is decoded whole.
        for _ in 0..level_count {
            let _compressed = r.read_u32()?;
            let _uncompressed = r.read_u32()?;
        }
        if header.version >= 2 {
            header.size = r.read_u32()? as u64;
        }
        if header.version >= 3 {
            let _file_info_header_size = r.read_u32()?;
        }
        let stream_len = r.stream_len()?;
        if header.size == 0 {
            header.size = stream_len;
        }
        if header.size > stream_len || (header_size as u64) > stream_len {
            return Err(Error::corrupt(
                name,
                format!("declared size {} exceeds stream length {stream_len}", header.size),
            ));
        }

        r.seek_to(header_size as u64)?;
        let mut payload = Vec::new();
        r.read_to_end(&mut payload)?;

        let uncompressed = if header.signature == SIGNATURE_WEB {
            // Legacy LZMA payloads carry the standard 13-byte header.
            let mut out = Vec::new();
            lzma_rs::lzma_decompress(&mut Cursor::new(&payload), &mut out).map_err(|e| {
                codec::CodecError::Decompression { codec: "lzma", reason: format!("{e:?}") }
            })?;
            out
        } else {
            payload
        };

        let mut dr = EndianReader::new(Cursor::new(&uncompressed), Endian::Big);
        let count = dr.read_i32()?;
        if count < 0 {
            return Err(Error::corrupt(name, format!("negative entry count {count}")));
        }
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let path = dr.read_cstring()?;
            let offset = dr.read_u32()? as i64;
            let size = dr.read_u32()? as i64;
            entries.push(DirectoryEntry { offset, size, flags: 0, path });
        }
        validate_entries(&entries, uncompressed.len() as u64, name)?;

        debug!(container = name, entries = entries.len(), "legacy archive decoded");
        Ok(Self { header, entries, stream: ByteSource::from_vec(uncompressed) })
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn parse_block_table(
    table: &[u8],
    name: &str,
) -> Result<(Vec<StorageBlock>, Vec<DirectoryEntry>)> {
    let mut r = EndianReader::new(Cursor::new(table), Endian::Big);

    let _uncompressed_data_hash: [u8; 16] = r.read_exact_array()?;

    let block_count = r.read_i32()?;
    if block_count < 0 || block_count as usize > table.len() {
        return Err(Error::corrupt(name, format!("implausible block count {block_count}")));
    }
    let mut blocks = Vec::with_capacity(block_count as usize);
    for _ in 0..block_count {
        blocks.push(StorageBlock {
            uncompressed_size: r.read_u32()?,
            compressed_size: r.read_u32()?,
            flags: r.read_u16()?,
        });
    }

    let entry_count = r.read_i32()?;
    if entry_count < 0 || entry_count as usize > table.len() {
        return Err(Error::corrupt(name, format!("implausible entry count {entry_count}")));
    }
    let mut entries = Vec::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        let offset = r.read_i64()?;
        let size = r.read_i64()?;
        let flags = r.read_u32()?;
        let path = r.read_cstring()?;
        entries.push(DirectoryEntry { offset, size, flags, path });
    }
    Ok((blocks, entries))
}

/// Decompress every storage block, in declared order, into one contiguous
/// seekable stream. The sum of uncompressed sizes defines its exact length.
fn decode_blocks<R: Read + Seek>(
    r: &mut EndianReader<R>,
    blocks: &[StorageBlock],
    cipher: Option<&ArchiveCipher>,
    custom: CustomCodec,
) -> Result<ByteSource> {
    let total: u64 = blocks.iter().map(|b| b.uncompressed_size as u64).sum();
    let mut sink = StreamSink::for_size(total)?;
    for (index, block) in blocks.iter().enumerate() {
        let mut data = r.read_bytes(block.compressed_size as usize)?;
        if let Some(c) = cipher {
            c.decrypt_block(index as u64, &mut data);
        }
        let out = codec::decompress(
            block.compression()?,
            custom,
            &data,
            block.uncompressed_size as usize,
        )?;
        sink.write_all(&out)?;
    }
    Ok(sink.into_source()?)
}

fn validate_entries(entries: &[DirectoryEntry], total: u64, name: &str) -> Result<()> {
    for entry in entries {
        if entry.offset < 0
            || entry.size < 0
            || (entry.offset as u64).saturating_add(entry.size as u64) > total
        {
            return Err(Error::corrupt(
                name,
                format!(
                    "entry {:?} range {}..{} exceeds block stream length {total}",
                    entry.path,
                    entry.offset,
                    entry.offset.saturating_add(entry.size)
                ),
            ));
        }
    }
    Ok(())
}
