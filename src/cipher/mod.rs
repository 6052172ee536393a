//! Title-specific stream transforms.
//!
//! Several titles obfuscate or encrypt their archives before the standard
//! container header. Each characterized transform lives behind one entry in
//! a lookup table keyed by [`TitleVariant`] — adding a title means
//! registering one entry, never touching the container parser.
//!
//! # Transform contract
//! A transform either recognizes its expected input shape and returns the
//! corrected bytes, or returns `None` leaving the input untouched. Callers
//! always restart signature checks from offset zero, so transforms never
//! leak position state.
//!
//! A transform invoked against data shaped for a *different* title is a
//! caller configuration error, reported as [`CipherError::WrongVariant`]
//! rather than corruption. No fallback chain is attempted after a failed
//! title decrypt.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use thiserror::Error;

use crate::codec::CustomCodec;

/// Canonical current-family signature, including its terminating NUL.
pub const CANONICAL_SIGNATURE: &[u8; 8] = b"UnityFS\0";

/// Transforms that locate an embedded signature scan at most this many
/// bytes from the start of the stream.
pub const SIGNATURE_SCAN_LIMIT: usize = 8192;

#[derive(Error, Debug)]
pub enum CipherError {
    /// The configured title's transform was applied to data shaped for a
    /// different title. Configuration error, not corruption.
    #[error("wrong title variant: {variant} did not match the input ({detail})")]
    WrongVariant { variant: &'static str, detail: String },
    #[error("title variant {0} requires a 16-byte key but none was configured")]
    MissingKey(&'static str),
}

// ── Variant identifiers & per-title configuration ────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TitleVariant {
    /// No pre-transform; canonical archives.
    None,
    /// Junk prefix before the real signature; scan and strip.
    ShiftedSignature,
    /// Fixed-length junk run spliced in right after the signature.
    SplicedHeader,
    /// Header bytes beyond the signature XOR-masked with a constant.
    MaskedHeader,
    /// Whole stream RC4-encrypted under a key derived from the file name.
    NameKeystream,
}

impl TitleVariant {
    pub fn name(self) -> &'static str {
        match self {
            TitleVariant::None => "none",
            TitleVariant::ShiftedSignature => "shifted-signature",
            TitleVariant::SplicedHeader => "spliced-header",
            TitleVariant::MaskedHeader => "masked-header",
            TitleVariant::NameKeystream => "name-keystream",
        }
    }
}

/// Everything the decode pipeline needs to know about the active title.
#[derive(Debug, Clone)]
pub struct TitleConfig {
    pub variant: TitleVariant,
    /// AES-128 key for the in-archive block cipher, when the title uses it.
    pub archive_key: Option<[u8; 16]>,
    /// Meaning of compression kind 5 for this title.
    pub custom_codec: CustomCodec,
    /// Titles known to rewrite the archive signature: unrecognized
    /// signatures are retried as the canonical family.
    pub rewrites_signature: bool,
}

impl Default for TitleConfig {
    fn default() -> Self {
        Self {
            variant: TitleVariant::None,
            archive_key: None,
            custom_codec: CustomCodec::Zstd,
            rewrites_signature: false,
        }
    }
}

// ── Transform registry ───────────────────────────────────────────────────────

pub trait StreamTransform: Sync {
    fn variant(&self) -> TitleVariant;

    /// Apply the transform if `data` matches this title's shape.
    /// `Some(bytes)` is the corrected stream from offset zero; `None`
    /// means the input did not match and is unchanged.
    fn apply(&self, data: &[u8], file_name: &str) -> Option<Vec<u8>>;
}

static REGISTRY: &[&dyn StreamTransform] = &[
    &ShiftedSignature,
    &SplicedHeader,
    &MaskedHeader,
    &NameKeystream,
];

/// Table lookup for the configured variant. `TitleVariant::None` has no
/// transform by definition.
pub fn transform_for(variant: TitleVariant) -> Option<&'static dyn StreamTransform> {
    REGISTRY.iter().copied().find(|t| t.variant() == variant)
}

/// Run the configured title transform over `data`, if any.
pub fn apply_title_transform(
    config: &TitleConfig,
    data: &[u8],
    file_name: &str,
) -> Option<Vec<u8>> {
    transform_for(config.variant).and_then(|t| t.apply(data, file_name))
}

// ── Concrete transforms ──────────────────────────────────────────────────────

/// Junk bytes prepended before the canonical signature. The signature is
/// not self-describing from offset zero; a bounded linear scan locates it.
pub struct ShiftedSignature;

impl StreamTransform for ShiftedSignature {
    fn variant(&self) -> TitleVariant {
        TitleVariant::ShiftedSignature
    }

    fn apply(&self, data: &[u8], _file_name: &str) -> Option<Vec<u8>> {
        if data.starts_with(CANONICAL_SIGNATURE) {
            return None;
        }
        let window = &data[..data.len().min(SIGNATURE_SCAN_LIMIT)];
        window
            .windows(CANONICAL_SIGNATURE.len())
            .position(|w| w == CANONICAL_SIGNATURE)
            .map(|at| data[at..].to_vec())
    }
}

/// A fixed-length junk run spliced in immediately after the signature,
/// displacing the version word and everything behind it.
pub struct SplicedHeader;

/// Length of the spliced junk run (per-title constant).
const SPLICE_LEN: usize = 0x28;

impl SplicedHeader {
    fn version_plausible(bytes: &[u8]) -> bool {
        if bytes.len() < 4 {
            return false;
        }
        let v = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        (1..=0xff).contains(&v)
    }
}

impl StreamTransform for SplicedHeader {
    fn variant(&self) -> TitleVariant {
        TitleVariant::SplicedHeader
    }

    fn apply(&self, data: &[u8], _file_name: &str) -> Option<Vec<u8>> {
        let sig_len = CANONICAL_SIGNATURE.len();
        if !data.starts_with(CANONICAL_SIGNATURE) || data.len() < sig_len + SPLICE_LEN + 4 {
            return None;
        }
        // Already canonical if the version word directly follows the
        // signature; spliced if it only becomes plausible past the junk.
        if Self::version_plausible(&data[sig_len..]) {
            return None;
        }
        if !Self::version_plausible(&data[sig_len + SPLICE_LEN..]) {
            return None;
        }
        let mut out = Vec::with_capacity(data.len() - SPLICE_LEN);
        out.extend_from_slice(&data[..sig_len]);
        out.extend_from_slice(&data[sig_len + SPLICE_LEN..]);
        Some(out)
    }
}

/// Header bytes beyond the signature XOR-masked with a one-byte constant.
pub struct MaskedHeader;

/// XOR constant and masked region length (per-title constants).
const HEADER_MASK: u8 = 0x8b;
const MASKED_REGION: usize = 0x30;

impl StreamTransform for MaskedHeader {
    fn variant(&self) -> TitleVariant {
        TitleVariant::MaskedHeader
    }

    fn apply(&self, data: &[u8], _file_name: &str) -> Option<Vec<u8>> {
        let sig_len = CANONICAL_SIGNATURE.len();
        if !data.starts_with(CANONICAL_SIGNATURE) || data.len() < sig_len + 4 {
            return None;
        }
        if SplicedHeader::version_plausible(&data[sig_len..]) {
            return None;
        }
        let mut out = data.to_vec();
        let end = (sig_len + MASKED_REGION).min(out.len());
        for b in &mut out[sig_len..end] {
            *b ^= HEADER_MASK;
        }
        if SplicedHeader::version_plausible(&out[sig_len..]) {
            Some(out)
        } else {
            None
        }
    }
}

/// Whole stream RC4-encrypted; the key is the lowercased file name.
pub struct NameKeystream;

impl StreamTransform for NameKeystream {
    fn variant(&self) -> TitleVariant {
        TitleVariant::NameKeystream
    }

    fn apply(&self, data: &[u8], file_name: &str) -> Option<Vec<u8>> {
        if data.starts_with(CANONICAL_SIGNATURE) || file_name.is_empty() {
            return None;
        }
        let key: Vec<u8> = file_name.to_lowercase().into_bytes();
        // Probe with the first signature-length bytes before paying for
        // the full stream.
        let mut rc4 = Rc4::new(&key);
        let probe_len = CANONICAL_SIGNATURE.len().min(data.len());
        let mut probe = data[..probe_len].to_vec();
        rc4.apply(&mut probe);
        if probe != CANONICAL_SIGNATURE[..probe_len] {
            return None;
        }
        let mut out = data.to_vec();
        Rc4::new(&key).apply(&mut out);
        Some(out)
    }
}

/// Plain RC4 (KSA + PRGA). Used as a keystream generator only.
struct Rc4 {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    fn new(key: &[u8]) -> Self {
        let mut s = [0u8; 256];
        for (i, v) in s.iter_mut().enumerate() {
            *v = i as u8;
        }
        let mut j = 0u8;
        for i in 0..256 {
            j = j
                .wrapping_add(s[i])
                .wrapping_add(key[i % key.len().max(1)]);
            s.swap(i, j as usize);
        }
        Self { s, i: 0, j: 0 }
    }

    fn apply(&mut self, data: &mut [u8]) {
        for b in data {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.s[self.i as usize]);
            self.s.swap(self.i as usize, self.j as usize);
            let k = self.s
                [(self.s[self.i as usize].wrapping_add(self.s[self.j as usize])) as usize];
            *b ^= k;
        }
    }
}

// ── In-archive block cipher ──────────────────────────────────────────────────

/// Decrypted cipher-section signature proving the title key is right.
pub const CIPHER_SIGNATURE: &[u8; 16] = b"@bundle.cipher1!";

/// On-disk size of the cipher section following the archive header.
pub const CIPHER_SECTION_LEN: usize = 32;

/// Sentinel block index used for the block table itself.
pub const BLOCK_TABLE_INDEX: u64 = u64::MAX;

/// Per-archive block cipher, active when the archive header sets the title
/// stream-cipher flag. The section after the header holds the encrypted
/// cipher signature and a per-archive session seed, both AES-128-ECB under
/// the per-title key; blocks are then XORed with an AES-CTR keystream keyed
/// by block index under the session key.
pub struct ArchiveCipher {
    session: Aes128,
}

impl ArchiveCipher {
    pub fn new(section: &[u8; CIPHER_SECTION_LEN], title_key: &[u8; 16]) -> Result<Self, CipherError> {
        let title_cipher = Aes128::new(GenericArray::from_slice(title_key));

        let mut sig = GenericArray::clone_from_slice(&section[..16]);
        title_cipher.decrypt_block(&mut sig);
        if sig.as_slice() != CIPHER_SIGNATURE {
            return Err(CipherError::WrongVariant {
                variant: "archive-cipher",
                detail: format!("cipher signature check failed ({})", hex::encode(sig)),
            });
        }

        let mut seed = GenericArray::clone_from_slice(&section[16..32]);
        title_cipher.decrypt_block(&mut seed);
        Ok(Self { session: Aes128::new(&seed) })
    }

    /// XOR `data` in place with the keystream for `block_index`.
    /// Encrypt and decrypt are the same operation.
    pub fn decrypt_block(&self, block_index: u64, data: &mut [u8]) {
        let mut counter = 0u64;
        let mut offset = 0usize;
        while offset < data.len() {
            let mut ks = [0u8; 16];
            ks[..8].copy_from_slice(&block_index.to_le_bytes());
            ks[8..].copy_from_slice(&counter.to_le_bytes());
            let mut block = GenericArray::from(ks);
            self.session.encrypt_block(&mut block);
            for (b, k) in data[offset..].iter_mut().zip(block.iter()) {
                *b ^= k;
            }
            offset += 16;
            counter += 1;
        }
    }

    /// The block table uses a reserved index so its keystream never
    /// collides with a payload block.
    pub fn decrypt_block_table(&self, data: &mut [u8]) {
        self.decrypt_block(BLOCK_TABLE_INDEX, data);
    }
}
