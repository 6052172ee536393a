//! Version gates.
//!
//! Two version spaces drive parsing branches:
//!
//! - [`FormatVersion`] — the serialized-file format revision (a small
//!   integer with ~20 historical cutovers, each toggling exactly one
//!   structural change). Every cutover gets a named predicate here so the
//!   gates are enumerable and testable away from the parsing code.
//! - [`EngineVersion`] — the `major.minor.patch` (+ build) tuple parsed
//!   from the engine-version string, used by the few gates that depend on
//!   the engine release rather than the file format revision.

use std::fmt;

// ── Serialized-file format revision ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FormatVersion(pub u32);

impl FormatVersion {
    /// Revisions this crate knows how to parse.
    pub fn is_supported(self) -> bool {
        (3..=22).contains(&self.0)
    }

    /// Pre-9 files store the metadata block (endianness byte first) at
    /// `file_size - metadata_size` instead of right after the header.
    pub fn metadata_at_end(self) -> bool {
        self.0 < 9
    }

    /// 22+: 64-bit file size / data offset in a second header block.
    pub fn has_large_files(self) -> bool {
        self.0 >= 22
    }

    /// 7+: engine-version string precedes the metadata tables.
    pub fn has_engine_version(self) -> bool {
        self.0 >= 7
    }

    /// 8+: target-platform enum present.
    pub fn has_target_platform(self) -> bool {
        self.0 >= 8
    }

    /// 13+: explicit "type trees enabled" byte.
    pub fn has_type_tree_flag(self) -> bool {
        self.0 >= 13
    }

    /// 16+: per-type stripped flag; object `type_id` indexes the type table
    /// directly instead of matching on class id.
    pub fn has_refactored_class_ids(self) -> bool {
        self.0 >= 16
    }

    /// 17+: per-type script index.
    pub fn type_has_script_index(self) -> bool {
        self.0 >= 17
    }

    /// 13+: 16-byte script id / old-type hash per type.
    pub fn has_type_hashes(self) -> bool {
        self.0 >= 13
    }

    /// Blob-encoded type trees (flat records + string buffer).
    pub fn uses_blob_tree(self) -> bool {
        self.0 == 10 || self.0 >= 12
    }

    /// 19+: blob nodes carry a trailing u64 ref-type hash.
    pub fn node_has_ref_hash(self) -> bool {
        self.0 >= 19
    }

    /// 21+: type entries list their type dependencies.
    pub fn stores_type_dependencies(self) -> bool {
        self.0 >= 21
    }

    /// 7–13: explicit big-id flag selecting 64-bit path ids.
    pub fn has_big_id_flag(self) -> bool {
        self.0 >= 7 && self.0 < 14
    }

    /// 14+: path ids are 64-bit and 4-byte aligned.
    pub fn wide_path_ids(self) -> bool {
        self.0 >= 14
    }

    /// 11+: script-type table present.
    pub fn has_script_table(self) -> bool {
        self.0 >= 11
    }

    /// Pre-11 objects carry a destroyed flag.
    pub fn object_has_destroyed_flag(self) -> bool {
        self.0 < 11
    }

    /// 11–16 objects carry a script-type index.
    pub fn object_has_script_index(self) -> bool {
        self.0 >= 11 && self.0 < 17
    }

    /// Exactly 15 and 16 carry a per-object stripped byte.
    pub fn object_has_stripped_byte(self) -> bool {
        self.0 == 15 || self.0 == 16
    }

    /// 6+: external references start with a legacy empty string.
    pub fn externals_have_blank_prefix(self) -> bool {
        self.0 >= 6
    }

    /// 5+: external references carry a GUID and type.
    pub fn externals_have_guid(self) -> bool {
        self.0 >= 5
    }

    /// 20+: trailing ref-type table.
    pub fn has_ref_types(self) -> bool {
        self.0 >= 20
    }

    /// 5+: trailing user-information string.
    pub fn has_user_information(self) -> bool {
        self.0 >= 5
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Engine version tuple ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct EngineVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub build: u32,
}

impl EngineVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch, build: 0 }
    }

    /// Parse an engine-version string such as `2019.4.31f1` or `5.6.0p3`.
    /// Non-digit separators split the numeric runs; missing components are
    /// zero. Never fails — an empty or garbage string yields 0.0.0.0.
    pub fn parse(s: &str) -> Self {
        let mut parts = [0u32; 4];
        let mut idx = 0;
        let mut current: Option<u32> = None;
        for ch in s.chars() {
            if let Some(d) = ch.to_digit(10) {
                current = Some(current.unwrap_or(0).saturating_mul(10).saturating_add(d));
            } else if let Some(v) = current.take() {
                if idx < 4 {
                    parts[idx] = v;
                    idx += 1;
                } else {
                    break;
                }
            }
        }
        if let Some(v) = current {
            if idx < 4 {
                parts[idx] = v;
            }
        }
        Self { major: parts[0], minor: parts[1], patch: parts[2], build: parts[3] }
    }

    fn at_least(self, major: u32, minor: u32, patch: u32) -> bool {
        (self.major, self.minor, self.patch) >= (major, minor, patch)
    }

    /// Archive header flag bit gating the title stream cipher. Older
    /// releases reused the padding bit; later ones moved the cipher to a
    /// dedicated bit so both could coexist.
    pub fn uses_dedicated_cipher_flag(self) -> bool {
        if self.major >= 2023 {
            return true;
        }
        match self.major {
            2022 => self.at_least(2022, 1, 1),
            2021 => self.at_least(2021, 3, 2),
            2020 => self.at_least(2020, 3, 34),
            _ => false,
        }
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_release_strings() {
        assert_eq!(
            EngineVersion::parse("2019.4.31f1"),
            EngineVersion { major: 2019, minor: 4, patch: 31, build: 1 }
        );
        assert_eq!(EngineVersion::parse("5.6.0p3").patch, 0);
        assert_eq!(EngineVersion::parse(""), EngineVersion::default());
    }

    #[test]
    fn cipher_flag_cutovers() {
        assert!(!EngineVersion::new(2020, 3, 33).uses_dedicated_cipher_flag());
        assert!(EngineVersion::new(2020, 3, 34).uses_dedicated_cipher_flag());
        assert!(!EngineVersion::new(2021, 3, 1).uses_dedicated_cipher_flag());
        assert!(EngineVersion::new(2023, 1, 0).uses_dedicated_cipher_flag());
    }

    #[test]
    fn format_gates_are_exclusive_where_documented() {
        assert!(FormatVersion(10).uses_blob_tree());
        assert!(!FormatVersion(11).uses_blob_tree());
        assert!(FormatVersion(12).uses_blob_tree());
        assert!(FormatVersion(15).object_has_stripped_byte());
        assert!(!FormatVersion(17).object_has_stripped_byte());
        assert!(FormatVersion(13).has_big_id_flag());
        assert!(!FormatVersion(14).has_big_id_flag());
    }
}
