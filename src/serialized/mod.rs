//! Serialized-file ("metadata container") reader.
//!
//! A serialized file holds a table of typed object records, an optional
//! self-describing type tree per type, and an external-reference table
//! naming the files its object pointers may cross into. Field presence
//! and integer widths vary across ~20 format revisions; every gate lives
//! behind a named [`FormatVersion`] predicate rather than an inline
//! numeric comparison.

use std::collections::HashMap;
use std::io::{Read, Seek};

use tracing::debug;

use crate::bundle::ByteSource;
use crate::error::{Error, Result};
use crate::reader::{Endian, EndianReader};
use crate::typetree::TypeTree;
use crate::version::{EngineVersion, FormatVersion};

/// Class id of script-backed objects, which carry a script id hash.
pub const SCRIPT_CLASS_ID: i32 = 114;

// ── Format sniffing ──────────────────────────────────────────────────────────

/// Cheap structural check used by the loader to tell serialized files from
/// opaque resources. `prefix` is the first bytes of the stream (64 are
/// enough for every revision), `total_len` the physical stream length.
pub fn is_serialized_file(prefix: &[u8], total_len: u64) -> bool {
    if prefix.len() < 20 {
        return false;
    }
    let be_u32 = |at: usize| u32::from_be_bytes(prefix[at..at + 4].try_into().unwrap());
    let version = be_u32(8);
    if version == 0 || version > 100 {
        return false;
    }
    let (file_size, data_offset) = if FormatVersion(version).has_large_files() {
        if prefix.len() < 48 {
            return false;
        }
        let file_size = i64::from_be_bytes(prefix[24..32].try_into().unwrap());
        let data_offset = i64::from_be_bytes(prefix[32..40].try_into().unwrap());
        if file_size < 0 || data_offset < 0 {
            return false;
        }
        (file_size as u64, data_offset as u64)
    } else {
        (be_u32(4) as u64, be_u32(12) as u64)
    };
    file_size == total_len && data_offset <= file_size
}

// ── Data model ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MetadataHeader {
    pub metadata_size: u32,
    pub file_size: u64,
    pub version: FormatVersion,
    pub data_offset: u64,
    pub endian: Endian,
}

/// One entry of the per-file type table; built once when the container is
/// opened, one instance per distinct type.
#[derive(Debug, Clone)]
pub struct SerializedType {
    pub class_id: i32,
    pub is_stripped: bool,
    pub script_type_index: i16,
    pub script_id: [u8; 16],
    pub old_type_hash: [u8; 16],
    pub tree: Option<TypeTree>,
    pub type_dependencies: Vec<i32>,
    /// Ref-types only: fully qualified source name.
    pub reference_name: Option<(String, String, String)>,
}

impl SerializedType {
    pub fn type_hash_hex(&self) -> String {
        hex::encode(self.old_type_hash)
    }
}

/// Directory entry for one object: where its bytes live and which type
/// decodes them. The decoded value itself is produced lazily.
#[derive(Debug, Clone)]
pub struct ObjectRecord {
    pub path_id: i64,
    /// Absolute offset within the file (already rebased by `data_offset`).
    pub byte_start: u64,
    pub byte_size: u32,
    pub class_id: i32,
    pub type_index: Option<usize>,
    pub script_type_index: i16,
    pub is_destroyed: bool,
    pub stripped: bool,
}

#[derive(Debug, Clone)]
pub struct ScriptRef {
    pub file_index: i32,
    pub path_id: i64,
}

/// Identifies a serialized file this one depends on.
#[derive(Debug, Clone)]
pub struct ExternalFileReference {
    pub guid: [u8; 16],
    pub ref_type: i32,
    pub path: String,
    /// Final path component, the key used for working-set lookup.
    pub file_name: String,
}

impl ExternalFileReference {
    pub fn guid_hex(&self) -> String {
        hex::encode(self.guid)
    }
}

// ── SerializedFile ───────────────────────────────────────────────────────────

pub struct SerializedFile {
    pub name: String,
    pub header: MetadataHeader,
    pub engine_version_str: String,
    pub engine_version: EngineVersion,
    pub target_platform: i32,
    pub has_type_trees: bool,
    pub big_id_enabled: bool,
    pub types: Vec<SerializedType>,
    pub objects: Vec<ObjectRecord>,
    pub scripts: Vec<ScriptRef>,
    pub externals: Vec<ExternalFileReference>,
    pub ref_types: Vec<SerializedType>,
    pub user_information: String,
    objects_by_id: HashMap<i64, usize>,
    data: ByteSource,
}

impl SerializedFile {
    pub fn read(source: ByteSource, name: String) -> Result<Self> {
        let mut r = EndianReader::new(source, Endian::Big);

        // Header (always big-endian).
        let mut metadata_size = r.read_u32()?;
        let mut file_size = r.read_u32()? as u64;
        let raw_version = r.read_u32()?;
        let version = FormatVersion(raw_version);
        if !version.is_supported() {
            return Err(Error::UnsupportedVersion(raw_version));
        }
        let mut data_offset = r.read_u32()? as u64;

        let mut endian = Endian::Big;
        if !version.metadata_at_end() {
            endian = Endian::from_flag(r.read_u8()?);
            let _reserved = r.read_bytes(3)?;
        }
        if version.has_large_files() {
            metadata_size = r.read_u32()?;
            file_size = r.read_i64()? as u64;
            data_offset = r.read_i64()? as u64;
            let _reserved = r.read_i64()?;
        }

        let stream_len = r.stream_len()?;
        if file_size > stream_len {
            return Err(Error::corrupt(
                &name,
                format!("declared file size {file_size} exceeds stream length {stream_len}"),
            ));
        }
        if data_offset > file_size || metadata_size as u64 > file_size {
            return Err(Error::corrupt(
                &name,
                format!(
                    "metadata ({metadata_size}) / data ({data_offset}) sections exceed file size {file_size}"
                ),
            ));
        }

        if version.metadata_at_end() {
            r.seek_to(file_size - metadata_size as u64)?;
            endian = Endian::from_flag(r.read_u8()?);
        }
        r.set_endian(endian);

        let header =
            MetadataHeader { metadata_size, file_size, version, data_offset, endian };

        // Metadata tables, in strict order.
        let engine_version_str =
            if version.has_engine_version() { r.read_cstring()? } else { String::new() };
        let engine_version = EngineVersion::parse(&engine_version_str);
        let target_platform =
            if version.has_target_platform() { r.read_i32()? } else { 0 };
        let has_type_trees =
            if version.has_type_tree_flag() { r.read_bool()? } else { true };

        let type_count = r.read_i32()?;
        if type_count < 0 {
            return Err(Error::corrupt(&name, format!("negative type count {type_count}")));
        }
        let mut types = Vec::with_capacity(type_count as usize);
        for _ in 0..type_count {
            types.push(read_serialized_type(&mut r, version, has_type_trees, false, &name)?);
        }

        let big_id_enabled = version.has_big_id_flag() && r.read_i32()? != 0;

        let object_count = r.read_i32()?;
        if object_count < 0 {
            return Err(Error::corrupt(&name, format!("negative object count {object_count}")));
        }
        let mut objects = Vec::with_capacity(object_count as usize);
        let mut objects_by_id = HashMap::with_capacity(object_count as usize);
        for _ in 0..object_count {
            let record =
                read_object_record(&mut r, version, big_id_enabled, data_offset, &types, &name)?;
            if record.byte_start.saturating_add(record.byte_size as u64) > file_size {
                return Err(Error::corrupt(
                    &name,
                    format!(
                        "object {} range {}..{} exceeds file size {file_size}",
                        record.path_id,
                        record.byte_start,
                        record.byte_start + record.byte_size as u64
                    ),
                ));
            }
            objects_by_id.insert(record.path_id, objects.len());
            objects.push(record);
        }

        let mut scripts = Vec::new();
        if version.has_script_table() {
            let count = r.read_i32()?;
            if count < 0 {
                return Err(Error::corrupt(&name, format!("negative script count {count}")));
            }
            for _ in 0..count {
                let file_index = r.read_i32()?;
                let path_id = if version.wide_path_ids() {
                    r.align(4)?;
                    r.read_i64()?
                } else {
                    r.read_i32()? as i64
                };
                scripts.push(ScriptRef { file_index, path_id });
            }
        }

        let external_count = r.read_i32()?;
        if external_count < 0 {
            return Err(Error::corrupt(&name, format!("negative external count {external_count}")));
        }
        let mut externals = Vec::with_capacity(external_count as usize);
        for _ in 0..external_count {
            if version.externals_have_blank_prefix() {
                let _legacy_empty = r.read_cstring()?;
            }
            let mut guid = [0u8; 16];
            let mut ref_type = 0;
            if version.externals_have_guid() {
                guid = r.read_exact_array()?;
                ref_type = r.read_i32()?;
            }
            let path = r.read_cstring()?;
            let file_name = path
                .replace('\\', "/")
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_owned();
            externals.push(ExternalFileReference { guid, ref_type, path, file_name });
        }

        let mut ref_types = Vec::new();
        if version.has_ref_types() {
            let count = r.read_i32()?;
            if count < 0 {
                return Err(Error::corrupt(&name, format!("negative ref-type count {count}")));
            }
            for _ in 0..count {
                ref_types.push(read_serialized_type(&mut r, version, has_type_trees, true, &name)?);
            }
        }

        let user_information =
            if version.has_user_information() { r.read_cstring()? } else { String::new() };

        debug!(
            container = %name,
            format = raw_version,
            types = types.len(),
            objects = objects.len(),
            externals = externals.len(),
            "serialized file parsed"
        );

        Ok(Self {
            name,
            header,
            engine_version_str,
            engine_version,
            target_platform,
            has_type_trees,
            big_id_enabled,
            types,
            objects,
            scripts,
            externals,
            ref_types,
            user_information,
            objects_by_id,
            data: r.into_inner(),
        })
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn has_object(&self, path_id: i64) -> bool {
        self.objects_by_id.contains_key(&path_id)
    }

    pub fn object_by_path_id(&self, path_id: i64) -> Option<&ObjectRecord> {
        self.objects_by_id.get(&path_id).map(|&i| &self.objects[i])
    }

    /// The type tree decoding an object, when the file carries one.
    pub fn type_tree_for(&self, record: &ObjectRecord) -> Option<&TypeTree> {
        record
            .type_index
            .and_then(|i| self.types.get(i))
            .and_then(|t| t.tree.as_ref())
    }

    /// Raw byte range of one object. Bounds were validated at parse time;
    /// the decode step additionally confines itself to this slice.
    pub fn object_data(&mut self, record: &ObjectRecord) -> Result<Vec<u8>> {
        let mut r = EndianReader::new(&mut self.data, self.header.endian);
        r.seek_to(record.byte_start)?;
        Ok(r.read_bytes(record.byte_size as usize)?)
    }

    pub fn endian(&self) -> Endian {
        self.header.endian
    }
}

// ── Table readers ────────────────────────────────────────────────────────────

fn read_serialized_type<R: Read + Seek>(
    r: &mut EndianReader<R>,
    version: FormatVersion,
    type_trees_enabled: bool,
    is_ref_type: bool,
    container: &str,
) -> Result<SerializedType> {
    let class_id = r.read_i32()?;
    let is_stripped = if version.has_refactored_class_ids() { r.read_bool()? } else { false };
    let script_type_index =
        if version.type_has_script_index() { r.read_i16()? } else { -1 };

    let mut script_id = [0u8; 16];
    let mut old_type_hash = [0u8; 16];
    if version.has_type_hashes() {
        let scripted = if is_ref_type {
            script_type_index >= 0
        } else if version.has_refactored_class_ids() {
            class_id == SCRIPT_CLASS_ID
        } else {
            class_id < 0
        };
        if scripted {
            script_id = r.read_exact_array()?;
        }
        old_type_hash = r.read_exact_array()?;
    }

    let mut tree = None;
    let mut type_dependencies = Vec::new();
    let mut reference_name = None;
    if type_trees_enabled {
        tree = Some(if version.uses_blob_tree() {
            TypeTree::read_blob(r, version, container)?
        } else {
            TypeTree::read_inline(r, version, container)?
        });
        if version.stores_type_dependencies() {
            if is_ref_type {
                let class_name = r.read_cstring()?;
                let namespace = r.read_cstring()?;
                let assembly = r.read_cstring()?;
                reference_name = Some((class_name, namespace, assembly));
            } else {
                let count = r.read_i32()?;
                if count < 0 {
                    return Err(Error::corrupt(
                        container,
                        format!("negative dependency count {count}"),
                    ));
                }
                for _ in 0..count {
                    type_dependencies.push(r.read_i32()?);
                }
            }
        }
    }

    Ok(SerializedType {
        class_id,
        is_stripped,
        script_type_index,
        script_id,
        old_type_hash,
        tree,
        type_dependencies,
        reference_name,
    })
}

fn read_object_record<R: Read + Seek>(
    r: &mut EndianReader<R>,
    version: FormatVersion,
    big_id_enabled: bool,
    data_offset: u64,
    types: &[SerializedType],
    container: &str,
) -> Result<ObjectRecord> {
    let path_id = if big_id_enabled {
        r.read_i64()?
    } else if !version.wide_path_ids() {
        r.read_i32()? as i64
    } else {
        r.align(4)?;
        r.read_i64()?
    };

    let byte_start = if version.has_large_files() {
        r.read_i64()? as u64
    } else {
        r.read_u32()? as u64
    } + data_offset;
    let byte_size = r.read_u32()?;
    let type_id = r.read_i32()?;

    let (class_id, type_index) = if version.has_refactored_class_ids() {
        let index = type_id as usize;
        let ty = types.get(index).ok_or_else(|| {
            Error::corrupt(container, format!("object type index {type_id} out of range"))
        })?;
        (ty.class_id, Some(index))
    } else {
        // Legacy class id word; the type table is matched by class id and
        // may legitimately have no entry.
        let _legacy_class_id = r.read_u16()?;
        (type_id, types.iter().position(|t| t.class_id == type_id))
    };

    let is_destroyed = if version.object_has_destroyed_flag() { r.read_u16()? != 0 } else { false };
    let script_type_index =
        if version.object_has_script_index() { r.read_i16()? } else { -1 };
    let stripped = if version.object_has_stripped_byte() { r.read_bool()? } else { false };

    Ok(ObjectRecord {
        path_id,
        byte_start,
        byte_size,
        class_id,
        type_index,
        script_type_index,
        is_destroyed,
        stripped,
    })
}
