//! Fixture builders shared by the integration tests: hand-assembled
//! archives and serialized files small enough to reason about byte by
//! byte.

#![allow(dead_code)]

use std::collections::HashMap;

use byteorder::{BigEndian, LittleEndian, WriteBytesExt};

// ── Type tree blobs ──────────────────────────────────────────────────────────

pub struct BlobNode {
    pub level: u8,
    pub type_flags: u8,
    pub type_name: String,
    pub name: String,
    pub byte_size: i32,
    pub meta_flag: i32,
}

pub fn blob_node(
    level: u8,
    type_flags: u8,
    type_name: &str,
    name: &str,
    byte_size: i32,
    meta_flag: i32,
) -> BlobNode {
    BlobNode {
        level,
        type_flags,
        type_name: type_name.to_owned(),
        name: name.to_owned(),
        byte_size,
        meta_flag,
    }
}

fn intern(s: &str, buffer: &mut Vec<u8>, seen: &mut HashMap<String, u32>) -> u32 {
    if let Some(&off) = seen.get(s) {
        return off;
    }
    let off = buffer.len() as u32;
    buffer.extend_from_slice(s.as_bytes());
    buffer.push(0);
    seen.insert(s.to_owned(), off);
    off
}

/// Little-endian blob encoding of a type tree, local string buffer only
/// (no common-table references). Matches serialized format 17 (no ref
/// hashes).
pub fn encode_blob_tree(nodes: &[BlobNode]) -> Vec<u8> {
    let mut buffer = Vec::new();
    let mut seen = HashMap::new();
    let mut records = Vec::new();
    for node in nodes {
        let type_off = intern(&node.type_name, &mut buffer, &mut seen);
        let name_off = intern(&node.name, &mut buffer, &mut seen);
        records.push((node, type_off, name_off));
    }

    let mut out = Vec::new();
    out.write_i32::<LittleEndian>(nodes.len() as i32).unwrap();
    out.write_i32::<LittleEndian>(buffer.len() as i32).unwrap();
    for (node, type_off, name_off) in records {
        out.write_u16::<LittleEndian>(1).unwrap();
        out.push(node.level);
        out.push(node.type_flags);
        out.write_u32::<LittleEndian>(type_off).unwrap();
        out.write_u32::<LittleEndian>(name_off).unwrap();
        out.write_i32::<LittleEndian>(node.byte_size).unwrap();
        out.write_i32::<LittleEndian>(0).unwrap();
        out.write_i32::<LittleEndian>(node.meta_flag).unwrap();
    }
    out.extend_from_slice(&buffer);
    out
}

/// TextAsset schema: a name string and a body string.
pub fn text_asset_nodes() -> Vec<BlobNode> {
    vec![
        blob_node(0, 0, "TextAsset", "Base", -1, 0),
        blob_node(1, 0, "string", "m_Name", -1, 0),
        blob_node(2, 1, "Array", "Array", -1, 0),
        blob_node(3, 0, "int", "size", 4, 0),
        blob_node(3, 0, "char", "data", 1, 0),
        blob_node(1, 0, "string", "m_Script", -1, 0),
        blob_node(2, 1, "Array", "Array", -1, 0),
        blob_node(3, 0, "int", "size", 4, 0),
        blob_node(3, 0, "char", "data", 1, 0),
    ]
}

/// Object bytes matching [`text_asset_nodes`], little-endian.
pub fn text_asset_bytes(name: &str, script: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for s in [name, script] {
        out.write_i32::<LittleEndian>(s.len() as i32).unwrap();
        out.extend_from_slice(s.as_bytes());
        while out.len() % 4 != 0 {
            out.push(0);
        }
    }
    out
}

// ── Serialized files ─────────────────────────────────────────────────────────

/// Build a format-17 little-endian serialized file holding TextAsset
/// objects with the given path ids and bodies, plus an external-reference
/// table.
pub fn build_serialized_file(objects: &[(i64, Vec<u8>)], externals: &[&str]) -> Vec<u8> {
    // Header patched at the end; endian flag 0 selects little-endian
    // metadata and object data.
    let mut buf = vec![0u8; 16];
    buf.push(0);
    buf.extend_from_slice(&[0, 0, 0]);

    buf.extend_from_slice(b"2019.4.31f1\0");
    buf.write_i32::<LittleEndian>(19).unwrap(); // target platform
    buf.push(1); // type trees present

    buf.write_i32::<LittleEndian>(1).unwrap(); // type count
    buf.write_i32::<LittleEndian>(49).unwrap(); // TextAsset class id
    buf.push(0); // not stripped
    buf.write_i16::<LittleEndian>(-1).unwrap(); // no script type
    buf.extend_from_slice(&[0u8; 16]); // old type hash
    buf.extend_from_slice(&encode_blob_tree(&text_asset_nodes()));

    buf.write_i32::<LittleEndian>(objects.len() as i32).unwrap();
    let mut data_section: Vec<u8> = Vec::new();
    for (path_id, data) in objects {
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
        buf.write_i64::<LittleEndian>(*path_id).unwrap();
        buf.write_u32::<LittleEndian>(data_section.len() as u32).unwrap();
        buf.write_u32::<LittleEndian>(data.len() as u32).unwrap();
        buf.write_i32::<LittleEndian>(0).unwrap(); // type table index
        data_section.extend_from_slice(data);
        while data_section.len() % 8 != 0 {
            data_section.push(0);
        }
    }

    buf.write_i32::<LittleEndian>(0).unwrap(); // script table

    buf.write_i32::<LittleEndian>(externals.len() as i32).unwrap();
    for path in externals {
        buf.push(0); // legacy empty string
        buf.extend_from_slice(&[0u8; 16]); // guid
        buf.write_i32::<LittleEndian>(0).unwrap(); // type
        buf.extend_from_slice(path.as_bytes());
        buf.push(0);
    }

    buf.push(0); // user information

    let metadata_size = (buf.len() - 16) as u32;
    while buf.len() % 16 != 0 {
        buf.push(0);
    }
    let data_offset = buf.len() as u32;
    buf.extend_from_slice(&data_section);
    let file_size = buf.len() as u32;

    buf[0..4].copy_from_slice(&metadata_size.to_be_bytes());
    buf[4..8].copy_from_slice(&file_size.to_be_bytes());
    buf[8..12].copy_from_slice(&17u32.to_be_bytes());
    buf[12..16].copy_from_slice(&data_offset.to_be_bytes());
    buf
}

/// Same content as [`build_serialized_file`] but in format 13: narrow
/// 32-bit path ids, an explicit big-id flag word, legacy class-id
/// matching (object type_id is the class id, plus a trailing u16 class
/// id and i16 script index per object).
pub fn build_serialized_file_v13(objects: &[(i32, Vec<u8>)], externals: &[&str]) -> Vec<u8> {
    let mut buf = vec![0u8; 16];
    buf.push(0); // little-endian
    buf.extend_from_slice(&[0, 0, 0]);

    buf.extend_from_slice(b"5.6.0f3\0");
    buf.write_i32::<LittleEndian>(19).unwrap();
    buf.push(1); // type trees present

    buf.write_i32::<LittleEndian>(1).unwrap();
    buf.write_i32::<LittleEndian>(49).unwrap(); // TextAsset class id
    buf.extend_from_slice(&[0u8; 16]); // old type hash
    buf.extend_from_slice(&encode_blob_tree(&text_asset_nodes()));

    buf.write_i32::<LittleEndian>(0).unwrap(); // big-id flag off

    buf.write_i32::<LittleEndian>(objects.len() as i32).unwrap();
    let mut data_section: Vec<u8> = Vec::new();
    for (path_id, data) in objects {
        buf.write_i32::<LittleEndian>(*path_id).unwrap();
        buf.write_u32::<LittleEndian>(data_section.len() as u32).unwrap();
        buf.write_u32::<LittleEndian>(data.len() as u32).unwrap();
        buf.write_i32::<LittleEndian>(49).unwrap(); // type id == class id
        buf.write_u16::<LittleEndian>(49).unwrap(); // legacy class id
        buf.write_i16::<LittleEndian>(-1).unwrap(); // script index
        data_section.extend_from_slice(data);
        while data_section.len() % 8 != 0 {
            data_section.push(0);
        }
    }

    buf.write_i32::<LittleEndian>(0).unwrap(); // script table

    buf.write_i32::<LittleEndian>(externals.len() as i32).unwrap();
    for path in externals {
        buf.push(0);
        buf.extend_from_slice(&[0u8; 16]);
        buf.write_i32::<LittleEndian>(0).unwrap();
        buf.extend_from_slice(path.as_bytes());
        buf.push(0);
    }

    buf.push(0); // user information

    let metadata_size = (buf.len() - 16) as u32;
    while buf.len() % 16 != 0 {
        buf.push(0);
    }
    let data_offset = buf.len() as u32;
    buf.extend_from_slice(&data_section);
    let file_size = buf.len() as u32;

    buf[0..4].copy_from_slice(&metadata_size.to_be_bytes());
    buf[4..8].copy_from_slice(&file_size.to_be_bytes());
    buf[8..12].copy_from_slice(&13u32.to_be_bytes());
    buf[12..16].copy_from_slice(&data_offset.to_be_bytes());
    buf
}

// ── Archives ─────────────────────────────────────────────────────────────────

/// Current-family archive with one LZ4 storage block holding all entries.
pub fn build_bundle(entries: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut payload = Vec::new();
    let mut dir = Vec::new();
    for (path, data) in entries {
        dir.push((path.to_string(), payload.len() as i64, data.len() as i64));
        payload.extend_from_slice(data);
    }
    let packed_payload = lz4_flex::block::compress(&payload);

    let mut table = Vec::new();
    table.extend_from_slice(&[0u8; 16]);
    table.write_i32::<BigEndian>(1).unwrap();
    table.write_u32::<BigEndian>(payload.len() as u32).unwrap();
    table.write_u32::<BigEndian>(packed_payload.len() as u32).unwrap();
    table.write_u16::<BigEndian>(2).unwrap(); // lz4 block
    table.write_i32::<BigEndian>(dir.len() as i32).unwrap();
    for (path, offset, size) in &dir {
        table.write_i64::<BigEndian>(*offset).unwrap();
        table.write_i64::<BigEndian>(*size).unwrap();
        table.write_u32::<BigEndian>(4).unwrap();
        table.extend_from_slice(path.as_bytes());
        table.push(0);
    }
    let packed_table = lz4_flex::block::compress(&table);

    let mut out = Vec::new();
    out.extend_from_slice(b"UnityFS\0");
    out.write_u32::<BigEndian>(6).unwrap();
    out.extend_from_slice(b"5.x.x\0");
    out.extend_from_slice(b"2019.4.31f1\0");
    let header_len = out.len() + 8 + 4 + 4 + 4;
    let total = header_len + packed_table.len() + packed_payload.len();
    out.write_i64::<BigEndian>(total as i64).unwrap();
    out.write_u32::<BigEndian>(packed_table.len() as u32).unwrap();
    out.write_u32::<BigEndian>(table.len() as u32).unwrap();
    out.write_u32::<BigEndian>(2 | 0x40).unwrap(); // lz4 table, combined
    out.extend_from_slice(&packed_table);
    out.extend_from_slice(&packed_payload);
    out
}
