//! Type schema engine ("type tree").
//!
//! A type tree is a flattened sequence of nodes ordered depth-first, each
//! carrying a nesting level. A node's children are exactly the contiguous
//! run of following nodes one level deeper, terminated by the first node
//! at the same or a shallower level.
//!
//! Two on-disk encodings exist: the older inline form (recursive descent,
//! strings embedded per node) and the newer blob form (flat fixed-size
//! records followed by a shared string buffer; offsets with the high bit
//! set index the built-in common-string table). Both normalize to the same
//! flattened representation, and every node is classified into a
//! [`NodeKind`] exactly once here so the object decoder never matches on
//! type-name strings.

use std::io::{Read, Seek};

use crate::error::{Error, Result};
use crate::reader::EndianReader;
use crate::version::FormatVersion;

/// Meta-flag bit: realign the stream to 4 bytes after this node's value.
pub const ALIGN_FLAG: u32 = 0x4000;

/// Type-flag bit marking the synthetic `Array` node.
pub const ARRAY_TYPE_FLAG: u8 = 0x01;

/// Recursion guard for the inline encoding.
const MAX_TREE_DEPTH: usize = 512;

// ── Common strings ───────────────────────────────────────────────────────────

/// Built-in shared string table, indexed by byte offset. Blob-encoded
/// nodes reference it with the high offset bit set.
pub const COMMON_STRINGS: &[u8] =
    b"AABB\0AnimationClip\0AnimationCurve\0AnimationState\0Array\0Base\0\
BitField\0bitset\0bool\0char\0ColorRGBA\0Component\0data\0deque\0double\0\
dynamic_array\0FastPropertyName\0first\0float\0Font\0GameObject\0\
Generic Mono\0GradientNEW\0GUID\0GUIStyle\0int\0list\0long long\0map\0\
Matrix4x4\0MdFour\0MonoBehaviour\0MonoScript\0m_ByteSize\0m_Curve\0\
m_EditorClassIdentifier\0m_EditorHideFlags\0m_Enabled\0m_ExtensionPtr\0\
m_GameObject\0m_Index\0m_IsArray\0m_IsStatic\0m_MetaFlag\0m_Name\0\
m_ObjectHideFlags\0m_PrefabInternal\0m_PrefabParentObject\0m_Script\0\
m_StaticEditorFlags\0m_Type\0m_Version\0Object\0pair\0PPtr<Component>\0\
PPtr<GameObject>\0PPtr<Material>\0PPtr<MonoBehaviour>\0PPtr<MonoScript>\0\
PPtr<Object>\0PPtr<Prefab>\0PPtr<Sprite>\0PPtr<TextAsset>\0PPtr<Texture>\0\
PPtr<Texture2D>\0PPtr<Transform>\0Prefab\0Quaternionf\0Rectf\0RectInt\0\
RectOffset\0second\0set\0short\0size\0SInt16\0SInt32\0SInt64\0SInt8\0\
staticvector\0string\0TextAsset\0TextMesh\0Texture\0Texture2D\0Transform\0\
TypelessData\0UInt16\0UInt32\0UInt64\0UInt8\0unsigned int\0\
unsigned long long\0unsigned short\0vector\0Vector2f\0Vector3f\0Vector4f\0\
m_ScriptingClassIdentifier\0Gradient\0Type*\0int2_storage\0int3_storage\0\
BoundsInt\0m_CorrespondingSourceObject\0m_PrefabInstance\0m_PrefabAsset\0\
FileSize\0Hash128\0";

/// Look up a common string by its byte offset into [`COMMON_STRINGS`].
pub fn common_string(offset: u32) -> Option<&'static str> {
    let start = offset as usize;
    if start >= COMMON_STRINGS.len() {
        return None;
    }
    let rest = &COMMON_STRINGS[start..];
    let end = rest.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&rest[..end]).ok()
}

// ── Node classification ──────────────────────────────────────────────────────

/// Decode classification, computed once per node when the tree is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Bool,
    I8,
    U8,
    Char,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    /// Length-prefixed string, 4-aligned after the bytes.
    Str,
    /// Synthetic `Array` node (length prefix + element subtree).
    ArrayHeader,
    /// Node whose first child is an `ArrayHeader`.
    Array,
    /// Array of key/value pairs.
    Map,
    /// Length-prefixed raw byte blob.
    TypelessData,
    /// Nested record decoded field by field.
    Record,
    /// Leaf with an unknown type name; `byte_size` raw bytes.
    Opaque,
}

// ── Nodes and trees ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TypeTreeNode {
    pub version: u16,
    pub level: u8,
    pub type_flags: u8,
    pub type_name: String,
    pub name: String,
    pub byte_size: i32,
    pub index: i32,
    pub meta_flag: i32,
    pub ref_type_hash: u64,
    pub kind: NodeKind,
}

impl Default for TypeTreeNode {
    fn default() -> Self {
        Self {
            version: 1,
            level: 0,
            type_flags: 0,
            type_name: String::new(),
            name: String::new(),
            byte_size: 0,
            index: 0,
            meta_flag: 0,
            ref_type_hash: 0,
            kind: NodeKind::Record,
        }
    }
}

impl TypeTreeNode {
    pub fn requires_align(&self) -> bool {
        self.meta_flag as u32 & ALIGN_FLAG != 0
    }

    pub fn is_array_header(&self) -> bool {
        self.type_flags & ARRAY_TYPE_FLAG != 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct TypeTree {
    pub nodes: Vec<TypeTreeNode>,
}

impl TypeTree {
    /// Direct children of `index`: the contiguous run of following nodes
    /// exactly one level deeper, ending at the subtree boundary.
    pub fn children(&self, index: usize) -> Vec<usize> {
        let level = self.nodes[index].level;
        let mut out = Vec::new();
        for (j, node) in self.nodes.iter().enumerate().skip(index + 1) {
            if node.level <= level {
                break;
            }
            if node.level == level + 1 {
                out.push(j);
            }
        }
        out
    }

    /// Index one past the last node of `index`'s subtree.
    pub fn subtree_end(&self, index: usize) -> usize {
        let level = self.nodes[index].level;
        self.nodes
            .iter()
            .enumerate()
            .skip(index + 1)
            .find(|(_, n)| n.level <= level)
            .map(|(j, _)| j)
            .unwrap_or(self.nodes.len())
    }

    /// Classify nodes of a hand-assembled tree; the readers do this on
    /// their own output.
    #[cfg(test)]
    pub(crate) fn classify(&mut self) {
        classify(&mut self.nodes);
    }

    /// First child of `index`, if any.
    pub fn first_child(&self, index: usize) -> Option<usize> {
        let next = index + 1;
        (next < self.nodes.len() && self.nodes[next].level == self.nodes[index].level + 1)
            .then_some(next)
    }

    // ── Inline encoding ──────────────────────────────────────────────────────

    /// Read the older inline encoding: strings per node, children read
    /// immediately after their parent.
    pub fn read_inline<R: Read + Seek>(
        r: &mut EndianReader<R>,
        format: FormatVersion,
        container: &str,
    ) -> Result<Self> {
        let mut tree = TypeTree::default();
        read_inline_node(r, format, container, &mut tree.nodes, 0)?;
        classify(&mut tree.nodes);
        Ok(tree)
    }

    // ── Blob encoding ────────────────────────────────────────────────────────

    /// Read the blob encoding: a flat array of fixed-size node records
    /// (numeric fields only) followed by a shared string buffer; strings
    /// resolve after all nodes are read.
    pub fn read_blob<R: Read + Seek>(
        r: &mut EndianReader<R>,
        format: FormatVersion,
        container: &str,
    ) -> Result<Self> {
        let node_count = r.read_i32()?;
        let buffer_size = r.read_i32()?;
        if node_count < 0 || buffer_size < 0 {
            return Err(Error::corrupt(
                container,
                format!("implausible type tree shape: {node_count} nodes, {buffer_size} string bytes"),
            ));
        }

        let mut raw = Vec::with_capacity(node_count as usize);
        for _ in 0..node_count {
            let version = r.read_u16()?;
            let level = r.read_u8()?;
            let type_flags = r.read_u8()?;
            let type_offset = r.read_u32()?;
            let name_offset = r.read_u32()?;
            let byte_size = r.read_i32()?;
            let index = r.read_i32()?;
            let meta_flag = r.read_i32()?;
            let ref_type_hash = if format.node_has_ref_hash() { r.read_u64()? } else { 0 };
            raw.push((
                TypeTreeNode {
                    version,
                    level,
                    type_flags,
                    byte_size,
                    index,
                    meta_flag,
                    ref_type_hash,
                    ..TypeTreeNode::default()
                },
                type_offset,
                name_offset,
            ));
        }
        let buffer = r.read_bytes(buffer_size as usize)?;

        let mut tree = TypeTree::default();
        for (mut node, type_offset, name_offset) in raw {
            node.type_name = resolve_string(&buffer, type_offset, container)?;
            node.name = resolve_string(&buffer, name_offset, container)?;
            tree.nodes.push(node);
        }
        classify(&mut tree.nodes);
        Ok(tree)
    }
}

/// Resolve a blob string reference: high bit set selects the built-in
/// common table, otherwise the local buffer.
fn resolve_string(buffer: &[u8], offset: u32, container: &str) -> Result<String> {
    if offset & 0x8000_0000 != 0 {
        let common = offset & 0x7fff_ffff;
        return common_string(common).map(str::to_owned).ok_or_else(|| {
            Error::corrupt(container, format!("common string offset {common} out of range"))
        });
    }
    let start = offset as usize;
    if start > buffer.len() {
        return Err(Error::corrupt(
            container,
            format!("string offset {start} beyond buffer length {}", buffer.len()),
        ));
    }
    let rest = &buffer[start..];
    let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    Ok(String::from_utf8_lossy(&rest[..end]).into_owned())
}

fn read_inline_node<R: Read + Seek>(
    r: &mut EndianReader<R>,
    format: FormatVersion,
    container: &str,
    nodes: &mut Vec<TypeTreeNode>,
    level: usize,
) -> Result<()> {
    if level >= MAX_TREE_DEPTH {
        return Err(Error::corrupt(container, "type tree nesting too deep".to_owned()));
    }

    let type_name = r.read_cstring()?;
    let name = r.read_cstring()?;
    let byte_size = r.read_i32()?;
    if format.0 == 2 {
        let _variable_count = r.read_i32()?;
    }
    let index = if format.0 != 3 { r.read_i32()? } else { 0 };
    let type_flags = r.read_i32()?;
    let version = r.read_i32()?;
    let meta_flag = if format.0 != 3 { r.read_i32()? } else { 0 };

    nodes.push(TypeTreeNode {
        version: version as u16,
        level: level as u8,
        type_flags: type_flags as u8,
        type_name,
        name,
        byte_size,
        index,
        meta_flag,
        ref_type_hash: 0,
        kind: NodeKind::Record,
    });

    let children = r.read_i32()?;
    if children < 0 {
        return Err(Error::corrupt(container, format!("negative child count {children}")));
    }
    for _ in 0..children {
        read_inline_node(r, format, container, nodes, level + 1)?;
    }
    Ok(())
}

/// Assign a [`NodeKind`] to every node. Runs once per tree; the decoder
/// never re-derives classification from type-name strings.
fn classify(nodes: &mut [TypeTreeNode]) {
    for i in 0..nodes.len() {
        let kind = {
            let node = &nodes[i];
            let first_child = nodes
                .get(i + 1)
                .filter(|c| c.level == node.level + 1);
            match node.type_name.as_str() {
                "bool" => NodeKind::Bool,
                "SInt8" => NodeKind::I8,
                "UInt8" => NodeKind::U8,
                "char" => NodeKind::Char,
                "SInt16" | "short" => NodeKind::I16,
                "UInt16" | "unsigned short" => NodeKind::U16,
                "SInt32" | "int" => NodeKind::I32,
                "UInt32" | "unsigned int" | "Type*" => NodeKind::U32,
                "SInt64" | "long long" => NodeKind::I64,
                "UInt64" | "unsigned long long" | "FileSize" => NodeKind::U64,
                "float" => NodeKind::F32,
                "double" => NodeKind::F64,
                "string" => NodeKind::Str,
                "map" => NodeKind::Map,
                "TypelessData" => NodeKind::TypelessData,
                _ if node.is_array_header() => NodeKind::ArrayHeader,
                _ => match first_child {
                    Some(c) if c.is_array_header() => NodeKind::Array,
                    Some(_) => NodeKind::Record,
                    None => NodeKind::Opaque,
                },
            }
        };
        nodes[i].kind = kind;
    }
}
