//! Schema-driven object decoding.
//!
//! An object's bytes carry no self-description; its type tree is the
//! schema. One traversal drives pluggable sinks, so building a [`Value`]
//! and producing a text dump share the walk instead of duplicating it.

use std::fmt;
use std::io::Cursor;

use tracing::warn;

use crate::error::{Error, Result};
use crate::reader::{Endian, EndianReader};
use crate::typetree::{NodeKind, TypeTree, TypeTreeNode};

// ── Value model ──────────────────────────────────────────────────────────────

/// Dynamically typed decode result. Primitive variants mirror the leaf
/// node kinds; aggregates preserve field order.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Record(Vec<(String, Value)>),
}

impl Value {
    /// Field lookup on records. `None` for other variants.
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Record(fields) => {
                fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Any integer variant, sign-extended.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::I8(v) => Some(v as i64),
            Value::U8(v) => Some(v as i64),
            Value::I16(v) => Some(v as i64),
            Value::U16(v) => Some(v as i64),
            Value::I32(v) => Some(v as i64),
            Value::U32(v) => Some(v as i64),
            Value::I64(v) => Some(v),
            Value::U64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::F32(v) => Some(v as f64),
            Value::F64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::I8(v) => write!(f, "{v}"),
            Value::U8(v) => write!(f, "{v}"),
            Value::I16(v) => write!(f, "{v}"),
            Value::U16(v) => write!(f, "{v}"),
            Value::I32(v) => write!(f, "{v}"),
            Value::U32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::U64(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Array(items) => write!(f, "<array of {}>", items.len()),
            Value::Map(entries) => write!(f, "<map of {}>", entries.len()),
            Value::Record(fields) => write!(f, "<record of {}>", fields.len()),
        }
    }
}

// ── Sink ─────────────────────────────────────────────────────────────────────

/// Receives decode events in schema order.
pub trait Sink {
    type Output;

    fn primitive(&mut self, node: &TypeTreeNode, value: Value);
    fn begin_record(&mut self, node: &TypeTreeNode);
    fn end_record(&mut self, node: &TypeTreeNode);
    fn begin_array(&mut self, node: &TypeTreeNode, len: usize);
    fn end_array(&mut self, node: &TypeTreeNode);
    fn begin_map(&mut self, node: &TypeTreeNode, len: usize);
    fn end_map(&mut self, node: &TypeTreeNode);
    fn finish(self) -> Self::Output;
}

// ── Decoder ──────────────────────────────────────────────────────────────────

/// Decode one object's bytes into a [`Value`] using its type tree.
///
/// A consumed-byte total different from the object's declared size is
/// logged and tolerated; the partially or over-read value is still
/// returned.
pub fn decode_object(
    tree: &TypeTree,
    data: &[u8],
    endian: Endian,
    context: &str,
) -> Result<Value> {
    run_decode(tree, data, endian, context, ValueBuilder::new())
}

/// Human-readable dump of one object, one line per field.
pub fn dump_object(
    tree: &TypeTree,
    data: &[u8],
    endian: Endian,
    context: &str,
) -> Result<String> {
    run_decode(tree, data, endian, context, TextDumper::new())
}

fn run_decode<S: Sink>(
    tree: &TypeTree,
    data: &[u8],
    endian: Endian,
    context: &str,
    mut sink: S,
) -> Result<S::Output> {
    if tree.nodes.is_empty() {
        return Err(Error::corrupt(context, "empty type tree"));
    }
    let mut r = EndianReader::new(Cursor::new(data), endian);
    let decoder = Decoder { tree, context, total: data.len() as u64 };
    decoder.node(0, &mut r, &mut sink)?;
    let consumed = r.position()?;
    if consumed != data.len() as u64 {
        warn!(
            container = %context,
            expected = data.len(),
            consumed,
            "object size mismatch after decode"
        );
    }
    Ok(sink.finish())
}

struct Decoder<'a> {
    tree: &'a TypeTree,
    context: &'a str,
    total: u64,
}

impl<'a> Decoder<'a> {
    fn node<S: Sink>(
        &self,
        index: usize,
        r: &mut EndianReader<Cursor<&[u8]>>,
        sink: &mut S,
    ) -> Result<()> {
        let node = &self.tree.nodes[index];
        match node.kind {
            NodeKind::Bool => sink.primitive(node, Value::Bool(r.read_bool()?)),
            NodeKind::I8 => sink.primitive(node, Value::I8(r.read_i8()?)),
            NodeKind::U8 | NodeKind::Char => sink.primitive(node, Value::U8(r.read_u8()?)),
            NodeKind::I16 => sink.primitive(node, Value::I16(r.read_i16()?)),
            NodeKind::U16 => sink.primitive(node, Value::U16(r.read_u16()?)),
            NodeKind::I32 => sink.primitive(node, Value::I32(r.read_i32()?)),
            NodeKind::U32 => sink.primitive(node, Value::U32(r.read_u32()?)),
            NodeKind::I64 => sink.primitive(node, Value::I64(r.read_i64()?)),
            NodeKind::U64 => sink.primitive(node, Value::U64(r.read_u64()?)),
            NodeKind::F32 => sink.primitive(node, Value::F32(r.read_f32()?)),
            NodeKind::F64 => sink.primitive(node, Value::F64(r.read_f64()?)),
            NodeKind::Str => {
                // Length-prefixed UTF-8, padded to 4 bytes. The schema
                // children (the char array) are not walked.
                let len = self.checked_len(r, node)?;
                let bytes = r.read_bytes(len)?;
                r.align(4)?;
                sink.primitive(node, Value::Str(String::from_utf8_lossy(&bytes).into_owned()));
            }
            NodeKind::TypelessData => {
                let len = self.checked_len(r, node)?;
                sink.primitive(node, Value::Bytes(r.read_bytes(len)?));
            }
            NodeKind::Array | NodeKind::ArrayHeader => {
                let (header, element) = self.array_shape(index, node.kind)?;
                let len = self.checked_len(r, &self.tree.nodes[header])?;
                sink.begin_array(node, len);
                for _ in 0..len {
                    self.node(element, r, sink)?;
                }
                sink.end_array(node);
                if self.tree.nodes[header].requires_align() {
                    r.align(4)?;
                }
            }
            NodeKind::Map => {
                let (header, pair) = self.array_shape(index, NodeKind::Map)?;
                let len = self.checked_len(r, &self.tree.nodes[header])?;
                sink.begin_map(node, len);
                for _ in 0..len {
                    self.node(pair, r, sink)?;
                }
                sink.end_map(node);
                if self.tree.nodes[header].requires_align() {
                    r.align(4)?;
                }
            }
            NodeKind::Record => {
                sink.begin_record(node);
                for child in self.tree.children(index) {
                    self.node(child, r, sink)?;
                }
                sink.end_record(node);
            }
            NodeKind::Opaque => {
                // Unknown leaf type; its declared size is authoritative.
                let size = node.byte_size;
                if size < 0 || size as u64 > self.total {
                    return Err(Error::corrupt(
                        self.context,
                        format!("opaque node {} with implausible size {size}", node.name),
                    ));
                }
                sink.primitive(node, Value::Bytes(r.read_bytes(size as usize)?));
            }
        }
        if node.requires_align() {
            r.align(4)?;
        }
        Ok(())
    }

    /// For an array-shaped node: the array-header child carrying the
    /// align flag, and the element subtree root.
    fn array_shape(&self, index: usize, kind: NodeKind) -> Result<(usize, usize)> {
        // ArrayHeader nodes are themselves the header; container nodes
        // (vector/map records) wrap one.
        let header = if kind == NodeKind::ArrayHeader {
            index
        } else {
            self.tree.first_child(index).ok_or_else(|| {
                Error::corrupt(self.context, "array node without header child")
            })?
        };
        // Header children: size, then the element type.
        let mut children = self.tree.children(header).into_iter();
        let _size = children.next();
        let element = children.next().ok_or_else(|| {
            Error::corrupt(self.context, "array header without element type")
        })?;
        Ok((header, element))
    }

    /// Length prefix with sanity bounds: non-negative and no larger than
    /// the object window, so a corrupt prefix cannot drive allocation.
    fn checked_len(
        &self,
        r: &mut EndianReader<Cursor<&[u8]>>,
        node: &TypeTreeNode,
    ) -> Result<usize> {
        let len = r.read_i32()?;
        if len < 0 || len as u64 > self.total {
            return Err(Error::corrupt(
                self.context,
                format!("length prefix {len} for {} exceeds object window", node.name),
            ));
        }
        Ok(len as usize)
    }
}

// ── ValueBuilder ─────────────────────────────────────────────────────────────

enum Frame {
    Record { name: String, fields: Vec<(String, Value)> },
    Array { items: Vec<Value> },
    Map { pairs: Vec<Value> },
}

/// Sink building the [`Value`] tree.
struct ValueBuilder {
    stack: Vec<Frame>,
    result: Option<Value>,
}

impl ValueBuilder {
    fn new() -> Self {
        Self { stack: Vec::new(), result: None }
    }

    fn attach(&mut self, name: &str, value: Value) {
        match self.stack.last_mut() {
            Some(Frame::Record { fields, .. }) => fields.push((name.to_owned(), value)),
            Some(Frame::Array { items }) => items.push(value),
            Some(Frame::Map { pairs }) => pairs.push(value),
            None => self.result = Some(value),
        }
    }
}

impl Sink for ValueBuilder {
    type Output = Value;

    fn primitive(&mut self, node: &TypeTreeNode, value: Value) {
        self.attach(&node.name, value);
    }

    fn begin_record(&mut self, node: &TypeTreeNode) {
        self.stack.push(Frame::Record { name: node.name.clone(), fields: Vec::new() });
    }

    fn end_record(&mut self, _node: &TypeTreeNode) {
        if let Some(Frame::Record { name, fields }) = self.stack.pop() {
            self.attach(&name, Value::Record(fields));
        }
    }

    fn begin_array(&mut self, _node: &TypeTreeNode, len: usize) {
        self.stack.push(Frame::Array { items: Vec::with_capacity(len) });
    }

    fn end_array(&mut self, node: &TypeTreeNode) {
        if let Some(Frame::Array { items }) = self.stack.pop() {
            self.attach(&node.name, Value::Array(items));
        }
    }

    fn begin_map(&mut self, _node: &TypeTreeNode, len: usize) {
        self.stack.push(Frame::Map { pairs: Vec::with_capacity(len) });
    }

    fn end_map(&mut self, node: &TypeTreeNode) {
        if let Some(Frame::Map { pairs }) = self.stack.pop() {
            // Each entry decoded as a two-field pair record.
            let entries = pairs
                .into_iter()
                .filter_map(|pair| match pair {
                    Value::Record(mut fields) if fields.len() >= 2 => {
                        let second = fields.remove(1).1;
                        let first = fields.remove(0).1;
                        Some((first, second))
                    }
                    _ => None,
                })
                .collect();
            self.attach(&node.name, Value::Map(entries));
        }
    }

    fn finish(self) -> Value {
        self.result.unwrap_or(Value::Record(Vec::new()))
    }
}

// ── TextDumper ───────────────────────────────────────────────────────────────

/// Sink rendering an indented field-per-line listing.
struct TextDumper {
    out: String,
    depth: usize,
}

impl TextDumper {
    fn new() -> Self {
        Self { out: String::new(), depth: 0 }
    }

    fn line(&mut self, text: &str) {
        for _ in 0..self.depth {
            self.out.push('\t');
        }
        self.out.push_str(text);
        self.out.push('\n');
    }
}

impl Sink for TextDumper {
    type Output = String;

    fn primitive(&mut self, node: &TypeTreeNode, value: Value) {
        self.line(&format!("{} {} = {}", node.type_name, node.name, value));
    }

    fn begin_record(&mut self, node: &TypeTreeNode) {
        self.line(&format!("{} {}", node.type_name, node.name));
        self.depth += 1;
    }

    fn end_record(&mut self, _node: &TypeTreeNode) {
        self.depth -= 1;
    }

    fn begin_array(&mut self, node: &TypeTreeNode, len: usize) {
        self.line(&format!("{} {} ({len} items)", node.type_name, node.name));
        self.depth += 1;
    }

    fn end_array(&mut self, _node: &TypeTreeNode) {
        self.depth -= 1;
    }

    fn begin_map(&mut self, node: &TypeTreeNode, len: usize) {
        self.line(&format!("{} {} ({len} entries)", node.type_name, node.name));
        self.depth += 1;
    }

    fn end_map(&mut self, _node: &TypeTreeNode) {
        self.depth -= 1;
    }

    fn finish(self) -> String {
        self.out
    }
}
