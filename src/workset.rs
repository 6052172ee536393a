//! Working set: every container loaded for one session, plus cross-file
//! pointer resolution over them.
//!
//! Loading dispatches on sniffed format: archives are unpacked and their
//! entries fed back through the same dispatch (archives can nest),
//! serialized files join the set, anything else is kept as an opaque
//! resource stream. Errors local to one container are logged and skipped
//! so a bad file cannot poison the batch.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::bundle::{sniff_signature, BundleFile, ByteSource};
use crate::cipher::{apply_title_transform, TitleConfig};
use crate::error::{Error, Result};
use crate::object::{decode_object, dump_object, Value};
use crate::serialized::{is_serialized_file, SerializedFile};

/// Nested-archive depth guard.
const MAX_NESTING: usize = 8;

// ── Cancellation ─────────────────────────────────────────────────────────────

/// Cooperative cancellation flag, checked between items so already-decoded
/// state stays valid. Clone it onto another thread and call
/// [`CancelToken::cancel`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ── Pointers ─────────────────────────────────────────────────────────────────

/// Typed reference from one object to another, possibly across files.
/// `file_id` 0 means the owning file; otherwise it is a 1-based index
/// into the owner's external-reference table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PPtr {
    pub file_id: i32,
    pub path_id: i64,
}

impl PPtr {
    pub fn is_null(&self) -> bool {
        self.path_id == 0
    }

    /// Read a pointer out of a decoded record shaped like one.
    pub fn from_value(value: &Value) -> Option<PPtr> {
        let file_id = value.get("m_FileID")?.as_i64()?;
        let path_id = value.get("m_PathID")?.as_i64()?;
        Some(PPtr { file_id: file_id as i32, path_id })
    }

    /// Collect every pointer-shaped record reachable from `value`.
    pub fn collect(value: &Value, out: &mut Vec<PPtr>) {
        if let Some(ptr) = PPtr::from_value(value) {
            out.push(ptr);
            return;
        }
        match value {
            Value::Record(fields) => {
                for (_, v) in fields {
                    PPtr::collect(v, out);
                }
            }
            Value::Array(items) => {
                for v in items {
                    PPtr::collect(v, out);
                }
            }
            Value::Map(entries) => {
                for (k, v) in entries {
                    PPtr::collect(k, out);
                    PPtr::collect(v, out);
                }
            }
            _ => {}
        }
    }
}

/// Resolution state of one (owner, file id) edge. `Absent` is sticky
/// until [`WorkingSet::clear`]; loading more files later does not revisit
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtrState {
    Unresolved,
    Absent,
    Resolved(usize),
}

// ── Working set ──────────────────────────────────────────────────────────────

pub struct LoadedFile {
    pub file: SerializedFile,
    decoded: HashMap<i64, Value>,
}

pub struct WorkingSet {
    config: TitleConfig,
    files: Vec<LoadedFile>,
    /// Lowercased file name to slot.
    name_index: HashMap<String, usize>,
    /// Dependency names already confirmed unavailable.
    missing: HashSet<String>,
    /// (owner slot, external file id) to resolution state.
    resolution_cache: HashMap<(usize, i32), PtrState>,
    resources: HashMap<String, ByteSource>,
    cancel: CancelToken,
}

impl WorkingSet {
    pub fn new(config: TitleConfig) -> Self {
        Self {
            config,
            files: Vec::new(),
            name_index: HashMap::new(),
            missing: HashSet::new(),
            resolution_cache: HashMap::new(),
            resources: HashMap::new(),
            cancel: CancelToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    // ── Loading ──────────────────────────────────────────────────────────────

    /// Load one file from disk: title transform, then format dispatch.
    pub fn load_path(&mut self, path: &Path) -> Result<()> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut data = std::fs::read(path)?;
        if let Some(corrected) = apply_title_transform(&self.config, &data, &name) {
            debug!(file = %name, "title transform applied");
            data = corrected;
        }
        self.load_source(&name, ByteSource::from_vec(data), 0)
    }

    /// Load a file and then every external reference it (transitively)
    /// names that sits in the same directory. Missing dependencies are
    /// logged, remembered, and skipped.
    pub fn load_with_dependencies(&mut self, path: &Path) -> Result<()> {
        self.load_path(path)?;
        let dir: PathBuf = path.parent().map(Path::to_path_buf).unwrap_or_default();

        let mut scanned = 0;
        loop {
            self.check_cancel()?;
            let mut wanted = Vec::new();
            while scanned < self.files.len() {
                for ext in &self.files[scanned].file.externals {
                    let key = ext.file_name.to_lowercase();
                    if !key.is_empty()
                        && !self.name_index.contains_key(&key)
                        && !self.missing.contains(&key)
                    {
                        wanted.push(ext.file_name.clone());
                    }
                }
                scanned += 1;
            }
            if wanted.is_empty() {
                return Ok(());
            }
            for name in wanted {
                self.check_cancel()?;
                let key = name.to_lowercase();
                if self.name_index.contains_key(&key) || self.missing.contains(&key) {
                    continue;
                }
                let candidate = dir.join(&name);
                if !candidate.is_file() {
                    debug!(file = %name, "dependency not found on disk");
                    self.missing.insert(key);
                    continue;
                }
                if let Err(err) = self.load_path(&candidate) {
                    if matches!(err, Error::Cancelled) {
                        return Err(err);
                    }
                    warn!(file = %name, error = %err, "dependency failed to load");
                    self.missing.insert(key);
                }
            }
        }
    }

    /// Format dispatch over an already-materialized stream.
    pub fn load_source(&mut self, name: &str, mut source: ByteSource, depth: usize) -> Result<()> {
        if depth >= MAX_NESTING {
            return Err(Error::corrupt(name, "archive nesting too deep"));
        }
        let (prefix, total_len) = peek_prefix(&mut source)?;

        if sniff_signature(&prefix).is_some() {
            let mut bundle = BundleFile::read(source, name, &self.config)?;
            info!(archive = %name, entries = bundle.entry_count(), "archive unpacked");
            for index in 0..bundle.entry_count() {
                self.check_cancel()?;
                let entry_name = bundle.entries[index].path.clone();
                let result = bundle
                    .read_entry(index)
                    .and_then(|entry| self.load_source(&entry_name, entry, depth + 1));
                match result {
                    Ok(()) => {}
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(err) => {
                        warn!(archive = %name, entry = %entry_name, error = %err, "entry skipped");
                    }
                }
            }
            return Ok(());
        }

        if is_serialized_file(&prefix, total_len) {
            let file = SerializedFile::read(source, name.to_owned())?;
            let slot = self.files.len();
            self.name_index.insert(name.to_lowercase(), slot);
            debug!(file = %name, slot, objects = file.object_count(), "serialized file registered");
            self.files.push(LoadedFile { file, decoded: HashMap::new() });
            return Ok(());
        }

        debug!(file = %name, "kept as opaque resource");
        self.resources.insert(name.to_owned(), source);
        Ok(())
    }

    // ── Access ───────────────────────────────────────────────────────────────

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn file(&self, slot: usize) -> Option<&SerializedFile> {
        self.files.get(slot).map(|f| &f.file)
    }

    pub fn file_index(&self, name: &str) -> Option<usize> {
        self.name_index.get(&name.to_lowercase()).copied()
    }

    pub fn resource(&mut self, name: &str) -> Option<&mut ByteSource> {
        self.resources.get_mut(name)
    }

    pub fn resource_names(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    /// Forget every loaded file, resource, and cached resolution. Temp
    /// streams are deleted when their handles drop.
    pub fn clear(&mut self) {
        self.files.clear();
        self.name_index.clear();
        self.missing.clear();
        self.resolution_cache.clear();
        self.resources.clear();
    }

    // ── Decoding ─────────────────────────────────────────────────────────────

    /// Decode one object, caching the result per (file, path id).
    pub fn object(&mut self, slot: usize, path_id: i64) -> Result<&Value> {
        self.ensure_decoded(slot, path_id)?;
        Ok(&self.files[slot].decoded[&path_id])
    }

    /// Decode every object in one file, polling cancellation between
    /// objects.
    pub fn decode_all(&mut self, slot: usize) -> Result<()> {
        let lf = self.files.get(slot).ok_or_else(|| {
            Error::corrupt("working set", format!("no file in slot {slot}"))
        })?;
        let path_ids: Vec<i64> = lf.file.objects.iter().map(|o| o.path_id).collect();
        for path_id in path_ids {
            self.check_cancel()?;
            self.ensure_decoded(slot, path_id)?;
        }
        Ok(())
    }

    /// Text dump of one object's decoded fields.
    pub fn dump_object(&mut self, slot: usize, path_id: i64) -> Result<String> {
        let lf = self.files.get_mut(slot).ok_or_else(|| {
            Error::corrupt("working set", format!("no file in slot {slot}"))
        })?;
        let record = lf
            .file
            .object_by_path_id(path_id)
            .cloned()
            .ok_or_else(|| Error::corrupt(&lf.file.name, format!("no object {path_id}")))?;
        let data = lf.file.object_data(&record)?;
        let endian = lf.file.endian();
        match lf.file.type_tree_for(&record) {
            Some(tree) => dump_object(tree, &data, endian, &lf.file.name),
            None => Ok(format!("{} untyped = <{} bytes>\n", record.class_id, data.len())),
        }
    }

    fn ensure_decoded(&mut self, slot: usize, path_id: i64) -> Result<()> {
        let lf = self.files.get_mut(slot).ok_or_else(|| {
            Error::corrupt("working set", format!("no file in slot {slot}"))
        })?;
        if lf.decoded.contains_key(&path_id) {
            return Ok(());
        }
        let record = lf
            .file
            .object_by_path_id(path_id)
            .cloned()
            .ok_or_else(|| Error::corrupt(&lf.file.name, format!("no object {path_id}")))?;
        let data = lf.file.object_data(&record)?;
        let endian = lf.file.endian();
        let value = match lf.file.type_tree_for(&record) {
            Some(tree) => decode_object(tree, &data, endian, &lf.file.name)?,
            // No schema for this object; keep the raw bytes.
            None => Value::Bytes(data),
        };
        lf.decoded.insert(path_id, value);
        Ok(())
    }

    // ── Resolution ───────────────────────────────────────────────────────────

    /// Resolve a pointer's file component for an owner file. Results are
    /// memoized per (owner, file id); a confirmed miss stays a miss until
    /// [`WorkingSet::clear`].
    pub fn resolve_file(&mut self, owner: usize, file_id: i32) -> PtrState {
        if file_id == 0 {
            return PtrState::Resolved(owner);
        }
        if file_id < 0 {
            return PtrState::Absent;
        }
        let key = (owner, file_id);
        if let Some(&state) = self.resolution_cache.get(&key) {
            if state != PtrState::Unresolved {
                return state;
            }
        }
        let state = match self
            .files
            .get(owner)
            .and_then(|lf| lf.file.externals.get(file_id as usize - 1))
        {
            Some(ext) => match self.name_index.get(&ext.file_name.to_lowercase()) {
                Some(&slot) => PtrState::Resolved(slot),
                None => PtrState::Absent,
            },
            None => PtrState::Absent,
        };
        self.resolution_cache.insert(key, state);
        state
    }

    /// Resolve a pointer to its decoded target. Not-found is a result,
    /// not an error; decode failures on the target are logged as misses.
    pub fn resolve_object(&mut self, owner: usize, ptr: PPtr) -> Option<&Value> {
        if ptr.is_null() {
            return None;
        }
        let slot = match self.resolve_file(owner, ptr.file_id) {
            PtrState::Resolved(slot) => slot,
            _ => return None,
        };
        if !self.files.get(slot)?.file.has_object(ptr.path_id) {
            return None;
        }
        if let Err(err) = self.ensure_decoded(slot, ptr.path_id) {
            warn!(slot, path_id = ptr.path_id, error = %err, "pointer target failed to decode");
            return None;
        }
        self.files[slot].decoded.get(&ptr.path_id)
    }
}

/// First bytes plus total length, with the stream rewound; enough for
/// every sniffer.
fn peek_prefix(source: &mut ByteSource) -> Result<(Vec<u8>, u64)> {
    let len = source.len()?;
    source.seek(SeekFrom::Start(0))?;
    let mut prefix = vec![0u8; 64.min(len as usize)];
    source.read_exact(&mut prefix)?;
    source.seek(SeekFrom::Start(0))?;
    Ok((prefix, len))
}
