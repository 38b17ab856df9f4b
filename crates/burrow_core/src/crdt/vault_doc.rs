//! Per-vault replicated document.
//!
//! A `VaultDoc` wraps a Y document whose root map `files` maps vault-relative
//! paths to collaborative text sequences. Applying an update reports which
//! paths changed so the server can schedule materialization to disk.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use yrs::types::{Event, EntryChange, PathSegment};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    DeepObservable, Doc, GetString, Map, MapRef, Out, ReadTxn, StateVector, Text, TextPrelim,
    TextRef, Transact, Update,
};

use crate::error::CrdtError;

/// Name of the root Y.Map holding path → text entries.
const FILES_MAP_NAME: &str = "files";

/// What happened to a file path in an applied update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeKind {
    /// The path was created or its text changed.
    Upsert,
    /// The path was removed from the vault.
    Delete,
}

/// A single changed path reported by update application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: String,
    pub kind: FileChangeKind,
}

/// A CRDT document holding all text files of one vault.
///
/// Updates are commutative, associative, and idempotent (delegated to the
/// underlying Y implementation), so replicas converge regardless of delivery
/// order. The document tracks changed paths through a deep observer on the
/// `files` map; [`VaultDoc::apply_update`] drains them after each
/// transaction commits.
pub struct VaultDoc {
    doc: Doc,
    files: MapRef,
    /// Paths touched since the last drain, in observation order.
    changed: Arc<Mutex<Vec<FileChange>>>,
    /// Keeps the deep observer alive for the lifetime of the doc.
    _subscription: yrs::Subscription,
}

impl VaultDoc {
    /// Create an empty vault document.
    pub fn new() -> Self {
        let doc = Doc::new();
        let files = doc.get_or_insert_map(FILES_MAP_NAME);
        let changed: Arc<Mutex<Vec<FileChange>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = changed.clone();
        let subscription = files.observe_deep(move |txn, events| {
            let mut pending = sink.lock().unwrap();
            for event in events.iter() {
                match event {
                    Event::Map(map_event) => {
                        // Only key changes on the root map are file adds/removes;
                        // nested maps are not part of the vault model.
                        if !map_event.path().is_empty() {
                            continue;
                        }
                        for (key, change) in map_event.keys(txn) {
                            let kind = match change {
                                EntryChange::Removed(_) => FileChangeKind::Delete,
                                _ => FileChangeKind::Upsert,
                            };
                            pending.push(FileChange {
                                path: key.to_string(),
                                kind,
                            });
                        }
                    }
                    Event::Text(text_event) => {
                        // The first path segment of a nested text event is the
                        // file path key in the root map.
                        if let Some(PathSegment::Key(key)) = text_event.path().front() {
                            pending.push(FileChange {
                                path: key.to_string(),
                                kind: FileChangeKind::Upsert,
                            });
                        }
                    }
                    _ => {}
                }
            }
        });

        Self {
            doc,
            files,
            changed,
            _subscription: subscription,
        }
    }

    /// Build a document from an encoded snapshot.
    ///
    /// An empty snapshot yields an empty document. The changes produced by
    /// loading are discarded; the snapshot is the baseline, not an edit.
    pub fn from_snapshot(snapshot: &[u8]) -> Result<Self, CrdtError> {
        let doc = Self::new();
        if !snapshot.is_empty() {
            doc.apply_update(snapshot)?;
        }
        doc.changed.lock().unwrap().clear();
        Ok(doc)
    }

    // ==================== Sync Operations ====================

    /// Encode the full document state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode the current state vector.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode everything a peer with the given state vector is missing.
    pub fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, CrdtError> {
        let sv = if state_vector.is_empty() {
            StateVector::default()
        } else {
            StateVector::decode_v1(state_vector)
                .map_err(|e| CrdtError::Decode(format!("state vector: {}", e)))?
        };
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Apply an encoded update and report the file paths it touched.
    ///
    /// Changes are deduplicated per path; when a path is both edited and
    /// removed within one update, the later observation wins.
    pub fn apply_update(&self, update: &[u8]) -> Result<Vec<FileChange>, CrdtError> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| CrdtError::Decode(format!("update: {}", e)))?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| CrdtError::Apply(e.to_string()))?;
        }
        Ok(self.drain_changes())
    }

    fn drain_changes(&self) -> Vec<FileChange> {
        let mut pending = self.changed.lock().unwrap();
        let mut merged: BTreeMap<String, FileChangeKind> = BTreeMap::new();
        for change in pending.drain(..) {
            merged.insert(change.path, change.kind);
        }
        merged
            .into_iter()
            .map(|(path, kind)| FileChange { path, kind })
            .collect()
    }

    // ==================== File Operations ====================

    /// All file paths currently in the vault, sorted.
    pub fn list_paths(&self) -> Vec<String> {
        let txn = self.doc.transact();
        let mut paths: Vec<String> = self.files.keys(&txn).map(String::from).collect();
        paths.sort();
        paths
    }

    /// Number of files in the vault.
    pub fn file_count(&self) -> usize {
        let txn = self.doc.transact();
        self.files.len(&txn) as usize
    }

    /// Current text of a path, or `None` if the path does not exist.
    pub fn file_text(&self, path: &str) -> Option<String> {
        let txn = self.doc.transact();
        match self.files.get(&txn, path)? {
            Out::YText(text) => Some(text.get_string(&txn)),
            _ => None,
        }
    }

    /// Replace (or create) the full text of a path.
    ///
    /// Returns the incremental update encoding this edit, for broadcast.
    pub fn set_file_text(&self, path: &str, content: &str) -> Vec<u8> {
        let before = {
            let txn = self.doc.transact();
            txn.state_vector()
        };
        {
            let mut txn = self.doc.transact_mut();
            match self.files.get(&txn, path) {
                Some(Out::YText(text)) => {
                    let len = text.len(&txn);
                    if len > 0 {
                        text.remove_range(&mut txn, 0, len);
                    }
                    text.insert(&mut txn, 0, content);
                }
                _ => {
                    self.files.insert(&mut txn, path, TextPrelim::new(content));
                }
            }
        }
        let txn = self.doc.transact();
        txn.encode_diff_v1(&before)
    }

    /// Insert text into an existing file at a character offset.
    ///
    /// Returns the incremental update for broadcast, or `None` when the path
    /// does not exist.
    pub fn insert_text(&self, path: &str, index: u32, chunk: &str) -> Option<Vec<u8>> {
        let before = {
            let txn = self.doc.transact();
            txn.state_vector()
        };
        {
            let mut txn = self.doc.transact_mut();
            let text: TextRef = match self.files.get(&txn, path) {
                Some(Out::YText(text)) => text,
                _ => return None,
            };
            text.insert(&mut txn, index, chunk);
        }
        let txn = self.doc.transact();
        Some(txn.encode_diff_v1(&before))
    }

    /// Remove a path from the vault.
    ///
    /// Returns the incremental update for broadcast, or `None` when the path
    /// does not exist.
    pub fn remove_file(&self, path: &str) -> Option<Vec<u8>> {
        let before = {
            let txn = self.doc.transact();
            txn.state_vector()
        };
        {
            let mut txn = self.doc.transact_mut();
            self.files.get(&txn, path)?;
            self.files.remove(&mut txn, path);
        }
        let txn = self.doc.transact();
        Some(txn.encode_diff_v1(&before))
    }

    /// Drop any changes recorded by local mutations.
    ///
    /// Local edits through [`set_file_text`](Self::set_file_text) and friends
    /// fire the same observer as remote updates; callers that materialize
    /// eagerly can clear the backlog instead of double-writing.
    pub fn take_local_changes(&self) -> Vec<FileChange> {
        self.drain_changes()
    }
}

impl Default for VaultDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for VaultDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultDoc")
            .field("file_count", &self.file_count())
            .finish_non_exhaustive()
    }
}
