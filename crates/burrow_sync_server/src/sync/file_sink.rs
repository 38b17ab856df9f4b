//! Debounced materialization of CRDT file changes to disk.
//!
//! Remote edits arrive as a stream of small updates; writing every one would
//! hammer the disk. Each changed path gets its own debounce timer (default
//! 200 ms): scheduling a write cancels a pending delete for the same path and
//! vice versa, and when the timer fires the path's current text is read from
//! the CRDT and written through the [`VaultStore`]. At most one write per
//! path is in flight at a time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use burrow_core::crdt::{FileChange, FileChangeKind, VaultDoc};

use crate::store::VaultStore;

struct PendingOp {
    id: u64,
    kind: FileChangeKind,
    handle: JoinHandle<()>,
}

/// Per-vault debounced writer of materialized files.
pub struct FileSink {
    vault_id: String,
    store: VaultStore,
    debounce: Duration,
    /// The room's document; weak because the room owns the sink.
    doc: Weak<Mutex<VaultDoc>>,
    /// Shared with the room: a failed write re-marks the vault dirty so the
    /// autosave tick retries.
    dirty: Arc<AtomicBool>,
    pending: DashMap<String, PendingOp>,
    next_id: AtomicU64,
}

impl FileSink {
    pub fn new(
        vault_id: String,
        store: VaultStore,
        debounce: Duration,
        doc: Weak<Mutex<VaultDoc>>,
        dirty: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            vault_id,
            store,
            debounce,
            doc,
            dirty,
            pending: DashMap::new(),
            next_id: AtomicU64::new(0),
        })
    }

    /// Schedule a write or delete for a path, replacing any pending timer.
    pub fn schedule(self: &Arc<Self>, change: FileChange) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Some((_, old)) = self.pending.remove(&change.path) {
            old.handle.abort();
        }

        let sink = self.clone();
        let path = change.path.clone();
        let kind = change.kind;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(sink.debounce).await;
            sink.pending.remove_if(&path, |_, op| op.id == id);
            sink.perform(&path, kind).await;
        });

        self.pending.insert(
            change.path,
            PendingOp {
                id,
                kind: change.kind,
                handle,
            },
        );
    }

    /// Fire every pending operation immediately (eviction and shutdown).
    pub async fn flush_now(self: &Arc<Self>) {
        let paths: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for path in paths {
            if let Some((_, op)) = self.pending.remove(&path) {
                op.handle.abort();
                self.perform(&path, op.kind).await;
            }
        }
    }

    /// Number of pending operations (test hook).
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    async fn perform(self: &Arc<Self>, path: &str, kind: FileChangeKind) {
        let result = match kind {
            FileChangeKind::Delete => self.store.delete_file(&self.vault_id, path),
            FileChangeKind::Upsert => {
                let Some(doc) = self.doc.upgrade() else {
                    return;
                };
                let text = { doc.lock().await.file_text(path) };
                match text {
                    Some(content) => self.store.write_file(&self.vault_id, path, &content),
                    // The path left the CRDT between scheduling and firing.
                    None => self.store.delete_file(&self.vault_id, path),
                }
            }
        };

        match result {
            Ok(()) => debug!(vault = %self.vault_id, path, "materialized file change"),
            Err(e) => {
                warn!(
                    vault = %self.vault_id,
                    path,
                    error = %e,
                    "file materialization failed; will retry"
                );
                self.dirty.store(true, Ordering::SeqCst);
                self.schedule(FileChange {
                    path: path.to_string(),
                    kind,
                });
            }
        }
    }
}

impl std::fmt::Debug for FileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSink")
            .field("vault_id", &self.vault_id)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}
