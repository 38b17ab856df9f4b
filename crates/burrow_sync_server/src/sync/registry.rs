//! In-memory registry of live vault documents.
//!
//! One [`VaultRoom`] per vault holds the CRDT document, the awareness set,
//! and the joined clients behind coarse per-vault locks: CRDT updates apply
//! serially, and broadcasts derived from an update are enqueued to every peer
//! before the next update begins applying. Rooms are created lazily on first
//! join and evicted (after a flush) when the last client leaves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

use burrow_core::crdt::{VaultAwareness, VaultDoc, WireMessage};
use burrow_core::CrdtError;

use crate::db::Role;
use crate::protocol::ServerEvent;
use crate::store::{StoreError, VaultStore};
use crate::sync::file_sink::FileSink;
use crate::sync::session::ClientHandle;

/// Live state of a single vault.
pub struct VaultRoom {
    vault_id: String,
    doc: Arc<Mutex<VaultDoc>>,
    awareness: Mutex<VaultAwareness>,
    clients: Mutex<HashMap<Uuid, ClientHandle>>,
    dirty: Arc<AtomicBool>,
    sink: Arc<FileSink>,
}

impl VaultRoom {
    fn new(vault_id: &str, doc: VaultDoc, store: VaultStore, debounce: Duration) -> Arc<Self> {
        let doc = Arc::new(Mutex::new(doc));
        let dirty = Arc::new(AtomicBool::new(false));
        let sink = FileSink::new(
            vault_id.to_string(),
            store,
            debounce,
            Arc::downgrade(&doc),
            dirty.clone(),
        );
        Arc::new(Self {
            vault_id: vault_id.to_string(),
            doc,
            awareness: Mutex::new(VaultAwareness::new()),
            clients: Mutex::new(HashMap::new()),
            dirty,
            sink,
        })
    }

    pub fn vault_id(&self) -> &str {
        &self.vault_id
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    // ==================== Clients ====================

    pub async fn add_client(&self, handle: ClientHandle) {
        let mut clients = self.clients.lock().await;
        clients.insert(handle.conn_id, handle);
    }

    pub async fn remove_client(&self, conn_id: Uuid) -> Option<ClientHandle> {
        let mut clients = self.clients.lock().await;
        clients.remove(&conn_id)
    }

    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Update the role cached on a joined client's handle.
    pub async fn update_cached_role(&self, conn_id: Uuid, role: Role) {
        let mut clients = self.clients.lock().await;
        if let Some(handle) = clients.get_mut(&conn_id) {
            handle.role = role;
        }
    }

    /// Remember which awareness clients a connection speaks for.
    pub async fn record_awareness_ids(&self, conn_id: Uuid, ids: &[u64]) {
        let mut clients = self.clients.lock().await;
        if let Some(handle) = clients.get_mut(&conn_id) {
            handle.awareness_ids.extend(ids.iter().copied());
        }
    }

    /// Send to every joined client except `except`.
    pub async fn broadcast_except(&self, except: Option<Uuid>, event: ServerEvent) {
        let clients = self.clients.lock().await;
        for (conn_id, handle) in clients.iter() {
            if Some(*conn_id) == except {
                continue;
            }
            handle.send(event.clone());
        }
    }

    // ==================== Document ====================

    pub async fn list_paths(&self) -> Vec<String> {
        self.doc.lock().await.list_paths()
    }

    pub async fn file_text(&self, path: &str) -> Option<String> {
        self.doc.lock().await.file_text(path)
    }

    pub async fn encode_state(&self) -> Vec<u8> {
        self.doc.lock().await.encode_state()
    }

    pub async fn state_vector(&self) -> Vec<u8> {
        self.doc.lock().await.state_vector()
    }

    /// Build the SyncStep2 reply for a peer's SyncStep1 state vector.
    pub async fn step2_for(&self, state_vector: &[u8]) -> Result<Vec<u8>, CrdtError> {
        let doc = self.doc.lock().await;
        let diff = doc.diff_since(state_vector)?;
        Ok(WireMessage::SyncStep2(diff).encode())
    }

    /// Apply a client's mutation and fan it out to the other clients.
    ///
    /// The document lock is held across apply + broadcast enqueue, so peers
    /// observe updates in apply order.
    pub async fn apply_mutation(
        &self,
        update: &[u8],
        originator: Uuid,
    ) -> Result<(), CrdtError> {
        let doc = self.doc.lock().await;
        let changes = doc.apply_update(update)?;
        self.mark_dirty();
        for change in changes {
            self.sink.schedule(change);
        }

        let payload = WireMessage::Update(update.to_vec()).encode();
        self.broadcast_except(Some(originator), ServerEvent::SyncMessage { payload })
            .await;
        Ok(())
    }

    /// Apply a server-side edit (admin boundary) and fan it out to everyone.
    pub async fn local_edit(&self, path: &str, content: &str) {
        let doc = self.doc.lock().await;
        let update = doc.set_file_text(path, content);
        let changes = doc.take_local_changes();
        self.mark_dirty();
        for change in changes {
            self.sink.schedule(change);
        }

        let payload = WireMessage::Update(update).encode();
        self.broadcast_except(None, ServerEvent::SyncMessage { payload })
            .await;
    }

    /// Remove a file server-side; `false` when the path does not exist.
    pub async fn local_remove(&self, path: &str) -> bool {
        let doc = self.doc.lock().await;
        let Some(update) = doc.remove_file(path) else {
            return false;
        };
        let changes = doc.take_local_changes();
        self.mark_dirty();
        for change in changes {
            self.sink.schedule(change);
        }

        let payload = WireMessage::Update(update).encode();
        self.broadcast_except(None, ServerEvent::SyncMessage { payload })
            .await;
        true
    }

    // ==================== Awareness ====================

    /// Apply an awareness delta and fan it out; returns the client ids the
    /// delta spoke for.
    pub async fn apply_awareness(
        &self,
        delta: &[u8],
        originator: Uuid,
    ) -> Result<Vec<u64>, CrdtError> {
        let seen = {
            let mut awareness = self.awareness.lock().await;
            awareness.apply_update(delta)?
        };
        let payload = WireMessage::Awareness(delta.to_vec()).encode();
        self.broadcast_except(Some(originator), ServerEvent::SyncMessage { payload })
            .await;
        Ok(seen)
    }

    /// Full awareness state as a wire frame, when anyone is present.
    pub async fn awareness_snapshot(&self) -> Option<Vec<u8>> {
        let awareness = self.awareness.lock().await;
        awareness
            .encode_full()
            .map(|delta| WireMessage::Awareness(delta).encode())
    }

    /// Remove a departed connection's awareness clients and broadcast the
    /// removal.
    pub async fn remove_awareness_clients(&self, ids: &[u64]) {
        if ids.is_empty() {
            return;
        }
        let removal = {
            let mut awareness = self.awareness.lock().await;
            awareness.remove_clients(ids)
        };
        if let Some(delta) = removal {
            let payload = WireMessage::Awareness(delta).encode();
            self.broadcast_except(None, ServerEvent::SyncMessage { payload })
                .await;
        }
    }

    // ==================== Persistence ====================

    /// Encode the full state and write the snapshot; clears the dirty flag.
    pub async fn flush(&self, store: &VaultStore) -> Result<(), StoreError> {
        let state = {
            let doc = self.doc.lock().await;
            doc.encode_state()
        };
        store.save_snapshot(&self.vault_id, &state)?;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Fire all pending file writes immediately.
    pub async fn flush_files(&self) {
        self.sink.flush_now().await;
    }
}

impl std::fmt::Debug for VaultRoom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultRoom")
            .field("vault_id", &self.vault_id)
            .field("dirty", &self.is_dirty())
            .finish_non_exhaustive()
    }
}

/// Process-wide registry of live vault rooms.
///
/// Created once at server start; the maps never outlive the process.
pub struct DocRegistry {
    rooms: RwLock<HashMap<String, Arc<VaultRoom>>>,
    store: VaultStore,
    debounce: Duration,
}

impl DocRegistry {
    pub fn new(store: VaultStore, debounce: Duration) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            store,
            debounce,
        }
    }

    pub fn store(&self) -> &VaultStore {
        &self.store
    }

    /// Get the live room for a vault, loading it from disk if needed.
    ///
    /// Creates the vault on disk when it does not exist yet. A snapshot that
    /// fails to decode is treated as an empty document; materialized files on
    /// disk are left untouched.
    pub async fn get_or_create(&self, vault_id: &str) -> Result<Arc<VaultRoom>, StoreError> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(vault_id) {
                return Ok(room.clone());
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring the write lock
        if let Some(room) = rooms.get(vault_id) {
            return Ok(room.clone());
        }

        VaultStore::sanitize_vault_id(vault_id)?;
        if !self.store.exists(vault_id) {
            self.store.create_vault(vault_id)?;
            info!(vault = vault_id, "created vault");
        }

        let snapshot = self.store.load_snapshot(vault_id)?;
        let doc = match VaultDoc::from_snapshot(&snapshot) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(
                    vault = vault_id,
                    error = %e,
                    "snapshot failed to load; starting from an empty document"
                );
                VaultDoc::new()
            }
        };

        let room = VaultRoom::new(vault_id, doc, self.store.clone(), self.debounce);
        rooms.insert(vault_id.to_string(), room.clone());
        info!(vault = vault_id, "loaded vault room");
        Ok(room)
    }

    /// The live room, if loaded.
    pub async fn get(&self, vault_id: &str) -> Option<Arc<VaultRoom>> {
        self.rooms.read().await.get(vault_id).cloned()
    }

    /// Flush one vault's snapshot if it is live.
    pub async fn flush(&self, vault_id: &str) -> Result<(), StoreError> {
        if let Some(room) = self.get(vault_id).await {
            room.flush(&self.store).await?;
        }
        Ok(())
    }

    /// Flush a vault and drop it from memory when no clients remain.
    pub async fn flush_and_evict(&self, vault_id: &str) {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(vault_id).cloned() else {
            return;
        };

        room.flush_files().await;
        if let Err(e) = room.flush(&self.store).await {
            error!(vault = vault_id, error = %e, "flush before eviction failed");
            return;
        }
        if room.client_count().await == 0 {
            rooms.remove(vault_id);
            info!(vault = vault_id, "evicted idle vault room");
        }
    }

    /// Drop a room without flushing (after a backup restore, the on-disk
    /// state is the truth and the in-memory doc is stale).
    pub async fn evict_discard(&self, vault_id: &str) {
        let mut rooms = self.rooms.write().await;
        if rooms.remove(vault_id).is_some() {
            info!(vault = vault_id, "discarded vault room");
        }
    }

    /// Autosave tick: flush every dirty room.
    pub async fn flush_dirty(&self) {
        let dirty: Vec<Arc<VaultRoom>> = {
            let rooms = self.rooms.read().await;
            rooms.values().filter(|r| r.is_dirty()).cloned().collect()
        };
        for room in dirty {
            if let Err(e) = room.flush(&self.store).await {
                error!(vault = room.vault_id(), error = %e, "autosave flush failed");
                room.mark_dirty();
            }
        }
    }

    /// Flush everything (graceful shutdown).
    pub async fn shutdown(&self) {
        let rooms: Vec<Arc<VaultRoom>> = {
            let rooms = self.rooms.read().await;
            rooms.values().cloned().collect()
        };
        for room in rooms {
            room.flush_files().await;
            if let Err(e) = room.flush(&self.store).await {
                error!(vault = room.vault_id(), error = %e, "shutdown flush failed");
            }
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
