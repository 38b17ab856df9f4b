//! Per-connection protocol logic.
//!
//! The engine owns the join/leave choreography and routes decoded wire
//! messages, enforcing the write gate. Connections progress
//! `NEW → AUTHED → JOINED → GONE`; authentication itself happens in the
//! socket handler, everything after it here.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use burrow_core::crdt::WireMessage;

use crate::db::{PermissionStore, Role};
use crate::protocol::ServerEvent;
use crate::sync::registry::{DocRegistry, VaultRoom};
use crate::sync::session::{ClientHandle, ClientSession};

pub struct SyncEngine {
    registry: Arc<DocRegistry>,
    perms: PermissionStore,
    join_pacing: Duration,
}

impl SyncEngine {
    pub fn new(registry: Arc<DocRegistry>, perms: PermissionStore, join_pacing: Duration) -> Self {
        Self {
            registry,
            perms,
            join_pacing,
        }
    }

    pub fn registry(&self) -> &Arc<DocRegistry> {
        &self.registry
    }

    pub fn permissions(&self) -> &PermissionStore {
        &self.perms
    }

    /// Join an authenticated session to a vault.
    ///
    /// A memberless vault promotes the joiner to owner (legacy migration);
    /// otherwise a missing membership refuses the join with
    /// `permission-denied{action=join}`. On success the client receives, in
    /// order: `vault-joined`, the file list, SyncStep1, SyncStep2, and the
    /// current awareness state. The pacing delays between sync frames keep
    /// slow clients from coalescing them; they carry no semantics.
    pub async fn join(&self, session: &mut ClientSession, vault_id: &str) {
        let Some(user) = session.user.clone() else {
            session.send(ServerEvent::error("authenticate before joining a vault"));
            return;
        };
        if session.joined.is_some() {
            session.send(ServerEvent::error("already joined to a vault"));
            return;
        }

        let room = match self.registry.get_or_create(vault_id).await {
            Ok(room) => room,
            Err(e) => {
                warn!(vault = vault_id, error = %e, "join failed to load vault");
                session.send(ServerEvent::error(format!("cannot open vault: {}", e)));
                return;
            }
        };

        let role = match self.resolve_join_role(vault_id, user.id).await {
            Ok(Some(role)) => role,
            Ok(None) => {
                session.send(ServerEvent::permission_denied(
                    "join",
                    vault_id,
                    "not a member of this vault",
                ));
                return;
            }
            Err(message) => {
                session.send(ServerEvent::error(message));
                return;
            }
        };

        let handle = ClientHandle::new(session.conn_id, &user, role, session.sender());
        room.add_client(handle).await;
        session.joined = Some((vault_id.to_string(), role));

        session.send(ServerEvent::VaultJoined {
            vault_id: vault_id.to_string(),
            role,
        });
        session.send(ServerEvent::FileList {
            files: room.list_paths().await,
        });

        tokio::time::sleep(self.join_pacing).await;
        session.send(ServerEvent::SyncMessage {
            payload: WireMessage::SyncStep1(room.state_vector().await).encode(),
        });

        tokio::time::sleep(self.join_pacing).await;
        session.send(ServerEvent::SyncMessage {
            payload: WireMessage::SyncStep2(room.encode_state().await).encode(),
        });

        if let Some(payload) = room.awareness_snapshot().await {
            session.send(ServerEvent::SyncMessage { payload });
        }

        room.broadcast_except(
            Some(session.conn_id),
            ServerEvent::UserJoined {
                user_id: user.id,
                name: user.name.clone(),
                role,
            },
        )
        .await;

        let clients = room.client_count().await;
        debug!(
            vault = vault_id,
            user = user.id,
            role = %role,
            clients,
            "client joined vault"
        );
    }

    async fn resolve_join_role(
        &self,
        vault_id: &str,
        user_id: i64,
    ) -> Result<Option<Role>, String> {
        let has_members = self
            .perms
            .has_members(vault_id)
            .map_err(|e| format!("membership lookup failed: {}", e))?;

        if !has_members {
            // First joiner of a memberless vault becomes its owner.
            self.perms
                .set_owner(vault_id, user_id)
                .map_err(|e| format!("owner migration failed: {}", e))?;
            return Ok(Some(Role::Owner));
        }

        self.perms
            .get_role(user_id, vault_id)
            .map_err(|e| format!("role lookup failed: {}", e))
    }

    /// Leave the joined vault (explicit leave or disconnect).
    ///
    /// Removes the client, broadcasts the awareness removal and `user-left`,
    /// and flushes + evicts the vault when this was the last client.
    pub async fn leave(&self, session: &mut ClientSession) {
        let Some((vault_id, _)) = session.joined.take() else {
            return;
        };
        let Some(room) = self.registry.get(&vault_id).await else {
            return;
        };

        if let Some(handle) = room.remove_client(session.conn_id).await {
            let ids: Vec<u64> = handle.awareness_ids.iter().copied().collect();
            room.remove_awareness_clients(&ids).await;
            room.broadcast_except(
                None,
                ServerEvent::UserLeft {
                    user_id: handle.user_id,
                    name: handle.user_name.clone(),
                },
            )
            .await;
        }

        if room.client_count().await == 0 {
            self.registry.flush_and_evict(&vault_id).await;
        }
        debug!(vault = %vault_id, "client left vault");
    }

    /// Route one binary frame from a joined client.
    ///
    /// An undecodable frame is logged and dropped; the connection continues.
    pub async fn handle_frame(&self, session: &mut ClientSession, payload: &[u8]) {
        let Some((vault_id, _)) = session.joined.clone() else {
            session.send(ServerEvent::error("join a vault before syncing"));
            return;
        };
        let Some(room) = self.registry.get(&vault_id).await else {
            session.send(ServerEvent::error("vault is not loaded"));
            return;
        };

        let messages = match WireMessage::decode_all(payload) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(vault = %vault_id, error = %e, "dropping undecodable sync frame");
                return;
            }
        };

        for message in messages {
            self.handle_message(session, &vault_id, &room, message).await;
        }
    }

    async fn handle_message(
        &self,
        session: &mut ClientSession,
        vault_id: &str,
        room: &Arc<VaultRoom>,
        message: WireMessage,
    ) {
        if message.is_mutation() && !self.check_write_allowed(session, vault_id, room).await {
            session.send(ServerEvent::permission_denied(
                "write",
                vault_id,
                "viewers cannot modify the vault",
            ));
            return;
        }

        match message {
            WireMessage::SyncStep1(state_vector) => match room.step2_for(&state_vector).await {
                Ok(payload) => session.send(ServerEvent::SyncMessage { payload }),
                Err(e) => {
                    warn!(vault = vault_id, error = %e, "bad state vector; sending full state");
                    session.send(ServerEvent::SyncMessage {
                        payload: WireMessage::SyncStep2(room.encode_state().await).encode(),
                    });
                }
            },
            WireMessage::SyncStep2(update) | WireMessage::Update(update) => {
                if update.is_empty() {
                    return;
                }
                if let Err(e) = room.apply_mutation(&update, session.conn_id).await {
                    warn!(vault = vault_id, error = %e, "dropping unappliable update");
                }
            }
            WireMessage::Awareness(delta) => {
                match room.apply_awareness(&delta, session.conn_id).await {
                    Ok(seen) => room.record_awareness_ids(session.conn_id, &seen).await,
                    Err(e) => {
                        warn!(vault = vault_id, error = %e, "dropping undecodable awareness delta");
                    }
                }
            }
        }
    }

    /// Re-read the role before a mutation; push `vault-role` when it changed.
    ///
    /// A member demoted (or removed) mid-session becomes read-only before the
    /// next mutating message is applied.
    async fn check_write_allowed(
        &self,
        session: &mut ClientSession,
        vault_id: &str,
        room: &Arc<VaultRoom>,
    ) -> bool {
        let Some(user) = session.user.as_ref() else {
            return false;
        };

        let current = match self.perms.get_role(user.id, vault_id) {
            Ok(role) => role,
            Err(e) => {
                warn!(vault = vault_id, error = %e, "role refresh failed; refusing write");
                return false;
            }
        };

        let cached = session.joined.as_ref().map(|(_, role)| *role);
        if let Some(role) = current {
            if cached != Some(role) {
                session.joined = Some((vault_id.to_string(), role));
                room.update_cached_role(session.conn_id, role).await;
                session.send(ServerEvent::VaultRole {
                    vault_id: vault_id.to_string(),
                    role,
                });
            }
            role.can_write()
        } else {
            // Membership revoked mid-session.
            false
        }
    }
}
