//! Administrative boundary.
//!
//! Programmatic operations consumed by the external HTTP router: vault CRUD,
//! file access, member management, ownership transfer, and backups. Every
//! operation takes the already-authenticated actor and checks their role;
//! server admins bypass per-vault roles for everything except ownership
//! transfer, which only the current owner may invoke.
//!
//! File writes and deletes route through the live CRDT document so the
//! snapshot, the replicas, and the materialized files stay convergent; a
//! direct disk write would be invisible to connected editors.

use std::sync::Arc;

use serde::Serialize;

use crate::auth::AuthUser;
use crate::backup::{BackupScheduler, SnapshotInfo, SnapshotKind};
use crate::db::{Actor, Member, MemberError, PermissionStore, Role};
use crate::error::ApiError;
use crate::store::VaultStore;
use crate::sync::DocRegistry;

/// A vault as seen by one user.
#[derive(Debug, Clone, Serialize)]
pub struct VaultSummary {
    #[serde(rename = "vaultId")]
    pub vault_id: String,
    pub role: Option<Role>,
}

/// The core's administrative surface.
#[derive(Clone)]
pub struct CoreApi {
    registry: Arc<DocRegistry>,
    perms: PermissionStore,
    backups: BackupScheduler,
}

impl CoreApi {
    pub fn new(
        registry: Arc<DocRegistry>,
        perms: PermissionStore,
        backups: BackupScheduler,
    ) -> Self {
        Self {
            registry,
            perms,
            backups,
        }
    }

    fn store(&self) -> &VaultStore {
        self.registry.store()
    }

    /// Role gate; server admins pass unconditionally.
    fn require_role(&self, actor: &AuthUser, vault_id: &str, min: Role) -> Result<(), ApiError> {
        if actor.is_server_admin {
            return Ok(());
        }
        match self.perms.get_role(actor.id, vault_id)? {
            Some(role) if role >= min => Ok(()),
            Some(role) => Err(ApiError::Forbidden(format!(
                "requires {} or higher, has {}",
                min, role
            ))),
            None => Err(ApiError::Forbidden("not a member of this vault".into())),
        }
    }

    fn as_actor(&self, actor: &AuthUser) -> Actor {
        if actor.is_server_admin {
            Actor::System
        } else {
            Actor::User(actor.id)
        }
    }

    // ==================== Vaults ====================

    /// Create a vault; the creator becomes its owner.
    pub async fn create_vault(&self, actor: &AuthUser, vault_id: &str) -> Result<(), ApiError> {
        VaultStore::sanitize_vault_id(vault_id)?;
        self.store().create_vault(vault_id)?;
        self.perms.set_owner(vault_id, actor.id)?;
        Ok(())
    }

    /// Vaults visible to the actor: their memberships, or every vault on disk
    /// for a server admin.
    pub async fn list_vaults(&self, actor: &AuthUser) -> Result<Vec<VaultSummary>, ApiError> {
        if actor.is_server_admin {
            let mut vaults = Vec::new();
            for vault_id in self.store().list_vaults()? {
                let role = self.perms.get_role(actor.id, &vault_id)?;
                vaults.push(VaultSummary { vault_id, role });
            }
            return Ok(vaults);
        }
        Ok(self
            .perms
            .vaults_of(actor.id)?
            .into_iter()
            .map(|(vault_id, role)| VaultSummary {
                vault_id,
                role: Some(role),
            })
            .collect())
    }

    /// Delete a vault: membership rows first, then the directory, so no
    /// membership row ever refers to a missing vault directory.
    pub async fn delete_vault(&self, actor: &AuthUser, vault_id: &str) -> Result<(), ApiError> {
        self.require_role(actor, vault_id, Role::Owner)?;
        if !self.store().exists(vault_id) {
            return Err(ApiError::NotFound(format!("vault {}", vault_id)));
        }

        self.registry.evict_discard(vault_id).await;
        self.perms.remove_vault_members(vault_id)?;
        self.store().delete_vault(vault_id)?;
        Ok(())
    }

    // ==================== Files ====================

    pub async fn list_files(
        &self,
        actor: &AuthUser,
        vault_id: &str,
    ) -> Result<Vec<String>, ApiError> {
        self.require_role(actor, vault_id, Role::Viewer)?;
        let room = self.registry.get_or_create(vault_id).await?;
        Ok(room.list_paths().await)
    }

    pub async fn read_file(
        &self,
        actor: &AuthUser,
        vault_id: &str,
        path: &str,
    ) -> Result<String, ApiError> {
        self.require_role(actor, vault_id, Role::Viewer)?;
        self.store().resolve_path(vault_id, path)?;
        let room = self.registry.get_or_create(vault_id).await?;
        room.file_text(path)
            .await
            .ok_or_else(|| ApiError::NotFound(format!("file {}", path)))
    }

    pub async fn write_file(
        &self,
        actor: &AuthUser,
        vault_id: &str,
        path: &str,
        content: &str,
    ) -> Result<(), ApiError> {
        self.require_role(actor, vault_id, Role::Editor)?;
        self.store().resolve_path(vault_id, path)?;
        let room = self.registry.get_or_create(vault_id).await?;
        room.local_edit(path, content).await;
        Ok(())
    }

    pub async fn delete_file(
        &self,
        actor: &AuthUser,
        vault_id: &str,
        path: &str,
    ) -> Result<(), ApiError> {
        self.require_role(actor, vault_id, Role::Editor)?;
        self.store().resolve_path(vault_id, path)?;
        let room = self.registry.get_or_create(vault_id).await?;
        if !room.local_remove(path).await {
            return Err(ApiError::NotFound(format!("file {}", path)));
        }
        Ok(())
    }

    // ==================== Members ====================

    pub async fn list_members(
        &self,
        actor: &AuthUser,
        vault_id: &str,
    ) -> Result<Vec<Member>, ApiError> {
        self.require_role(actor, vault_id, Role::Viewer)?;
        Ok(self.perms.members(vault_id)?)
    }

    pub async fn add_member(
        &self,
        actor: &AuthUser,
        vault_id: &str,
        user_id: i64,
        role: Role,
    ) -> Result<(), ApiError> {
        if !self.store().exists(vault_id) {
            return Err(ApiError::NotFound(format!("vault {}", vault_id)));
        }
        self.perms
            .add_member(vault_id, user_id, role, self.as_actor(actor))?;
        Ok(())
    }

    pub async fn update_member_role(
        &self,
        actor: &AuthUser,
        vault_id: &str,
        user_id: i64,
        role: Role,
    ) -> Result<(), ApiError> {
        self.perms
            .update_role(vault_id, user_id, role, self.as_actor(actor))?;
        Ok(())
    }

    pub async fn remove_member(
        &self,
        actor: &AuthUser,
        vault_id: &str,
        user_id: i64,
    ) -> Result<(), ApiError> {
        self.perms
            .remove_member(vault_id, user_id, self.as_actor(actor))?;
        Ok(())
    }

    /// Ownership moves only by the current owner's hand, server admin or not.
    pub async fn transfer_ownership(
        &self,
        actor: &AuthUser,
        vault_id: &str,
        new_owner_id: i64,
    ) -> Result<(), ApiError> {
        match self.perms.transfer_ownership(vault_id, new_owner_id, actor.id) {
            Ok(()) => Ok(()),
            Err(MemberError::InsufficientRole) => Err(ApiError::Forbidden(
                "only the current owner may transfer ownership".into(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    // ==================== Backups ====================

    pub async fn list_backups(
        &self,
        actor: &AuthUser,
        vault_id: &str,
    ) -> Result<Vec<SnapshotInfo>, ApiError> {
        self.require_role(actor, vault_id, Role::Admin)?;
        Ok(self.backups.list_snapshots(vault_id)?)
    }

    /// Manual backup; the live room is flushed first so the snapshot carries
    /// the latest state.
    pub async fn create_backup(
        &self,
        actor: &AuthUser,
        vault_id: &str,
    ) -> Result<SnapshotInfo, ApiError> {
        self.require_role(actor, vault_id, Role::Admin)?;
        if let Some(room) = self.registry.get(vault_id).await {
            room.flush_files().await;
            room.flush(self.store())
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?;
        }
        Ok(self.backups.manual_snapshot(vault_id)?)
    }

    /// Restore a backup, then evict the live doc so the next join reloads
    /// the restored state from disk.
    pub async fn restore_backup(
        &self,
        actor: &AuthUser,
        vault_id: &str,
        kind: SnapshotKind,
        timestamp: &str,
    ) -> Result<(), ApiError> {
        self.require_role(actor, vault_id, Role::Admin)?;
        if let Some(room) = self.registry.get(vault_id).await {
            room.flush_files().await;
            room.flush(self.store())
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?;
        }
        self.backups.restore(vault_id, kind, timestamp)?;
        self.registry.evict_discard(vault_id).await;
        Ok(())
    }
}
