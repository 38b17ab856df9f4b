use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Vault role, ordered by rank: viewer < editor < admin < owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Editor,
    Admin,
    Owner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Editor => "editor",
            Role::Admin => "admin",
            Role::Owner => "owner",
        }
    }

    /// Parse a stored or user-provided role string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "viewer" => Some(Role::Viewer),
            "editor" => Some(Role::Editor),
            "admin" => Some(Role::Admin),
            "owner" => Some(Role::Owner),
            _ => None,
        }
    }

    /// Roles that may apply document mutations.
    pub fn can_write(&self) -> bool {
        *self >= Role::Editor
    }

    /// Roles that may manage members.
    pub fn can_manage(&self) -> bool {
        *self >= Role::Admin
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is performing a membership mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    /// Internal callers (vault creation, first-join migration).
    System,
    User(i64),
}

/// A membership row joined with the user's name.
#[derive(Debug, Clone, Serialize)]
pub struct Member {
    pub vault_id: String,
    pub user_id: i64,
    pub user_name: String,
    pub role: Role,
    pub added_by: Option<i64>,
    pub created_at: i64,
}

/// Membership mutation outcomes that are not plain success.
#[derive(Debug, Error)]
pub enum MemberError {
    #[error("user is already a member")]
    AlreadyMember,
    #[error("vault already has an owner")]
    AlreadyOwned,
    #[error("invalid role: {0}")]
    InvalidRole(String),
    #[error("the owner cannot be removed")]
    IsOwner,
    #[error("the owner role is only assigned through ownership transfer")]
    IsOwnerAssignment,
    #[error("actors cannot target themselves")]
    CannotSelf,
    #[error("membership not found")]
    NotFound,
    #[error("target user is not a member")]
    NotMember,
    #[error("actor role is insufficient")]
    InsufficientRole,
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

/// Persistent store of per-(vault, user) roles.
///
/// Mutations that span several rows run in a single transaction and roll back
/// on any failure. Role-assignment rules: an actor may only assign roles, and
/// modify targets, strictly below their own; `owner` moves only through
/// [`transfer_ownership`](Self::transfer_ownership) or the internal
/// [`set_owner`](Self::set_owner) seed.
#[derive(Clone)]
pub struct PermissionStore {
    conn: Arc<Mutex<Connection>>,
}

impl PermissionStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Share the underlying connection (used by the token verifier).
    pub fn shared_conn(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    // ===== User rows (consumed from the external auth service) =====

    /// Insert or update a user row.
    pub fn ensure_user(
        &self,
        user_id: i64,
        name: &str,
        is_server_admin: bool,
    ) -> Result<(), MemberError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO users (id, name, is_server_admin) VALUES (?1, ?2, ?3) \
             ON CONFLICT(id) DO UPDATE SET name = ?2, is_server_admin = ?3",
            params![user_id, name, is_server_admin as i64],
        )?;
        Ok(())
    }

    /// Delete a user; memberships cascade.
    pub fn delete_user(&self, user_id: i64) -> Result<(), MemberError> {
        let conn = self.lock();
        conn.execute("DELETE FROM users WHERE id = ?", [user_id])?;
        Ok(())
    }

    // ===== Queries =====

    /// Role of a user in a vault, if any.
    pub fn get_role(&self, user_id: i64, vault_id: &str) -> Result<Option<Role>, MemberError> {
        let conn = self.lock();
        role_of(&conn, vault_id, user_id)
    }

    /// True when the user's role is at least `min_role`.
    pub fn has_role_or_higher(
        &self,
        user_id: i64,
        vault_id: &str,
        min_role: Role,
    ) -> Result<bool, MemberError> {
        Ok(self
            .get_role(user_id, vault_id)?
            .is_some_and(|role| role >= min_role))
    }

    /// True when the vault has at least one member.
    pub fn has_members(&self, vault_id: &str) -> Result<bool, MemberError> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM vault_members WHERE vault_id = ?",
            [vault_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// All members of a vault, owner first, then by rank and name.
    pub fn members(&self, vault_id: &str) -> Result<Vec<Member>, MemberError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT m.vault_id, m.user_id, u.name, m.role, m.added_by, m.created_at \
             FROM vault_members m JOIN users u ON u.id = m.user_id \
             WHERE m.vault_id = ? \
             ORDER BY CASE m.role \
                 WHEN 'owner' THEN 0 WHEN 'admin' THEN 1 \
                 WHEN 'editor' THEN 2 ELSE 3 END, u.name",
        )?;
        let rows = stmt.query_map([vault_id], |row| {
            let role_str: String = row.get(3)?;
            Ok(Member {
                vault_id: row.get(0)?,
                user_id: row.get(1)?,
                user_name: row.get(2)?,
                role: Role::parse(&role_str).unwrap_or(Role::Viewer),
                added_by: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        Ok(rows.filter_map(Result::ok).collect())
    }

    /// All vaults a user belongs to, with their role in each.
    pub fn vaults_of(&self, user_id: i64) -> Result<Vec<(String, Role)>, MemberError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT vault_id, role FROM vault_members WHERE user_id = ? ORDER BY vault_id",
        )?;
        let rows = stmt.query_map([user_id], |row| {
            let vault_id: String = row.get(0)?;
            let role_str: String = row.get(1)?;
            Ok((vault_id, role_str))
        })?;
        Ok(rows
            .filter_map(Result::ok)
            .filter_map(|(vault_id, role)| Role::parse(&role).map(|r| (vault_id, r)))
            .collect())
    }

    // ===== Mutations =====

    /// Add a member with the given role.
    ///
    /// A user actor needs a managing role and may only assign roles strictly
    /// below their own. `owner` is never assignable here.
    pub fn add_member(
        &self,
        vault_id: &str,
        user_id: i64,
        role: Role,
        actor: Actor,
    ) -> Result<(), MemberError> {
        if role == Role::Owner {
            return Err(MemberError::IsOwnerAssignment);
        }

        let mut conn = self.lock();
        let tx = conn.transaction()?;

        if let Actor::User(actor_id) = actor {
            let actor_role = role_of(&tx, vault_id, actor_id)?.ok_or(MemberError::InsufficientRole)?;
            if !actor_role.can_manage() || role >= actor_role {
                return Err(MemberError::InsufficientRole);
            }
        }

        if role_of(&tx, vault_id, user_id)?.is_some() {
            return Err(MemberError::AlreadyMember);
        }

        let added_by = match actor {
            Actor::System => None,
            Actor::User(id) => Some(id),
        };
        tx.execute(
            "INSERT INTO vault_members (vault_id, user_id, role, added_by, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![vault_id, user_id, role.as_str(), added_by, Utc::now().timestamp()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Remove a member. The owner cannot be removed, actors cannot remove
    /// themselves, and the target must rank strictly below a user actor.
    pub fn remove_member(
        &self,
        vault_id: &str,
        user_id: i64,
        actor: Actor,
    ) -> Result<(), MemberError> {
        if actor == Actor::User(user_id) {
            return Err(MemberError::CannotSelf);
        }

        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let target_role = role_of(&tx, vault_id, user_id)?.ok_or(MemberError::NotFound)?;
        if target_role == Role::Owner {
            return Err(MemberError::IsOwner);
        }

        if let Actor::User(actor_id) = actor {
            let actor_role =
                role_of(&tx, vault_id, actor_id)?.ok_or(MemberError::InsufficientRole)?;
            if !actor_role.can_manage() || target_role >= actor_role {
                return Err(MemberError::InsufficientRole);
            }
        }

        tx.execute(
            "DELETE FROM vault_members WHERE vault_id = ?1 AND user_id = ?2",
            params![vault_id, user_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Change a member's role. Both the target's current role and the new
    /// role must rank strictly below a user actor's.
    pub fn update_role(
        &self,
        vault_id: &str,
        user_id: i64,
        new_role: Role,
        actor: Actor,
    ) -> Result<(), MemberError> {
        if new_role == Role::Owner {
            return Err(MemberError::IsOwnerAssignment);
        }

        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let target_role = role_of(&tx, vault_id, user_id)?.ok_or(MemberError::NotFound)?;
        if target_role == Role::Owner {
            return Err(MemberError::InsufficientRole);
        }
        if let Actor::User(actor_id) = actor {
            let actor_role =
                role_of(&tx, vault_id, actor_id)?.ok_or(MemberError::InsufficientRole)?;
            if !actor_role.can_manage() || target_role >= actor_role || new_role >= actor_role {
                return Err(MemberError::InsufficientRole);
            }
        }

        tx.execute(
            "UPDATE vault_members SET role = ?1 WHERE vault_id = ?2 AND user_id = ?3",
            params![new_role.as_str(), vault_id, user_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Atomically demote the current owner to admin and promote the new owner.
    ///
    /// Rejects self-transfer, a non-owner actor, and a non-member target.
    /// Both updates run in one transaction; any failure rolls back.
    pub fn transfer_ownership(
        &self,
        vault_id: &str,
        new_owner_id: i64,
        current_owner_id: i64,
    ) -> Result<(), MemberError> {
        self.transfer_ownership_inner(vault_id, new_owner_id, current_owner_id, false)
    }

    fn transfer_ownership_inner(
        &self,
        vault_id: &str,
        new_owner_id: i64,
        current_owner_id: i64,
        fail_midway: bool,
    ) -> Result<(), MemberError> {
        if new_owner_id == current_owner_id {
            return Err(MemberError::CannotSelf);
        }

        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let actor_role =
            role_of(&tx, vault_id, current_owner_id)?.ok_or(MemberError::InsufficientRole)?;
        if actor_role != Role::Owner {
            return Err(MemberError::InsufficientRole);
        }
        role_of(&tx, vault_id, new_owner_id)?.ok_or(MemberError::NotMember)?;

        tx.execute(
            "UPDATE vault_members SET role = 'admin' WHERE vault_id = ?1 AND user_id = ?2",
            params![vault_id, current_owner_id],
        )?;

        if fail_midway {
            // Dropping the transaction without commit rolls back the demotion.
            return Err(MemberError::Db(rusqlite::Error::QueryReturnedNoRows));
        }

        tx.execute(
            "UPDATE vault_members SET role = 'owner' WHERE vault_id = ?1 AND user_id = ?2",
            params![vault_id, new_owner_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Seed the owner of a vault.
    ///
    /// Internal use only: vault creation and the first-join migration of a
    /// memberless vault. Idempotent when the user already owns the vault;
    /// upgrades the user when the vault has no owner yet; fails with
    /// [`MemberError::AlreadyOwned`] when someone else owns it.
    pub fn set_owner(&self, vault_id: &str, user_id: i64) -> Result<(), MemberError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let owner: Option<i64> = tx
            .query_row(
                "SELECT user_id FROM vault_members WHERE vault_id = ? AND role = 'owner'",
                [vault_id],
                |row| row.get(0),
            )
            .optional()?;

        match owner {
            Some(existing) if existing == user_id => return Ok(()),
            Some(_) => return Err(MemberError::AlreadyOwned),
            None => {}
        }

        if role_of(&tx, vault_id, user_id)?.is_some() {
            tx.execute(
                "UPDATE vault_members SET role = 'owner' WHERE vault_id = ?1 AND user_id = ?2",
                params![vault_id, user_id],
            )?;
        } else {
            tx.execute(
                "INSERT INTO vault_members (vault_id, user_id, role, added_by, created_at) \
                 VALUES (?1, ?2, 'owner', NULL, ?3)",
                params![vault_id, user_id, Utc::now().timestamp()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Remove every membership of a vault (vault-deletion cascade).
    pub fn remove_vault_members(&self, vault_id: &str) -> Result<(), MemberError> {
        let conn = self.lock();
        conn.execute("DELETE FROM vault_members WHERE vault_id = ?", [vault_id])?;
        Ok(())
    }
}

fn role_of(
    conn: &Connection,
    vault_id: &str,
    user_id: i64,
) -> Result<Option<Role>, MemberError> {
    let role: Option<String> = conn
        .query_row(
            "SELECT role FROM vault_members WHERE vault_id = ?1 AND user_id = ?2",
            params![vault_id, user_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(role.and_then(|r| Role::parse(&r)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_database;

    fn store() -> PermissionStore {
        let conn = Connection::open_in_memory().unwrap();
        init_database(&conn).unwrap();
        let store = PermissionStore::new(conn);
        store.ensure_user(1, "ada", false).unwrap();
        store.ensure_user(2, "grace", false).unwrap();
        store.ensure_user(3, "alan", false).unwrap();
        store
    }

    #[test]
    fn test_role_ordering() {
        assert!(Role::Viewer < Role::Editor);
        assert!(Role::Editor < Role::Admin);
        assert!(Role::Admin < Role::Owner);
        assert!(Role::Editor.can_write());
        assert!(!Role::Viewer.can_write());
        assert!(Role::Admin.can_manage());
        assert!(!Role::Editor.can_manage());
    }

    #[test]
    fn test_role_parse_round_trip() {
        for role in [Role::Viewer, Role::Editor, Role::Admin, Role::Owner] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("superuser"), None);
    }

    #[test]
    fn test_set_owner_and_get_role() {
        let store = store();
        store.set_owner("v1", 1).unwrap();
        assert_eq!(store.get_role(1, "v1").unwrap(), Some(Role::Owner));
        assert!(store.has_role_or_higher(1, "v1", Role::Admin).unwrap());
        assert!(store.has_members("v1").unwrap());
        assert_eq!(store.get_role(2, "v1").unwrap(), None);
    }

    #[test]
    fn test_set_owner_idempotent_and_conflicting() {
        let store = store();
        store.set_owner("v1", 1).unwrap();
        store.set_owner("v1", 1).unwrap();
        assert!(matches!(
            store.set_owner("v1", 2),
            Err(MemberError::AlreadyOwned)
        ));
    }

    #[test]
    fn test_set_owner_upgrades_existing_member() {
        let store = store();
        store.set_owner("v1", 1).unwrap();
        store
            .add_member("v1", 2, Role::Admin, Actor::User(1))
            .unwrap();
        // Simulate an ownerless vault left by a legacy migration.
        store.remove_vault_members("v1").unwrap();
        store
            .add_member("v1", 2, Role::Editor, Actor::System)
            .unwrap();
        store.set_owner("v1", 2).unwrap();
        assert_eq!(store.get_role(2, "v1").unwrap(), Some(Role::Owner));
    }

    #[test]
    fn test_add_member_rules() {
        let store = store();
        store.set_owner("v1", 1).unwrap();
        store
            .add_member("v1", 2, Role::Editor, Actor::User(1))
            .unwrap();

        // Duplicate
        assert!(matches!(
            store.add_member("v1", 2, Role::Viewer, Actor::User(1)),
            Err(MemberError::AlreadyMember)
        ));
        // Owner is never assignable
        assert!(matches!(
            store.add_member("v1", 3, Role::Owner, Actor::User(1)),
            Err(MemberError::IsOwnerAssignment)
        ));
        // Editors cannot manage members
        assert!(matches!(
            store.add_member("v1", 3, Role::Viewer, Actor::User(2)),
            Err(MemberError::InsufficientRole)
        ));
        // Non-members cannot manage members
        assert!(matches!(
            store.add_member("v1", 3, Role::Viewer, Actor::User(3)),
            Err(MemberError::InsufficientRole)
        ));
    }

    #[test]
    fn test_admin_cannot_assign_admin() {
        let store = store();
        store.set_owner("v1", 1).unwrap();
        store
            .add_member("v1", 2, Role::Admin, Actor::User(1))
            .unwrap();
        // Strictly-below rule: admin may assign editor/viewer, not admin.
        assert!(matches!(
            store.add_member("v1", 3, Role::Admin, Actor::User(2)),
            Err(MemberError::InsufficientRole)
        ));
        store
            .add_member("v1", 3, Role::Editor, Actor::User(2))
            .unwrap();
    }

    #[test]
    fn test_remove_member_rules() {
        let store = store();
        store.set_owner("v1", 1).unwrap();
        store
            .add_member("v1", 2, Role::Admin, Actor::User(1))
            .unwrap();
        store
            .add_member("v1", 3, Role::Editor, Actor::User(1))
            .unwrap();

        assert!(matches!(
            store.remove_member("v1", 1, Actor::User(2)),
            Err(MemberError::IsOwner)
        ));
        assert!(matches!(
            store.remove_member("v1", 2, Actor::User(2)),
            Err(MemberError::CannotSelf)
        ));
        // Editor cannot remove an admin
        assert!(matches!(
            store.remove_member("v1", 2, Actor::User(3)),
            Err(MemberError::InsufficientRole)
        ));
        store.remove_member("v1", 3, Actor::User(2)).unwrap();
        assert_eq!(store.get_role(3, "v1").unwrap(), None);
        assert!(matches!(
            store.remove_member("v1", 3, Actor::User(2)),
            Err(MemberError::NotFound)
        ));
    }

    #[test]
    fn test_update_role_rules() {
        let store = store();
        store.set_owner("v1", 1).unwrap();
        store
            .add_member("v1", 2, Role::Admin, Actor::User(1))
            .unwrap();
        store
            .add_member("v1", 3, Role::Viewer, Actor::User(1))
            .unwrap();

        store.update_role("v1", 3, Role::Editor, Actor::User(2)).unwrap();
        assert_eq!(store.get_role(3, "v1").unwrap(), Some(Role::Editor));

        assert!(matches!(
            store.update_role("v1", 3, Role::Owner, Actor::User(1)),
            Err(MemberError::IsOwnerAssignment)
        ));
        // Admin cannot promote to admin (not strictly below)
        assert!(matches!(
            store.update_role("v1", 3, Role::Admin, Actor::User(2)),
            Err(MemberError::InsufficientRole)
        ));
        // Admin cannot touch the owner
        assert!(matches!(
            store.update_role("v1", 1, Role::Editor, Actor::User(2)),
            Err(MemberError::InsufficientRole)
        ));
        assert!(matches!(
            store.update_role("v1", 99, Role::Editor, Actor::User(1)),
            Err(MemberError::NotFound)
        ));
    }

    #[test]
    fn test_transfer_ownership() {
        let store = store();
        store.set_owner("v1", 1).unwrap();
        store
            .add_member("v1", 2, Role::Admin, Actor::User(1))
            .unwrap();

        store.transfer_ownership("v1", 2, 1).unwrap();
        assert_eq!(store.get_role(2, "v1").unwrap(), Some(Role::Owner));
        assert_eq!(store.get_role(1, "v1").unwrap(), Some(Role::Admin));

        // Exactly one owner remains.
        let owners = store
            .members("v1")
            .unwrap()
            .into_iter()
            .filter(|m| m.role == Role::Owner)
            .count();
        assert_eq!(owners, 1);
    }

    #[test]
    fn test_transfer_ownership_rejections() {
        let store = store();
        store.set_owner("v1", 1).unwrap();
        store
            .add_member("v1", 2, Role::Admin, Actor::User(1))
            .unwrap();

        assert!(matches!(
            store.transfer_ownership("v1", 1, 1),
            Err(MemberError::CannotSelf)
        ));
        assert!(matches!(
            store.transfer_ownership("v1", 1, 2),
            Err(MemberError::InsufficientRole)
        ));
        assert!(matches!(
            store.transfer_ownership("v1", 3, 1),
            Err(MemberError::NotMember)
        ));
    }

    #[test]
    fn test_transfer_ownership_mid_transaction_failure_rolls_back() {
        let store = store();
        store.set_owner("v1", 1).unwrap();
        store
            .add_member("v1", 2, Role::Admin, Actor::User(1))
            .unwrap();

        let result = store.transfer_ownership_inner("v1", 2, 1, true);
        assert!(result.is_err());

        // Pre-state unchanged: 1 still owner, 2 still admin.
        assert_eq!(store.get_role(1, "v1").unwrap(), Some(Role::Owner));
        assert_eq!(store.get_role(2, "v1").unwrap(), Some(Role::Admin));
    }

    #[test]
    fn test_members_listing_order() {
        let store = store();
        store.set_owner("v1", 2).unwrap();
        store
            .add_member("v1", 1, Role::Viewer, Actor::User(2))
            .unwrap();
        store
            .add_member("v1", 3, Role::Admin, Actor::User(2))
            .unwrap();

        let members = store.members("v1").unwrap();
        assert_eq!(members.len(), 3);
        assert_eq!(members[0].role, Role::Owner);
        assert_eq!(members[0].user_name, "grace");
        assert_eq!(members[1].role, Role::Admin);
        assert_eq!(members[2].role, Role::Viewer);
    }

    #[test]
    fn test_vaults_of() {
        let store = store();
        store.set_owner("v1", 1).unwrap();
        store.set_owner("v2", 2).unwrap();
        store
            .add_member("v2", 1, Role::Viewer, Actor::User(2))
            .unwrap();

        let vaults = store.vaults_of(1).unwrap();
        assert_eq!(
            vaults,
            vec![
                ("v1".to_string(), Role::Owner),
                ("v2".to_string(), Role::Viewer)
            ]
        );
    }

    #[test]
    fn test_remove_vault_members_cascade() {
        let store = store();
        store.set_owner("v1", 1).unwrap();
        store
            .add_member("v1", 2, Role::Editor, Actor::User(1))
            .unwrap();
        store.remove_vault_members("v1").unwrap();
        assert!(!store.has_members("v1").unwrap());
    }

    #[test]
    fn test_delete_user_cascades() {
        let store = store();
        store.set_owner("v1", 1).unwrap();
        store
            .add_member("v1", 2, Role::Editor, Actor::User(1))
            .unwrap();
        store.delete_user(2).unwrap();
        assert_eq!(store.get_role(2, "v1").unwrap(), None);
    }
}
