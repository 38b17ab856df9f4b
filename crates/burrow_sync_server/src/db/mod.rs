//! SQLite-backed persistence for users, auth tokens, and vault memberships.

mod permissions;
mod schema;

pub use permissions::{Actor, Member, MemberError, PermissionStore, Role};
pub use schema::init_database;
