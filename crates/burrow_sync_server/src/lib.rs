//! Burrow sync server.
//!
//! Hosts shared note vaults and keeps every connected editor in sync in real
//! time. Clients replicate a per-vault CRDT document, exchange binary sync
//! messages over WebSockets, and the server persists snapshots, materializes
//! plain-text files, enforces vault roles, and takes periodic backups.

pub mod api;
pub mod auth;
pub mod backup;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod protocol;
pub mod store;
pub mod sync;
