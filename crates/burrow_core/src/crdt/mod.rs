//! CRDT state model for vaults.
//!
//! A vault is a single Y document whose root map `files` maps vault-relative
//! paths to collaborative text sequences. Alongside the document lives an
//! ephemeral awareness set (cursor positions, active file, user presence)
//! that is relayed between clients but never persisted.

pub mod awareness;
pub mod materialize;
pub mod vault_doc;
pub mod wire;

pub use awareness::VaultAwareness;
pub use materialize::{materialize_vault, FileEntry};
pub use vault_doc::{FileChange, FileChangeKind, VaultDoc};
pub use wire::WireMessage;
