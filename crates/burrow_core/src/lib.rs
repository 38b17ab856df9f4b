//! Core library for Burrow.
//!
//! This crate holds everything about a vault's replicated state that does not
//! touch the network or the filesystem: the CRDT document model
//! ([`crdt::VaultDoc`]), the awareness set ([`crdt::VaultAwareness`]), the
//! binary wire codec ([`crdt::wire`]), and materialization of CRDT state into
//! plain text files ([`crdt::materialize`]).
//!
//! The server crate (`burrow_sync_server`) composes these into the live
//! collaboration engine.

pub mod crdt;
pub mod error;

pub use error::CrdtError;
