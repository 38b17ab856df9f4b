//! Error types for CRDT state handling.

use thiserror::Error;

/// Errors produced while decoding, applying, or encoding CRDT state.
#[derive(Debug, Error)]
pub enum CrdtError {
    /// A binary payload could not be decoded.
    #[error("failed to decode CRDT payload: {0}")]
    Decode(String),

    /// A decoded update could not be applied to the document.
    #[error("failed to apply CRDT update: {0}")]
    Apply(String),

    /// A wire frame was malformed (unknown tag, truncated payload).
    #[error("malformed sync frame: {0}")]
    Frame(String),
}
