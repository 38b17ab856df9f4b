//! Error taxonomy at the administrative boundary.

use thiserror::Error;

use crate::backup::BackupError;
use crate::db::MemberError;
use crate::store::StoreError;

/// Errors surfaced to the external HTTP router and other callers of
/// [`crate::api::CoreApi`].
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// Authenticated but the role is insufficient.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Unknown vault, file, membership, or backup.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate vault, duplicate membership, already-owned vault.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Bad path, vault id, role, or self-targeted mutation.
    #[error("invalid: {0}")]
    Invalid(String),

    /// Disk or database failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidVaultId(v) => ApiError::Invalid(format!("vault id {:?}", v)),
            StoreError::InvalidPath(p) => ApiError::Invalid(format!("path {:?}", p)),
            StoreError::AlreadyExists(v) => ApiError::Conflict(format!("vault {} exists", v)),
            StoreError::NotFound(what) => ApiError::NotFound(what),
            StoreError::Io(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<MemberError> for ApiError {
    fn from(err: MemberError) -> Self {
        match err {
            MemberError::AlreadyMember => ApiError::Conflict("already a member".into()),
            MemberError::AlreadyOwned => ApiError::Conflict("vault already has an owner".into()),
            MemberError::InvalidRole(r) => ApiError::Invalid(format!("role {:?}", r)),
            MemberError::IsOwner => ApiError::Invalid("cannot remove the owner".into()),
            MemberError::IsOwnerAssignment => {
                ApiError::Invalid("owner role moves only via ownership transfer".into())
            }
            MemberError::CannotSelf => ApiError::Invalid("cannot target yourself".into()),
            MemberError::NotFound => ApiError::NotFound("membership".into()),
            MemberError::NotMember => ApiError::NotFound("target is not a member".into()),
            MemberError::InsufficientRole => ApiError::Forbidden("insufficient role".into()),
            MemberError::Db(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<BackupError> for ApiError {
    fn from(err: BackupError) -> Self {
        match err {
            BackupError::UnknownVault(v) => ApiError::NotFound(format!("vault {}", v)),
            BackupError::UnknownSnapshot(s) => ApiError::NotFound(format!("backup {}", s)),
            BackupError::Io(e) => ApiError::Internal(e.to_string()),
        }
    }
}
