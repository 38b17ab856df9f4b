//! On-disk vault storage.
//!
//! Layout under the vaults root:
//!
//! ```text
//! vaults/<vaultId>/
//!     _state.ydoc         # binary CRDT snapshot
//!     <relative>/<file>   # materialized UTF-8 text files
//! ```
//!
//! Names starting with `_` or `.` are reserved and never enumerated as user
//! files. Every user-provided path goes through [`VaultStore::resolve_path`]
//! before it touches the filesystem; every file write is a temp-file +
//! `fsync` + rename so a crash never leaves a half-written file behind.

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use rand::Rng;
use thiserror::Error;
use tracing::warn;
use walkdir::WalkDir;

/// Filename of the binary CRDT snapshot inside a vault directory.
const SNAPSHOT_FILE: &str = "_state.ydoc";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid vault id: {0:?}")]
    InvalidVaultId(String),
    #[error("invalid path: {0:?}")]
    InvalidPath(String),
    #[error("vault already exists: {0}")]
    AlreadyExists(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Filesystem store for vault directories.
#[derive(Debug, Clone)]
pub struct VaultStore {
    root: PathBuf,
}

impl VaultStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// The vaults root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate a vault id: non-empty, `[A-Za-z0-9_-]+` only.
    pub fn sanitize_vault_id(vault_id: &str) -> Result<&str, StoreError> {
        if vault_id.is_empty()
            || !vault_id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(StoreError::InvalidVaultId(vault_id.to_string()));
        }
        Ok(vault_id)
    }

    fn vault_dir(&self, vault_id: &str) -> Result<PathBuf, StoreError> {
        Ok(self.root.join(Self::sanitize_vault_id(vault_id)?))
    }

    /// Resolve a user-provided relative path inside a vault.
    ///
    /// Rejects absolute paths, `..` segments, and anything that would resolve
    /// outside the vault directory.
    pub fn resolve_path(&self, vault_id: &str, rel_path: &str) -> Result<PathBuf, StoreError> {
        let vault_dir = self.vault_dir(vault_id)?;
        let trimmed = rel_path.trim_start_matches(['/', '\\']);
        if trimmed.is_empty() {
            return Err(StoreError::InvalidPath(rel_path.to_string()));
        }

        let candidate = Path::new(trimmed);
        if candidate.is_absolute() {
            return Err(StoreError::InvalidPath(rel_path.to_string()));
        }
        for component in candidate.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => return Err(StoreError::InvalidPath(rel_path.to_string())),
            }
        }

        let resolved = vault_dir.join(candidate);
        // The resolved path must stay under the vault directory even after
        // component filtering.
        if !resolved.starts_with(&vault_dir) {
            return Err(StoreError::InvalidPath(rel_path.to_string()));
        }
        Ok(resolved)
    }

    // ==================== Vault Lifecycle ====================

    /// Create a vault directory with an empty snapshot.
    pub fn create_vault(&self, vault_id: &str) -> Result<(), StoreError> {
        let dir = self.vault_dir(vault_id)?;
        if dir.exists() {
            return Err(StoreError::AlreadyExists(vault_id.to_string()));
        }
        fs::create_dir_all(&dir)?;
        atomic_write(&dir.join(SNAPSHOT_FILE), &[])?;
        Ok(())
    }

    /// True when the vault directory exists.
    pub fn exists(&self, vault_id: &str) -> bool {
        self.vault_dir(vault_id)
            .map(|dir| dir.is_dir())
            .unwrap_or(false)
    }

    /// Remove the vault directory and all its contents.
    ///
    /// The caller must have cascaded membership rows first.
    pub fn delete_vault(&self, vault_id: &str) -> Result<(), StoreError> {
        let dir = self.vault_dir(vault_id)?;
        if !dir.exists() {
            return Err(StoreError::NotFound(format!("vault {}", vault_id)));
        }
        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    /// All vault ids present on disk, sorted.
    pub fn list_vaults(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if Self::sanitize_vault_id(name).is_ok() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    // ==================== Snapshot ====================

    /// Load the binary CRDT snapshot; empty bytes when none exists yet.
    pub fn load_snapshot(&self, vault_id: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.vault_dir(vault_id)?.join(SNAPSHOT_FILE);
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically replace the binary CRDT snapshot.
    pub fn save_snapshot(&self, vault_id: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let dir = self.vault_dir(vault_id)?;
        fs::create_dir_all(&dir)?;
        atomic_write(&dir.join(SNAPSHOT_FILE), bytes)?;
        Ok(())
    }

    // ==================== Files ====================

    /// All user files of a vault as sorted vault-relative slash paths.
    ///
    /// Reserved names (leading `_` or `.` in any component) are skipped.
    pub fn list_files(&self, vault_id: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.vault_dir(vault_id)?;
        if !dir.is_dir() {
            return Err(StoreError::NotFound(format!("vault {}", vault_id)));
        }

        let mut files = Vec::new();
        let walker = WalkDir::new(&dir).into_iter().filter_entry(|entry| {
            entry.depth() == 0 || !is_reserved_name(entry.file_name().to_string_lossy().as_ref())
        });
        for entry in walker {
            let entry = entry.map_err(|e| StoreError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&dir)
                .expect("walkdir yields paths under its root");
            files.push(rel_to_slash(rel));
        }
        files.sort();
        Ok(files)
    }

    /// Read a user file as UTF-8 text.
    pub fn read_file(&self, vault_id: &str, rel_path: &str) -> Result<String, StoreError> {
        let path = self.resolve_path(vault_id, rel_path)?;
        match fs::read_to_string(&path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(format!("file {}", rel_path)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically write a user file, creating parent directories.
    pub fn write_file(
        &self,
        vault_id: &str,
        rel_path: &str,
        content: &str,
    ) -> Result<(), StoreError> {
        let path = self.resolve_path(vault_id, rel_path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        atomic_write(&path, content.as_bytes())?;
        Ok(())
    }

    /// Delete a user file. A missing file is not an error.
    pub fn delete_file(&self, vault_id: &str, rel_path: &str) -> Result<(), StoreError> {
        let path = self.resolve_path(vault_id, rel_path)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically rename a user file, creating parents of the new path.
    pub fn rename_file(
        &self,
        vault_id: &str,
        old_path: &str,
        new_path: &str,
    ) -> Result<(), StoreError> {
        let from = self.resolve_path(vault_id, old_path)?;
        let to = self.resolve_path(vault_id, new_path)?;
        if !from.exists() {
            return Err(StoreError::NotFound(format!("file {}", old_path)));
        }
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&from, &to)?;
        Ok(())
    }
}

/// True for reserved names that are never user files.
fn is_reserved_name(name: &str) -> bool {
    name.starts_with('_') || name.starts_with('.')
}

fn rel_to_slash(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Write `bytes` to `path` via a unique fsync'd temp sibling plus rename.
///
/// On any failure the temp file is removed best-effort and the prior file is
/// left intact.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    let nonce: u32 = rand::thread_rng().gen();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let tmp = path.with_file_name(format!("{}.{:08x}.tmp", file_name, nonce));

    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        if let Err(cleanup) = fs::remove_file(&tmp) {
            if cleanup.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove temp file {}: {}", tmp.display(), cleanup);
            }
        }
    }
    result
}
