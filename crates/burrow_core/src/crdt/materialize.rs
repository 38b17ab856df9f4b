//! Vault materialization — extract CRDT state into files.
//!
//! Extracts the current vault state into a list of [`FileEntry`] values.
//! Callers write these to the filesystem (the server's debounced sink does
//! this per changed path; full materialization is used by consistency checks
//! and tests).

use super::vault_doc::VaultDoc;

/// A single file extracted from CRDT state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Vault-relative path (e.g. `daily/note.md`).
    pub path: String,
    /// Full UTF-8 text content.
    pub content: String,
}

/// Materialize every file of the vault, sorted by path.
pub fn materialize_vault(doc: &VaultDoc) -> Vec<FileEntry> {
    doc.list_paths()
        .into_iter()
        .filter_map(|path| {
            doc.file_text(&path).map(|content| FileEntry {
                path: path.clone(),
                content,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_materialize_empty_vault() {
        let doc = VaultDoc::new();
        assert!(materialize_vault(&doc).is_empty());
    }

    #[test]
    fn test_materialize_sorted() {
        let doc = VaultDoc::new();
        doc.set_file_text("b.md", "two");
        doc.set_file_text("a.md", "one");
        doc.set_file_text("dir/c.md", "three");

        let files = materialize_vault(&doc);
        assert_eq!(files.len(), 3);
        assert_eq!(files[0].path, "a.md");
        assert_eq!(files[1].path, "b.md");
        assert_eq!(files[2].path, "dir/c.md");
        assert_eq!(files[0].content, "one");
    }

    #[test]
    fn test_materialize_after_snapshot_round_trip() {
        let doc = VaultDoc::new();
        doc.set_file_text("n.md", "abc");

        let restored = VaultDoc::from_snapshot(&doc.encode_state()).unwrap();
        assert_eq!(materialize_vault(&doc), materialize_vault(&restored));
    }
}
