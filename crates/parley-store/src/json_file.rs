//! One JSON file per document.
//!
//! Every save rewrites the whole file. The write goes to a sibling temp file
//! first and is then renamed over the target, so a crash mid-write leaves the
//! previous version intact.

use std::fs;
use std::path::PathBuf;

use crate::error::{Result, StoreError};
use crate::DocumentStore;

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Use `dir` for document files, creating it if missing.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        tracing::info!(path = %dir.display(), "JSON document store initialized");
        Ok(Self { dir })
    }

    /// Path of the file backing `key`. Keys may only contain ASCII
    /// alphanumerics, `_` and `-`.
    pub fn document_path(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl DocumentStore for JsonFileStore {
    fn load_raw(&self, key: &str) -> Result<Option<String>> {
        let path = self.document_path(key)?;
        if !path.exists() {
            return Ok(None);
        }
        let body = fs::read_to_string(&path)?;
        tracing::debug!(key, bytes = body.len(), "loaded document");
        Ok(Some(body))
    }

    fn save_raw(&self, key: &str, body: &str) -> Result<()> {
        let path = self.document_path(key)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &path)?;
        tracing::debug!(key, bytes = body.len(), "saved document");
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (JsonFileStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path().join("data")).unwrap();
        (store, dir)
    }

    #[test]
    fn test_missing_document_is_none() {
        let (store, _dir) = test_store();
        assert_eq!(store.load_raw("broadcast_history").unwrap(), None);
    }

    #[test]
    fn test_save_and_load() {
        let (store, _dir) = test_store();
        store.save_raw("broadcast_history", "[1,2,3]").unwrap();
        assert_eq!(
            store.load_raw("broadcast_history").unwrap().as_deref(),
            Some("[1,2,3]")
        );
        let path = store.document_path("broadcast_history").unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_rejects_path_like_keys() {
        let (store, _dir) = test_store();
        assert!(matches!(
            store.save_raw("../escape", "{}"),
            Err(StoreError::InvalidKey(_))
        ));
        assert!(store.load_raw("a/b").is_err());
        assert!(store.load_raw("").is_err());
    }
}
