//! # parley-store
//!
//! Persistence adapter for the chat coordinator.
//!
//! State is kept as a handful of logical JSON documents (broadcast history,
//! private threads, unread counters, block lists). Every backend implements
//! [`DocumentStore`]: load a whole document by key at startup, replace it
//! whole on every change. Callers never see which backend is in use.

pub mod database;
pub mod json_file;
pub mod memory;
pub mod migrations;

mod error;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use directories::ProjectDirs;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use database::SqliteStore;
pub use error::{Result, StoreError};
pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

/// Key-value store of JSON documents.
pub trait DocumentStore: Send + Sync {
    /// Raw JSON body of `key`, or `None` if it was never saved.
    fn load_raw(&self, key: &str) -> Result<Option<String>>;

    /// Replace the body of `key`.
    fn save_raw(&self, key: &str, body: &str) -> Result<()>;

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}

impl dyn DocumentStore {
    /// Load and decode a document.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.load_raw(key)? {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    /// Encode and save a document.
    pub fn save<T: Serialize + ?Sized>(&self, key: &str, doc: &T) -> Result<()> {
        let body = serde_json::to_string_pretty(doc)?;
        self.save_raw(key, &body)
    }
}

/// Which backend to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Json,
    Sqlite,
    Memory,
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown storage backend: {other}")),
        }
    }
}

impl Backend {
    /// Open the backend rooted at `data_dir` (ignored for `Memory`).
    pub fn open(self, data_dir: &Path) -> Result<Arc<dyn DocumentStore>> {
        let store: Arc<dyn DocumentStore> = match self {
            Self::Json => Arc::new(JsonFileStore::open(data_dir)?),
            Self::Sqlite => Arc::new(SqliteStore::open_in(data_dir)?),
            Self::Memory => Arc::new(MemoryStore::new()),
        };
        Ok(store)
    }
}

/// Platform data directory for the server:
/// - Linux:   `~/.local/share/parley`
/// - macOS:   `~/Library/Application Support/dev.parley.parley`
/// - Windows: `{FOLDERID_RoamingAppData}\parley\parley\data`
pub fn default_data_dir() -> Result<PathBuf> {
    let project_dirs = ProjectDirs::from("dev", "parley", "parley").ok_or(StoreError::NoDataDir)?;
    Ok(project_dirs.data_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doc {
        items: Vec<String>,
    }

    #[test]
    fn typed_round_trip_through_trait_object() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        assert_eq!(store.load::<Doc>("doc").unwrap(), None);

        let doc = Doc {
            items: vec!["a".into(), "b".into()],
        };
        store.save("doc", &doc).unwrap();
        assert_eq!(store.load::<Doc>("doc").unwrap(), Some(doc));
    }

    #[test]
    fn corrupt_document_is_a_json_error() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        store.save_raw("doc", "{not json").unwrap();
        assert!(matches!(store.load::<Doc>("doc"), Err(StoreError::Json(_))));
    }

    #[test]
    fn backend_parsing_and_open() {
        assert_eq!("JSON".parse::<Backend>().unwrap(), Backend::Json);
        assert_eq!(" sqlite ".parse::<Backend>().unwrap(), Backend::Sqlite);
        assert!("redis".parse::<Backend>().is_err());

        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Backend::Json.open(dir.path()).unwrap().backend(), "json");
        assert_eq!(Backend::Sqlite.open(dir.path()).unwrap().backend(), "sqlite");
        assert_eq!(Backend::Memory.open(dir.path()).unwrap().backend(), "memory");
    }
}
