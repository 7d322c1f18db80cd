use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Result, StoreError};
use crate::DocumentStore;

/// Volatile backend: documents live as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentStore for MemoryStore {
    fn load_raw(&self, key: &str) -> Result<Option<String>> {
        let docs = self.docs.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(docs.get(key).cloned())
    }

    fn save_raw(&self, key: &str, body: &str) -> Result<()> {
        let mut docs = self.docs.lock().map_err(|_| StoreError::Poisoned)?;
        docs.insert(key.to_string(), body.to_string());
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
