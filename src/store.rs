//! Key-value persistence abstraction.
//!
//! The core persists exactly two things: the translation cache and the chat
//! pool state. Both go through [`KeyValueStore`], so the embedding host can
//! back them with whatever durable storage it has. [`MemoryStore`] is the
//! in-process implementation used in tests and single-session deployments.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;

/// Durable string-keyed storage.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot of the raw contents, for assertions.
    pub fn dump(&self) -> HashMap<String, String> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}
