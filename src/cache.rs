//! Content-addressed translation cache.
//!
//! The cache maps a request's [`ContentHash`] to its finished translation.
//! It is the only persistent state the core writes: entries are created on
//! definitive provider success and never mutated afterwards. Because the
//! hash is a function of cleaned text and provider identity, concurrent
//! writers of the same key always carry equal values, so last-writer-wins is
//! idempotent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{DispatchError, Result};
use crate::store::KeyValueStore;
use crate::types::ContentHash;

const KEY_PREFIX: &str = "translation_cache:";

/// Instrumentation record attached to a cache entry when metrics collection
/// is enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetrics {
    pub raw_chars: u32,
    pub clean_chars: u32,
    pub stripped_markup: bool,
    pub provider_id: String,
    pub latency_ms: u64,
    pub hostname: String,
    /// Translation mode the caller was in (e.g. "page", "selection").
    pub mode: String,
}

/// One cached translation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub translation: String,
    pub created_at: DateTime<Utc>,
    pub metrics: Option<ChunkMetrics>,
}

impl CacheEntry {
    pub fn new(translation: impl Into<String>) -> Self {
        Self {
            translation: translation.into(),
            created_at: Utc::now(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ChunkMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Content-addressed cache over a [`KeyValueStore`].
#[derive(Clone)]
pub struct TranslationCache {
    store: Arc<dyn KeyValueStore>,
}

impl TranslationCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn key(hash: &ContentHash) -> String {
        format!("{}{}", KEY_PREFIX, hash)
    }

    pub async fn get(&self, hash: &ContentHash) -> Result<Option<CacheEntry>> {
        let Some(raw) = self.store.get(&Self::key(hash)).await? else {
            return Ok(None);
        };
        let entry = serde_json::from_str(&raw)
            .map_err(|e| DispatchError::Storage(format!("corrupt cache entry {}: {}", hash, e)))?;
        Ok(Some(entry))
    }

    pub async fn put(&self, hash: &ContentHash, entry: CacheEntry) -> Result<()> {
        let raw = serde_json::to_string(&entry)?;
        self.store.set(&Self::key(hash), raw).await?;
        tracing::debug!(hash = %hash, "Cache entry written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn cache() -> TranslationCache {
        TranslationCache::new(MemoryStore::shared())
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let cache = cache();
        let hash = ContentHash::from("h1");

        assert!(cache.get(&hash).await.unwrap().is_none());

        cache.put(&hash, CacheEntry::new("你好")).await.unwrap();
        let entry = cache.get(&hash).await.unwrap().unwrap();
        assert_eq!(entry.translation, "你好");
        assert!(entry.metrics.is_none());
    }

    #[tokio::test]
    async fn metrics_survive_round_trip() {
        let cache = cache();
        let hash = ContentHash::from("h2");

        let metrics = ChunkMetrics {
            raw_chars: 120,
            clean_chars: 100,
            stripped_markup: true,
            provider_id: "genai".into(),
            latency_ms: 842,
            hostname: "news.example.com".into(),
            mode: "page".into(),
        };
        cache
            .put(&hash, CacheEntry::new("done").with_metrics(metrics.clone()))
            .await
            .unwrap();

        let entry = cache.get(&hash).await.unwrap().unwrap();
        assert_eq!(entry.metrics, Some(metrics));
    }

    #[tokio::test]
    async fn same_key_rewrite_is_idempotent() {
        let cache = cache();
        let hash = ContentHash::from("h3");

        cache.put(&hash, CacheEntry::new("same")).await.unwrap();
        cache.put(&hash, CacheEntry::new("same")).await.unwrap();

        let entry = cache.get(&hash).await.unwrap().unwrap();
        assert_eq!(entry.translation, "same");
    }
}
