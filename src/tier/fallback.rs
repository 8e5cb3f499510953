//! Fallback Tier - Durable Document Store
//!
//! Thin routing layer over a [`FallbackStore`] adapter: composes store
//! keys from entity key parts and keeps hit/miss counters. The store
//! owns the canonical value; the memory tier is only a cache of it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::domain::ports::{FallbackKey, FallbackStore, PutOptions};
use crate::error::Result;

/// Fallback tier over one document store.
pub struct FallbackTier {
    store: Arc<dyn FallbackStore>,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

impl FallbackTier {
    pub fn new(store: Arc<dyn FallbackStore>) -> Self {
        Self {
            store,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Store key for an entity's key parts.
    pub fn make_key(&self, collection: &str, parts: &[String]) -> FallbackKey {
        self.store.make_key(collection, parts)
    }

    /// Fetch a document, `None` when absent.
    pub async fn get(&self, key: &FallbackKey) -> Result<Option<Value>> {
        let doc = self.store.get(key).await?;
        match doc {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        Ok(doc)
    }

    /// Store a document, replacing any existing one.
    pub async fn put(&self, key: &FallbackKey, doc: &Value, options: &PutOptions) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.store.put(key, doc, options).await
    }

    /// Idempotent removal.
    pub async fn delete(&self, key: &FallbackKey) -> Result<()> {
        self.store.delete(key).await
    }

    /// Bulk fetch parallel to `keys`, absent entries as `None`.
    pub async fn get_many(&self, keys: &[FallbackKey]) -> Result<Vec<Option<Value>>> {
        let docs = self.store.get_many(keys).await?;
        for doc in &docs {
            match doc {
                Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
                None => self.misses.fetch_add(1, Ordering::Relaxed),
            };
        }
        Ok(docs)
    }

    /// Close the store's pool.
    pub async fn shutdown(&self) -> Result<()> {
        self.store.shutdown().await
    }

    /// Counter snapshot.
    pub fn stats(&self) -> FallbackTierStats {
        FallbackTierStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}

/// Fallback-tier counter snapshot.
#[derive(Debug, Clone)]
pub struct FallbackTierStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryFallbackStore;
    use serde_json::json;

    fn tier() -> FallbackTier {
        FallbackTier::new(Arc::new(InMemoryFallbackStore::new()))
    }

    #[tokio::test]
    async fn test_round_trip() {
        let tier = tier();
        let key = tier.make_key("person", &["p1".to_string()]);

        tier.put(&key, &json!({"id": "p1"}), &PutOptions::default())
            .await
            .unwrap();
        assert_eq!(tier.get(&key).await.unwrap(), Some(json!({"id": "p1"})));

        tier.delete(&key).await.unwrap();
        assert_eq!(tier.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_many_parallel_to_input() {
        let tier = tier();
        let a = tier.make_key("person", &["a".to_string()]);
        let b = tier.make_key("person", &["b".to_string()]);
        let missing = tier.make_key("person", &["missing".to_string()]);

        tier.put(&a, &json!({"id": "a"}), &PutOptions::default())
            .await
            .unwrap();
        tier.put(&b, &json!({"id": "b"}), &PutOptions::default())
            .await
            .unwrap();

        let docs = tier
            .get_many(&[b.clone(), missing.clone(), a.clone()])
            .await
            .unwrap();
        assert_eq!(docs[0], Some(json!({"id": "b"})));
        assert_eq!(docs[1], None);
        assert_eq!(docs[2], Some(json!({"id": "a"})));
    }

    #[tokio::test]
    async fn test_stats_track_hits_and_misses() {
        let tier = tier();
        let key = tier.make_key("person", &["p1".to_string()]);

        tier.get(&key).await.unwrap();
        tier.put(&key, &json!({"id": "p1"}), &PutOptions::default())
            .await
            .unwrap();
        tier.get(&key).await.unwrap();

        let stats = tier.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.writes, 1);
    }

    #[test]
    fn test_make_key_joins_parts() {
        let tier = tier();
        let key = tier.make_key("order", &["acme".to_string(), "42".to_string()]);
        assert_eq!(key.collection, "order");
        assert_eq!(key.id, "acme:42");
    }
}
