//! Repository Coordinator
//!
//! The state machine that resolves every read and write through the
//! tiers:
//!
//! ```text
//!      ┌──────────── add ────────────┐
//!      │                             v
//!   (absent) ──── miss ─────▶ (positive-cached)
//!      ▲ │                           │
//!      │ └── neg-cache ──▶ (neg-marker) ──── add / write ──┘
//!      │                           │
//!      └─── delete ◀────────────── delete
//! ```
//!
//! Reads walk memory -> negative marker -> fallback, backfilling the
//! memory tier on a fallback hit and recording a negative marker on a
//! fallback miss. Writes hit the memory tier first (best effort under
//! the breaker), then the fallback tier, then tear down any prior
//! negative marker, so a read after any successful write can never
//! serve a stale negative.
//!
//! The coordinator never retries. Each outbound tier call runs under
//! that tier's circuit breaker; once a breaker opens, the service layer
//! re-issues the operation on the `memory=false` path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::domain::ports::{FallbackStore, MemoryBatch, ReadOp};
use crate::error::{Error, Result};
use crate::repository::config::RepositoryConfig;
use crate::repository::kind::EntityKind;
use crate::repository::query::{Query, QueryMany};
use crate::tier::{BreakerConfig, CircuitBreaker, FallbackTier, MemoryTier};

/// Byte written under the negative-marker key.
const NOT_FOUND_MARKER: &[u8] = b"1";

/// Generic repository over one entity kind.
pub struct Repository<K: EntityKind> {
    kind: K,
    config: RepositoryConfig,
    memory: MemoryTier,
    fallback: FallbackTier,
    memory_breaker: CircuitBreaker,
    fallback_breaker: CircuitBreaker,
    backfills: AtomicU64,
    negative_hits: AtomicU64,
    negative_writes: AtomicU64,
}

impl<K: EntityKind> Repository<K> {
    /// Compose a repository from its collaborators. Validates the
    /// configuration once.
    pub fn new(
        kind: K,
        config: RepositoryConfig,
        memory: MemoryTier,
        fallback: Arc<dyn FallbackStore>,
        breaker_config: BreakerConfig,
    ) -> Result<Self> {
        config.validate()?;

        let memory_breaker =
            CircuitBreaker::new(format!("{}-memory", config.entity_name), breaker_config.clone());
        let fallback_breaker =
            CircuitBreaker::new(format!("{}-fallback", config.entity_name), breaker_config);

        Ok(Self {
            kind,
            config,
            memory,
            fallback: FallbackTier::new(fallback),
            memory_breaker,
            fallback_breaker,
            backfills: AtomicU64::new(0),
            negative_hits: AtomicU64::new(0),
            negative_writes: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn memory(&self) -> &MemoryTier {
        &self.memory
    }

    pub fn fallback(&self) -> &FallbackTier {
        &self.fallback
    }

    /// Build a single-key query for these key parts.
    pub fn query(&self, key_parts: Vec<String>) -> Query {
        Query::new(key_parts)
    }

    /// Build a multi-key query.
    pub fn query_many(&self, many_key_parts: Vec<Vec<String>>) -> QueryMany {
        QueryMany::new(many_key_parts)
    }

    // =========================================================================
    // Read path
    // =========================================================================

    /// Resolve a single-key read through the tiers.
    #[instrument(skip(self, query), fields(entity = %self.config.entity_name))]
    pub async fn get(&self, query: &Query) -> Result<K::Entity> {
        self.config.check_key_parts(&query.key_parts)?;

        if !query.memory {
            return self.get_bypass(query).await;
        }

        let mk = self.config.memory_key(&query.key_parts);
        let nk = self.config.not_found_key(&query.key_parts);

        // 1. Memory tier.
        let op = self.kind.stage_read(&mk, &query.options)?;
        let reply = self.read_memory_one(op).await?;
        if let Some(entity) = self.kind.decode_read(&query.key_parts, reply, &query.options)? {
            return Ok(entity);
        }

        // 2. A previously recorded negative short-circuits the miss.
        if self
            .memory_breaker
            .call(self.memory.exists(&nk))
            .await?
        {
            self.negative_hits.fetch_add(1, Ordering::Relaxed);
            return Err(self.not_found(&query.key_parts));
        }

        // 3. Fallback tier.
        let fk = self.config.fallback_key(&query.key_parts);
        match self.fallback_breaker.call(self.fallback.get(&fk)).await? {
            None => {
                self.write_negative(&nk).await?;
                Err(self.not_found(&query.key_parts))
            }
            Some(doc) => {
                self.backfill(&mk, &doc).await?;
                match self
                    .kind
                    .materialize_fallback(&query.key_parts, &doc, &query.options)?
                {
                    Some(entity) => Ok(entity),
                    None => Err(self.not_found(&query.key_parts)),
                }
            }
        }
    }

    /// Disaster path: resolve from the fallback tier only. Leaves the
    /// memory tier untouched.
    async fn get_bypass(&self, query: &Query) -> Result<K::Entity> {
        let fk = self.config.fallback_key(&query.key_parts);
        let doc = self
            .fallback_breaker
            .call(self.fallback.get(&fk))
            .await?
            .ok_or_else(|| self.not_found(&query.key_parts))?;

        self.kind
            .materialize_fallback(&query.key_parts, &doc, &query.options)?
            .ok_or_else(|| self.not_found(&query.key_parts))
    }

    /// Resolve a multi-key read. The reply is parallel to the input
    /// with not-found slots as `None`.
    #[instrument(skip(self, query), fields(entity = %self.config.entity_name, keys = query.many_key_parts.len()))]
    pub async fn get_many(&self, query: &QueryMany) -> Result<Vec<Option<K::Entity>>> {
        for parts in &query.many_key_parts {
            self.config.check_key_parts(parts)?;
        }

        if !query.memory {
            return self.get_many_bypass(query).await;
        }

        let count = query.many_key_parts.len();
        let mut out: Vec<Option<K::Entity>> = Vec::with_capacity(count);

        // 1. One pipelined batch against the memory tier.
        let mut reads = Vec::with_capacity(count);
        for parts in &query.many_key_parts {
            let mk = self.config.memory_key(parts);
            reads.push(self.kind.stage_read(&mk, &query.options)?);
        }
        let replies = self
            .memory_breaker
            .call(self.memory.read_batch(reads))
            .await?;
        for (parts, reply) in query.many_key_parts.iter().zip(replies) {
            out.push(self.kind.decode_read(parts, reply, &query.options)?);
        }

        // 2. Pipelined negative-marker checks for the missing slots.
        let unresolved: Vec<usize> = (0..count).filter(|&i| out[i].is_none()).collect();
        if unresolved.is_empty() {
            return Ok(out);
        }

        let marker_reads: Vec<ReadOp> = unresolved
            .iter()
            .map(|&i| ReadOp::Exists(self.config.not_found_key(&query.many_key_parts[i])))
            .collect();
        let marker_replies = self
            .memory_breaker
            .call(self.memory.read_batch(marker_reads))
            .await?;

        let mut to_fallback = Vec::new();
        for (&slot, reply) in unresolved.iter().zip(marker_replies) {
            match reply {
                crate::domain::ports::ReadReply::Exists(true) => {
                    self.negative_hits.fetch_add(1, Ordering::Relaxed);
                }
                _ => to_fallback.push(slot),
            }
        }
        if to_fallback.is_empty() {
            return Ok(out);
        }

        // 3. Bulk fallback read for the still-unresolved slots.
        let fks: Vec<_> = to_fallback
            .iter()
            .map(|&i| self.config.fallback_key(&query.many_key_parts[i]))
            .collect();
        let docs = self
            .fallback_breaker
            .call(self.fallback.get_many(&fks))
            .await?;

        // 4. Negative markers for fallback misses, backfill for hits.
        let mut negatives = MemoryBatch::new();
        let mut backfills = MemoryBatch::new();
        for (&slot, doc) in to_fallback.iter().zip(&docs) {
            let parts = &query.many_key_parts[slot];
            match doc {
                None => {
                    let nk = self.config.not_found_key(parts);
                    negatives.set(nk.clone(), Bytes::from_static(NOT_FOUND_MARKER));
                    negatives.expire(nk, self.config.expire);
                    self.negative_writes.fetch_add(1, Ordering::Relaxed);
                }
                Some(doc) => {
                    let mk = self.config.memory_key(parts);
                    backfills.delete(mk.clone());
                    self.kind.stage_backfill(&mut backfills, &mk, doc)?;
                    backfills.expire(mk, self.config.expire);
                    self.backfills.fetch_add(1, Ordering::Relaxed);
                    out[slot] = self.kind.materialize_fallback(parts, doc, &query.options)?;
                }
            }
        }

        if !negatives.is_empty() {
            self.memory_breaker.call(self.memory.exec(negatives)).await?;
        }
        if !backfills.is_empty() {
            self.memory_breaker.call(self.memory.exec(backfills)).await?;
        }

        Ok(out)
    }

    async fn get_many_bypass(&self, query: &QueryMany) -> Result<Vec<Option<K::Entity>>> {
        let fks: Vec<_> = query
            .many_key_parts
            .iter()
            .map(|parts| self.config.fallback_key(parts))
            .collect();
        let docs = self
            .fallback_breaker
            .call(self.fallback.get_many(&fks))
            .await?;

        query
            .many_key_parts
            .iter()
            .zip(docs)
            .map(|(parts, doc)| match doc {
                None => Ok(None),
                Some(doc) => self.kind.materialize_fallback(parts, &doc, &query.options),
            })
            .collect()
    }

    // =========================================================================
    // Write path
    // =========================================================================

    /// Whole-record write. With `memory` the memory tier is replaced in
    /// one atomic batch (`delete + write + expire`), then the fallback
    /// tier is written, then any prior negative marker is torn down.
    /// Without it, only the fallback write happens.
    #[instrument(skip(self, entity), fields(entity = %self.config.entity_name))]
    pub async fn add(&self, entity: &K::Entity, memory: bool) -> Result<()> {
        let parts = self.kind.key_parts(&self.config, entity)?;
        self.config.check_key_parts(&parts)?;

        let doc = self.kind.to_document(entity)?;

        if memory {
            let mk = self.config.memory_key(&parts);
            let mut batch = MemoryBatch::new();
            batch.delete(mk.clone());
            self.kind.stage_write(&mut batch, &mk, entity)?;
            batch.expire(mk, self.config.expire);
            self.memory_breaker.call(self.memory.exec(batch)).await?;
        }

        let fk = self.config.fallback_key(&parts);
        let options = crate::domain::ports::PutOptions {
            exclude_from_indexes: self.kind.exclude_from_indexes(&self.config),
            exclude_all: self.config.exclude_all_from_indexes,
            ttl: self.config.fallback_ttl,
        };
        self.fallback_breaker
            .call(self.fallback.put(&fk, &doc, &options))
            .await?;

        if memory {
            let nk = self.config.not_found_key(&parts);
            self.memory_breaker.call(self.memory.delete(&nk)).await?;
        }

        Ok(())
    }

    // =========================================================================
    // Delete path
    // =========================================================================

    /// Remove from both tiers. The negative marker is cleared, not
    /// pre-set: future reads re-derive it from the absence in both
    /// tiers.
    #[instrument(skip(self, query), fields(entity = %self.config.entity_name))]
    pub async fn delete(&self, query: &Query) -> Result<()> {
        self.config.check_key_parts(&query.key_parts)?;

        if query.memory {
            let mut batch = MemoryBatch::new();
            batch.delete(self.config.memory_key(&query.key_parts));
            batch.delete(self.config.not_found_key(&query.key_parts));
            self.memory_breaker.call(self.memory.exec(batch)).await?;
        }

        let fk = self.config.fallback_key(&query.key_parts);
        self.fallback_breaker
            .call(self.fallback.delete(&fk))
            .await
    }

    // =========================================================================
    // Presence
    // =========================================================================

    /// Presence check through the same tier walk as a read, including
    /// negative-marker maintenance and backfill.
    #[instrument(skip(self, query), fields(entity = %self.config.entity_name))]
    pub async fn exists(&self, query: &Query) -> Result<bool> {
        self.config.check_key_parts(&query.key_parts)?;

        let fk = self.config.fallback_key(&query.key_parts);
        if !query.memory {
            let doc = self.fallback_breaker.call(self.fallback.get(&fk)).await?;
            return Ok(doc.is_some());
        }

        let mk = self.config.memory_key(&query.key_parts);
        if self.memory_breaker.call(self.memory.exists(&mk)).await? {
            return Ok(true);
        }

        let nk = self.config.not_found_key(&query.key_parts);
        if self.memory_breaker.call(self.memory.exists(&nk)).await? {
            self.negative_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }

        match self.fallback_breaker.call(self.fallback.get(&fk)).await? {
            None => {
                self.write_negative(&nk).await?;
                Ok(false)
            }
            Some(doc) => {
                self.backfill(&mk, &doc).await?;
                Ok(true)
            }
        }
    }

    /// Close tier pools.
    pub async fn shutdown(&self) -> Result<()> {
        self.memory.shutdown().await?;
        self.fallback.shutdown().await
    }

    /// Ordered key attribute values of an entity, as a write would
    /// derive them.
    pub fn key_parts_of(&self, entity: &K::Entity) -> Result<Vec<String>> {
        self.kind.key_parts(&self.config, entity)
    }

    /// Coordinator counter snapshot.
    pub fn stats(&self) -> RepositoryStats {
        RepositoryStats {
            backfills: self.backfills.load(Ordering::Relaxed),
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            negative_writes: self.negative_writes.load(Ordering::Relaxed),
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn read_memory_one(&self, op: ReadOp) -> Result<crate::domain::ports::ReadReply> {
        let mut replies = self
            .memory_breaker
            .call(self.memory.read_batch(vec![op]))
            .await?;
        replies
            .pop()
            .ok_or_else(|| Error::memory_tier("memory tier dropped a reply"))
    }

    /// Record a negative marker with the repository TTL.
    async fn write_negative(&self, not_found_key: &str) -> Result<()> {
        debug!(key = %not_found_key, "recording negative marker");
        let mut batch = MemoryBatch::new();
        batch.set(not_found_key.to_string(), Bytes::from_static(NOT_FOUND_MARKER));
        batch.expire(not_found_key.to_string(), self.config.expire);
        self.memory_breaker.call(self.memory.exec(batch)).await?;
        self.negative_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Rebuild the memory entry from a fallback document in one atomic
    /// batch.
    async fn backfill(&self, memory_key: &str, doc: &Value) -> Result<()> {
        debug!(key = %memory_key, "backfilling memory tier from fallback");
        let mut batch = MemoryBatch::new();
        batch.delete(memory_key.to_string());
        self.kind.stage_backfill(&mut batch, memory_key, doc)?;
        batch.expire(memory_key.to_string(), self.config.expire);
        self.memory_breaker.call(self.memory.exec(batch)).await?;
        self.backfills.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn not_found(&self, parts: &[String]) -> Error {
        Error::not_found(&self.config.entity_name, self.config.display_key(parts))
    }
}

/// Coordinator counter snapshot.
#[derive(Debug, Clone)]
pub struct RepositoryStats {
    pub backfills: u64,
    pub negative_hits: u64,
    pub negative_writes: u64,
}


// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{InMemoryFallbackStore, InMemoryMemoryNode};
    use crate::repository::boolean::{BooleanEntry, BooleanKind};
    use crate::repository::hash::HashKind;
    use assert_matches::assert_matches;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Person {
        id: String,
        name: String,
        age: u32,
    }

    struct Fixture<K: EntityKind> {
        repository: Repository<K>,
        node: Arc<InMemoryMemoryNode>,
        store: Arc<InMemoryFallbackStore>,
    }

    fn fixture<K: EntityKind>(kind: K, entity_name: &str) -> Fixture<K> {
        let node = Arc::new(InMemoryMemoryNode::new());
        let store = Arc::new(InMemoryFallbackStore::new());
        let memory = MemoryTier::new(vec![Arc::clone(&node) as Arc<dyn MemoryNode>]).unwrap();
        let repository = Repository::new(
            kind,
            RepositoryConfig::new(entity_name, vec!["id".to_string()], Duration::from_secs(60)),
            memory,
            Arc::clone(&store) as Arc<dyn FallbackStore>,
            BreakerConfig::default(),
        )
        .unwrap();
        Fixture {
            repository,
            node,
            store,
        }
    }

    use crate::domain::ports::MemoryNode;

    fn person() -> Person {
        Person {
            id: "p1".to_string(),
            name: "A".to_string(),
            age: 33,
        }
    }

    #[tokio::test]
    async fn test_add_then_get_round_trip() {
        let f = fixture(HashKind::<Person>::new(), "person");

        f.repository.add(&person(), true).await.unwrap();
        let query = f.repository.query(vec!["p1".to_string()]);
        let fetched = f.repository.get(&query).await.unwrap();
        assert_eq!(fetched, person());

        // The memory entry carries the repository TTL.
        assert!(f.node.has_ttl("person:p1"));
    }

    #[tokio::test]
    async fn test_miss_records_negative_marker_with_ttl() {
        let f = fixture(HashKind::<Person>::new(), "person");

        let query = f.repository.query(vec!["x".to_string()]);
        let err = f.repository.get(&query).await.unwrap_err();
        assert!(err.is_not_found());

        assert_eq!(
            f.node.scalar("person:not-found:x"),
            Some(bytes::Bytes::from_static(b"1"))
        );
        assert!(f.node.has_ttl("person:not-found:x"));
        assert_eq!(f.repository.stats().negative_writes, 1);
    }

    #[tokio::test]
    async fn test_negative_marker_short_circuits_fallback() {
        let f = fixture(HashKind::<Person>::new(), "person");
        let query = f.repository.query(vec!["x".to_string()]);

        f.repository.get(&query).await.unwrap_err();
        let fallback_reads = f.store.reads();

        // Re-issue: the recorded negative answers without a fallback
        // read.
        f.repository.get(&query).await.unwrap_err();
        assert_eq!(f.store.reads(), fallback_reads);
        assert_eq!(f.repository.stats().negative_hits, 1);
    }

    #[tokio::test]
    async fn test_backfill_from_fallback() {
        let f = fixture(BooleanKind::new(), "entity");
        f.store.seed("entity", "y", json!({"value": true}));

        let query = f.repository.query(vec!["y".to_string()]);
        let entry = f.repository.get(&query).await.unwrap();
        assert_eq!(entry.value(), "y");

        // The memory tier now holds the positive marker byte.
        assert_eq!(
            f.node.scalar("entity:y"),
            Some(bytes::Bytes::from_static(b"1"))
        );
        assert!(f.node.has_ttl("entity:y"));
        assert_eq!(f.repository.stats().backfills, 1);
    }

    #[tokio::test]
    async fn test_positive_and_negative_never_coexist() {
        let f = fixture(HashKind::<Person>::new(), "person");
        let query = f.repository.query(vec!["p1".to_string()]);

        // Record a negative, then write the entity.
        f.repository.get(&query).await.unwrap_err();
        assert!(f.node.contains("person:not-found:p1"));

        f.repository.add(&person(), true).await.unwrap();
        assert!(f.node.contains("person:p1"));
        assert!(!f.node.contains("person:not-found:p1"));

        let fetched = f.repository.get(&query).await.unwrap();
        assert_eq!(fetched, person());
    }

    #[tokio::test]
    async fn test_delete_clears_both_tiers_and_marker() {
        let f = fixture(HashKind::<Person>::new(), "person");
        f.repository.add(&person(), true).await.unwrap();

        let query = f.repository.query(vec!["p1".to_string()]);
        f.repository.delete(&query).await.unwrap();

        assert!(!f.node.contains("person:p1"));
        assert_eq!(f.store.collection_len("person"), 0);
        assert!(f.repository.get(&query).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_bypass_path_leaves_memory_untouched() {
        let f = fixture(HashKind::<Person>::new(), "person");
        f.store.seed("person", "p1", json!({"id": "p1", "name": "A", "age": 33}));

        let query = f.repository.query(vec!["p1".to_string()]).bypass_memory();
        let fetched = f.repository.get(&query).await.unwrap();
        assert_eq!(fetched, person());

        assert_eq!(f.node.read_ops(), 0);
        assert_eq!(f.node.write_ops(), 0);
    }

    #[tokio::test]
    async fn test_memory_false_write_skips_memory() {
        let f = fixture(HashKind::<Person>::new(), "person");
        f.repository.add(&person(), false).await.unwrap();

        assert_eq!(f.node.write_ops(), 0);
        assert_eq!(f.store.collection_len("person"), 1);
    }

    #[tokio::test]
    async fn test_get_many_preserves_input_order() {
        let f = fixture(HashKind::<Person>::new(), "person");
        for id in ["a", "b", "c"] {
            let entity = Person {
                id: id.to_string(),
                name: id.to_uppercase(),
                age: 1,
            };
            f.repository.add(&entity, true).await.unwrap();
        }

        let query = f.repository.query_many(vec![
            vec!["c".to_string()],
            vec!["missing".to_string()],
            vec!["a".to_string()],
        ]);
        let entities = f.repository.get_many(&query).await.unwrap();

        assert_eq!(entities[0].as_ref().unwrap().id, "c");
        assert!(entities[1].is_none());
        assert_eq!(entities[2].as_ref().unwrap().id, "a");

        // The missing slot recorded its negative marker.
        assert!(f.node.contains("person:not-found:missing"));
    }

    #[tokio::test]
    async fn test_get_many_backfills_memory_misses() {
        let f = fixture(HashKind::<Person>::new(), "person");
        f.store.seed("person", "p1", json!({"id": "p1", "name": "A", "age": 33}));

        let query = f.repository.query_many(vec![vec!["p1".to_string()]]);
        let entities = f.repository.get_many(&query).await.unwrap();
        assert_eq!(entities[0], Some(person()));
        assert!(f.node.contains("person:p1"));
    }

    #[tokio::test]
    async fn test_exists_walks_tiers_and_backfills() {
        let f = fixture(BooleanKind::new(), "entity");
        f.store.seed("entity", "y", json!({"value": true}));

        let query = f.repository.query(vec!["y".to_string()]);
        assert!(f.repository.exists(&query).await.unwrap());
        assert!(f.node.contains("entity:y"));

        let missing = f.repository.query(vec!["z".to_string()]);
        assert!(!f.repository.exists(&missing).await.unwrap());
        assert!(f.node.contains("entity:not-found:z"));

        // Second probe answers from the negative marker.
        let fallback_reads = f.store.reads();
        assert!(!f.repository.exists(&missing).await.unwrap());
        assert_eq!(f.store.reads(), fallback_reads);
    }

    #[tokio::test]
    async fn test_write_failure_surfaces_tier_error() {
        let f = fixture(BooleanKind::new(), "entity");
        f.node.inject_failures(1);

        let entry = BooleanEntry::new(vec!["y".to_string()]);
        let err = f.repository.add(&entry, true).await.unwrap_err();
        assert!(err.is_tier_error());

        // The fallback write never happened: memory is written first.
        assert_eq!(f.store.collection_len("entity"), 0);
    }

    #[tokio::test]
    async fn test_invalid_key_parts_rejected() {
        let f = fixture(HashKind::<Person>::new(), "person");
        let query = Query::new(vec![]);
        assert_matches!(
            f.repository.get(&query).await,
            Err(Error::InvalidKeyAttribute { .. })
        );
    }
}
