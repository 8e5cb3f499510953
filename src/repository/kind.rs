//! Entity kind abstraction.
//!
//! The repository coordinator is generic: it drives every read and
//! write through memory tier -> fallback tier -> negative cache without
//! knowing the entity shape. Each kind (hash, boolean, sorted-set,
//! geospatial) contributes the shape-specific pieces: which memory
//! command a read maps to, how replies and fallback documents
//! materialise into entities, and how writes and backfills are staged
//! into a memory batch.

use serde_json::Value;

use crate::domain::ports::{MemoryBatch, ReadOp, ReadReply};
use crate::error::Result;
use crate::repository::config::RepositoryConfig;
use crate::repository::query::QueryOptions;

/// One entity kind: the closed polymorphism behind the coordinator.
pub trait EntityKind: Send + Sync + 'static {
    /// The materialised entity type.
    type Entity: Clone + Send + Sync + 'static;

    /// The memory-tier read this query maps to. Validates the option
    /// set; inapplicable or missing mandatory options are
    /// `invalid-query`.
    fn stage_read(&self, memory_key: &str, options: &QueryOptions) -> Result<ReadOp>;

    /// Materialise a memory reply. `Ok(None)` is a miss.
    fn decode_read(
        &self,
        key_parts: &[String],
        reply: ReadReply,
        options: &QueryOptions,
    ) -> Result<Option<Self::Entity>>;

    /// Stage the value-writing ops for a full entity. The coordinator
    /// wraps them with the leading delete and trailing expire.
    fn stage_write(
        &self,
        batch: &mut MemoryBatch,
        memory_key: &str,
        entity: &Self::Entity,
    ) -> Result<()>;

    /// Stage the value-writing ops for a fallback document (backfill).
    fn stage_backfill(&self, batch: &mut MemoryBatch, memory_key: &str, doc: &Value)
        -> Result<()>;

    /// Serialise an entity to its fallback document shape.
    fn to_document(&self, entity: &Self::Entity) -> Result<Value>;

    /// Materialise a fallback document, applying the query's
    /// kind-specific projection in-process. `Ok(None)` means the
    /// projection selected nothing - a not-found that must not write
    /// the negative marker.
    fn materialize_fallback(
        &self,
        key_parts: &[String],
        doc: &Value,
        options: &QueryOptions,
    ) -> Result<Option<Self::Entity>>;

    /// Ordered key attribute values of an entity given to a write.
    /// Missing attributes are `invalid-key-attribute`.
    fn key_parts(&self, config: &RepositoryConfig, entity: &Self::Entity) -> Result<Vec<String>>;

    /// Document fields excluded from fallback indexing.
    fn exclude_from_indexes(&self, _config: &RepositoryConfig) -> Vec<String> {
        Vec::new()
    }
}
