//! Tier ports (port/adapter pattern)
//!
//! The repository coordinator depends only on these abstractions.
//! Infrastructure adapters implement them to provide concrete tiers:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Repository Layer                         │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │              Ports (Traits)                          │    │
//! │  │       MemoryNode          │        FallbackStore     │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │              Adapters (Impls)                        │    │
//! │  │  RedisMemoryNode │ MongoFallbackStore │ InMemory*    │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A `MemoryNode` is one shard of the memory tier; the ring decides
//! which node a key lands on. Reads and writes travel as batches so a
//! node can pipeline them in a single round trip.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use super::geo::DistanceUnit;
use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// A sorted-set member with its score.
///
/// The score is optional on the read side: range reads issued without
/// `withscores` come back score-less.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: String,
    pub score: Option<f64>,
}

impl ScoredMember {
    /// Member with a score (the only form accepted by writes).
    pub fn scored(member: impl Into<String>, score: f64) -> Self {
        Self {
            member: member.into(),
            score: Some(score),
        }
    }

    /// Member without a score.
    pub fn bare(member: impl Into<String>) -> Self {
        Self {
            member: member.into(),
            score: None,
        }
    }
}

/// A geospatial member.
///
/// Coordinates are mandatory on the write side; on the read side they
/// are present only when the query asked for `with_coord`, and
/// `distance` only when it asked for `with_dist`.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoMember {
    pub member: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub distance: Option<f64>,
}

impl GeoMember {
    /// A point with coordinates, as required for writes.
    pub fn point(member: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            member: member.into(),
            latitude: Some(latitude),
            longitude: Some(longitude),
            distance: None,
        }
    }
}

/// A radius query against a geospatial key.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoRadius {
    pub longitude: f64,
    pub latitude: f64,
    pub radius: f64,
    pub unit: DistanceUnit,
    pub with_dist: bool,
    pub with_coord: bool,
    pub count: Option<usize>,
}

/// Key of a document in the fallback tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FallbackKey {
    /// Collection (one per entity name)
    pub collection: String,
    /// Document id (joined key parts)
    pub id: String,
}

impl std::fmt::Display for FallbackKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Write-side options for the fallback tier.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Document fields to exclude from backend indexing, where supported
    pub exclude_from_indexes: Vec<String>,
    /// Exclude every field from indexing
    pub exclude_all: bool,
    /// Collection-level TTL; stores supporting TTL indices install one lazily
    pub ttl: Option<Duration>,
}

// =============================================================================
// Memory-Tier Operations
// =============================================================================

/// One read against the memory tier.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOp {
    /// Scalar fetch
    Get(String),
    /// Presence check
    Exists(String),
    /// Full hash-map fetch
    HGetAll(String),
    /// Projected hash-map fetch; reply is parallel to the field list
    HGet(String, Vec<String>),
    /// Index-range read over a sorted set
    ZRange {
        key: String,
        start: isize,
        stop: isize,
        reverse: bool,
        withscores: bool,
    },
    /// Score-range read over a sorted set
    ZRangeByScore {
        key: String,
        min: f64,
        max: f64,
        offset: Option<usize>,
        count: Option<usize>,
        withscores: bool,
    },
    /// Radius read over a geospatial key
    GeoRadius { key: String, query: GeoRadius },
}

impl ReadOp {
    /// The key this read routes on.
    pub fn key(&self) -> &str {
        match self {
            ReadOp::Get(k)
            | ReadOp::Exists(k)
            | ReadOp::HGetAll(k)
            | ReadOp::HGet(k, _)
            | ReadOp::ZRange { key: k, .. }
            | ReadOp::ZRangeByScore { key: k, .. }
            | ReadOp::GeoRadius { key: k, .. } => k,
        }
    }
}

/// The reply to one [`ReadOp`], in the same position of the batch.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadReply {
    /// Scalar value or absent
    Value(Option<Bytes>),
    /// Presence
    Exists(bool),
    /// Hash-map fields; empty means the key is absent
    Fields(HashMap<String, String>),
    /// Projected hash-map fields, parallel to the requested field list
    FieldValues(Vec<Option<String>>),
    /// Sorted-set members; empty means absent key or empty selection
    Members(Vec<ScoredMember>),
    /// Geo members; empty means absent key or empty selection
    GeoMembers(Vec<GeoMember>),
}

/// One write against the memory tier.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Delete(String),
    Set(String, Bytes),
    Expire(String, Duration),
    HSet(String, Vec<(String, String)>),
    ZAdd(String, Vec<(String, f64)>),
    GeoAdd(String, Vec<(String, f64, f64)>),
}

impl WriteOp {
    /// The key this write routes on.
    pub fn key(&self) -> &str {
        match self {
            WriteOp::Delete(k)
            | WriteOp::Set(k, _)
            | WriteOp::Expire(k, _)
            | WriteOp::HSet(k, _)
            | WriteOp::ZAdd(k, _)
            | WriteOp::GeoAdd(k, _) => k,
        }
    }
}

/// An ordered batch of memory-tier writes, sent atomically per node.
#[derive(Debug, Clone, Default)]
pub struct MemoryBatch {
    ops: Vec<WriteOp>,
}

impl MemoryBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::Delete(key.into()));
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Bytes>) -> &mut Self {
        self.ops.push(WriteOp::Set(key.into(), value.into()));
        self
    }

    pub fn expire(&mut self, key: impl Into<String>, ttl: Duration) -> &mut Self {
        self.ops.push(WriteOp::Expire(key.into(), ttl));
        self
    }

    pub fn hset(&mut self, key: impl Into<String>, fields: Vec<(String, String)>) -> &mut Self {
        self.ops.push(WriteOp::HSet(key.into(), fields));
        self
    }

    pub fn zadd(&mut self, key: impl Into<String>, members: Vec<(String, f64)>) -> &mut Self {
        self.ops.push(WriteOp::ZAdd(key.into(), members));
        self
    }

    pub fn geo_add(
        &mut self,
        key: impl Into<String>,
        points: Vec<(String, f64, f64)>,
    ) -> &mut Self {
        self.ops.push(WriteOp::GeoAdd(key.into(), points));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

// =============================================================================
// Memory Node Port
// =============================================================================

/// Port for one shard of the memory tier.
///
/// A node receives batches of operations and answers them in order,
/// pipelining where the driver allows. Failures surface as the single
/// tier-error kind; the node never interprets them — that is the
/// circuit breaker's job.
#[async_trait]
pub trait MemoryNode: Send + Sync {
    /// Execute a batch of reads, replying in input order.
    async fn read_batch(&self, ops: Vec<ReadOp>) -> Result<Vec<ReadReply>>;

    /// Execute a batch of writes. With `atomic` the batch is applied
    /// transactionally (best effort; failure aborts the batch).
    async fn write_batch(&self, ops: Vec<WriteOp>, atomic: bool) -> Result<()>;

    /// Close the node's connection pool.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Fallback Store Port
// =============================================================================

/// Port for the durable document store that owns the canonical value.
#[async_trait]
pub trait FallbackStore: Send + Sync {
    /// Build the store key for an entity's joined key parts.
    fn make_key(&self, collection: &str, parts: &[String]) -> FallbackKey {
        FallbackKey {
            collection: collection.to_string(),
            id: parts.join(":"),
        }
    }

    /// Fetch a document, `None` when absent.
    async fn get(&self, key: &FallbackKey) -> Result<Option<Value>>;

    /// Store a document, replacing any existing one.
    async fn put(&self, key: &FallbackKey, doc: &Value, options: &PutOptions) -> Result<()>;

    /// Idempotent removal.
    async fn delete(&self, key: &FallbackKey) -> Result<()>;

    /// Bulk fetch; the reply is parallel to `keys` with absent entries
    /// as `None`.
    async fn get_many(&self, keys: &[FallbackKey]) -> Result<Vec<Option<Value>>>;

    /// Close the store's connection pool.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scored_member_constructors() {
        let m = ScoredMember::scored("m1", 1.5);
        assert_eq!(m.member, "m1");
        assert_eq!(m.score, Some(1.5));

        let m = ScoredMember::bare("m2");
        assert_eq!(m.score, None);
    }

    #[test]
    fn test_read_op_routing_key() {
        assert_eq!(ReadOp::Get("a".into()).key(), "a");
        assert_eq!(ReadOp::HGet("b".into(), vec![]).key(), "b");
        let op = ReadOp::ZRange {
            key: "c".into(),
            start: 0,
            stop: -1,
            reverse: false,
            withscores: false,
        };
        assert_eq!(op.key(), "c");
    }

    #[test]
    fn test_write_op_routing_key() {
        assert_eq!(WriteOp::Delete("x".into()).key(), "x");
        assert_eq!(WriteOp::Set("y".into(), Bytes::from_static(b"1")).key(), "y");
    }

    #[test]
    fn test_memory_batch_composition() {
        let mut batch = MemoryBatch::new();
        batch
            .delete("k")
            .hset("k", vec![("f".into(), "v".into())])
            .expire("k", Duration::from_secs(60));

        assert_eq!(batch.len(), 3);
        assert!(matches!(batch.ops()[0], WriteOp::Delete(_)));
        assert!(matches!(batch.ops()[2], WriteOp::Expire(_, _)));
    }

    #[test]
    fn test_fallback_key_display() {
        let key = FallbackKey {
            collection: "person".into(),
            id: "acme:p1".into(),
        };
        assert_eq!(key.to_string(), "person/acme:p1");
    }
}
