//! CoucheCache Community Edition - Tiered Entity Cache Repository
//!
//! A read-through / write-around caching repository layer for
//! structured entities. Each logical entity lives in two tiers: a fast
//! remote memory tier (Redis) and a durable fallback tier (a document
//! database), with negative caching, consistent-hash sharding, circuit
//! breakers, and an in-process short-TTL cache coordinating the two.
//!
//! # Architecture
//!
//! ```text
//! Service ─▶ LocalCache ─▶ CircuitBreaker ─▶ Repository
//!                                               │
//!                        ┌──────────────────────┤
//!                        ▼                      ▼
//!                   MemoryTier             FallbackTier
//!                (sharded, TTL'd)       (canonical value)
//!                        │
//!                   on miss: backfill / negative marker
//! ```
//!
//! A read walks memory -> negative marker -> fallback, backfills the
//! memory tier on a fallback hit and records a one-byte negative
//! marker on a fallback miss, so repeated misses never stampede the
//! durable store. A write always lands in the fallback tier; the
//! memory-tier write is best-effort under its circuit breaker.
//!
//! # Entity kinds
//!
//! - [`HashKind`]: a user record stored as a field map, with
//!   field-projection reads.
//! - [`BooleanKind`]: presence/absence; the value is the key itself.
//! - [`SortedSetKind`]: (member, score) pairs with range, score-range,
//!   reverse and paging reads.
//! - [`GeoKind`]: (member, latitude, longitude) points with radius
//!   reads.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use couchecache::adapters::{InMemoryFallbackStore, InMemoryMemoryNode};
//! use couchecache::{HashKind, QueryOptions, ServiceBuilder};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Person {
//!     id: String,
//!     name: String,
//!     age: u32,
//! }
//!
//! # async fn run() -> couchecache::Result<()> {
//! let service = ServiceBuilder::new(HashKind::<Person>::new())
//!     .entity_name("person")
//!     .key_attrs(["id"])
//!     .expire_time(Duration::from_secs(3600))
//!     .memory_node(Arc::new(InMemoryMemoryNode::new()))
//!     .fallback_store(Arc::new(InMemoryFallbackStore::new()))
//!     .build()?;
//!
//! let person = Person {
//!     id: "p1".to_string(),
//!     name: "A".to_string(),
//!     age: 33,
//! };
//! service.add(&person).await?;
//! let fetched = service.get_one("p1", &[], QueryOptions::new()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Infrastructure adapters implementing the tier ports
//! - [`cache`] - Process-local bounded cache
//! - [`domain`] - Tier ports and value objects
//! - [`error`] - Error types
//! - [`repository`] - The coordinator and entity kinds
//! - [`service`] - User-facing facade and builder
//! - [`tier`] - Hash ring, sharded tiers, circuit breaker

pub mod adapters;
pub mod cache;
pub mod domain;
pub mod error;
pub mod repository;
pub mod service;
pub mod tier;

// Re-export commonly used types
pub use cache::{CacheSlot, CacheType, LocalCache, LocalCacheConfig};
pub use domain::geo::DistanceUnit;
pub use domain::ports::{GeoMember, ScoredMember};
pub use error::{Error, Result, TierKind};
pub use repository::{
    BooleanEntry, BooleanKind, EntityKind, GeoEntry, GeoKind, HashKind, Query, QueryMany,
    QueryOptions, Repository, RepositoryConfig, SortedSetEntry, SortedSetKind,
};
pub use service::{Service, ServiceBuilder};
pub use tier::{BreakerConfig, BreakerState, CircuitBreaker, HashRing};

/// Service over a hash entity record.
pub type HashService<E> = Service<HashKind<E>>;
/// Service over boolean-presence entities.
pub type BooleanService = Service<BooleanKind>;
/// Service over sorted-set entities.
pub type SortedSetService = Service<SortedSetKind>;
/// Service over geospatial entities.
pub type GeoService = Service<GeoKind>;
