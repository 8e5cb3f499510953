//! Service Builder
//!
//! Composes local cache + circuit breakers + repository + tiers into a
//! running service. All configuration is validated here, once.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{LocalCache, LocalCacheConfig};
use crate::domain::ports::{FallbackStore, MemoryNode};
use crate::error::{Error, Result};
use crate::repository::{EntityKind, Repository, RepositoryConfig};
use crate::service::Service;
use crate::tier::{BreakerConfig, MemoryTier};

/// Default wall-clock budget for `get_one`.
const DEFAULT_GET_TIMEOUT: Duration = Duration::from_secs(1);

/// Default fan-out width for many-entity operations.
const DEFAULT_FAN_OUT: usize = 8;

/// Builder for a [`Service`] over one entity kind.
pub struct ServiceBuilder<K: EntityKind> {
    kind: K,
    entity_name: Option<String>,
    key_attrs: Vec<String>,
    expire: Option<Duration>,
    fallback_ttl: Option<Duration>,
    exclude_all_from_indexes: bool,
    memory_nodes: Vec<Arc<dyn MemoryNode>>,
    virtual_nodes: Option<usize>,
    fallback: Option<Arc<dyn FallbackStore>>,
    cache: Option<LocalCacheConfig>,
    breaker: BreakerConfig,
    get_timeout: Duration,
    fan_out: usize,
}

impl<K: EntityKind> ServiceBuilder<K> {
    pub fn new(kind: K) -> Self {
        Self {
            kind,
            entity_name: None,
            key_attrs: Vec::new(),
            expire: None,
            fallback_ttl: None,
            exclude_all_from_indexes: false,
            memory_nodes: Vec::new(),
            virtual_nodes: None,
            fallback: None,
            cache: None,
            breaker: BreakerConfig::default(),
            get_timeout: DEFAULT_GET_TIMEOUT,
            fan_out: DEFAULT_FAN_OUT,
        }
    }

    /// Entity name; prefixes every derived key and names the fallback
    /// collection.
    pub fn entity_name(mut self, name: impl Into<String>) -> Self {
        self.entity_name = Some(name.into());
        self
    }

    /// Ordered key attributes; the last one is the logical id.
    pub fn key_attrs<I, S>(mut self, attrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_attrs = attrs.into_iter().map(Into::into).collect();
        self
    }

    /// Memory-tier TTL per entry (also the negative-marker TTL).
    pub fn expire_time(mut self, expire: Duration) -> Self {
        self.expire = Some(expire);
        self
    }

    /// Collection-level TTL for the fallback tier.
    pub fn fallback_ttl(mut self, ttl: Duration) -> Self {
        self.fallback_ttl = Some(ttl);
        self
    }

    /// Exclude every hash attribute from fallback indexing.
    pub fn exclude_all_from_indexes(mut self, exclude: bool) -> Self {
        self.exclude_all_from_indexes = exclude;
        self
    }

    /// Add one memory-tier shard.
    pub fn memory_node(mut self, node: Arc<dyn MemoryNode>) -> Self {
        self.memory_nodes.push(node);
        self
    }

    /// Replace the shard list.
    pub fn memory_nodes(mut self, nodes: Vec<Arc<dyn MemoryNode>>) -> Self {
        self.memory_nodes = nodes;
        self
    }

    /// Virtual-node multiplier for the hash ring (defaults to the
    /// shard count).
    pub fn virtual_nodes(mut self, virtual_nodes: usize) -> Self {
        self.virtual_nodes = Some(virtual_nodes);
        self
    }

    /// The durable document store.
    pub fn fallback_store(mut self, store: Arc<dyn FallbackStore>) -> Self {
        self.fallback = Some(store);
        self
    }

    /// Enable the process-local cache.
    pub fn local_cache(mut self, config: LocalCacheConfig) -> Self {
        self.cache = Some(config);
        self
    }

    /// Circuit-breaker tuning, applied to both tier breakers.
    pub fn breaker(mut self, config: BreakerConfig) -> Self {
        self.breaker = config;
        self
    }

    /// Matching failures before a tier breaker opens; zero fails fast.
    pub fn cb_failure_threshold(mut self, threshold: u32) -> Self {
        self.breaker.failure_threshold = threshold;
        self
    }

    /// Time an open breaker waits before allowing a probe.
    pub fn cb_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.breaker.recovery_timeout = timeout;
        self
    }

    /// Wall-clock budget for `get_one`.
    pub fn get_entity_timeout(mut self, timeout: Duration) -> Self {
        self.get_timeout = timeout;
        self
    }

    /// Fan-out width for many-entity operations.
    pub fn fan_out(mut self, fan_out: usize) -> Self {
        self.fan_out = fan_out.max(1);
        self
    }

    /// Validate and compose the service.
    pub fn build(self) -> Result<Service<K>> {
        let entity_name = self
            .entity_name
            .ok_or(Error::RequiredConfigAttribute("entity_name"))?;
        if self.key_attrs.is_empty() {
            return Err(Error::RequiredConfigAttribute("key_attrs"));
        }
        let expire = self
            .expire
            .ok_or_else(|| Error::Config("repository_expire_time is required".to_string()))?;

        let mut config = RepositoryConfig::new(entity_name, self.key_attrs, expire);
        config.fallback_ttl = self.fallback_ttl;
        config.exclude_all_from_indexes = self.exclude_all_from_indexes;

        if self.memory_nodes.is_empty() {
            return Err(Error::Config(
                "at least one memory node is required".to_string(),
            ));
        }
        let memory = match self.virtual_nodes {
            Some(virtual_nodes) => {
                MemoryTier::with_virtual_nodes(self.memory_nodes, virtual_nodes)?
            }
            None => MemoryTier::new(self.memory_nodes)?,
        };

        let fallback = self
            .fallback
            .ok_or_else(|| Error::Config("a fallback store is required".to_string()))?;

        let repository = Repository::new(self.kind, config, memory, fallback, self.breaker)?;

        let cache = self.cache.clone().map(LocalCache::new);
        let exists_cache = self.cache.map(LocalCache::new);

        Ok(Service::from_parts(
            repository,
            cache,
            exists_cache,
            self.get_timeout,
            self.fan_out,
        ))
    }
}

// =============================================================================
// Tests
// =============================================================================
