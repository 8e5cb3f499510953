//! Service Facade
//!
//! User-facing layer over the repository coordinator. Adds the
//! process-local cache (with the already-not-found sentinel), a
//! wall-clock timeout budget per read, order-preserving fan-out for
//! many-entity operations, and the disaster path: when a tier breaker
//! reports open, the operation is re-issued with the memory tier
//! bypassed.

mod builder;

pub use builder::ServiceBuilder;

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{Stream, StreamExt, TryStreamExt};
use tracing::{instrument, warn};

use crate::cache::{cache_key, CacheSlot, LocalCache};
use crate::error::{Error, Result};
use crate::repository::{EntityKind, Query, QueryMany, QueryOptions, Repository};

/// Service facade over one repository.
pub struct Service<K: EntityKind> {
    inner: Arc<ServiceInner<K>>,
}

impl<K: EntityKind> Clone for Service<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ServiceInner<K: EntityKind> {
    repository: Repository<K>,
    cache: Option<LocalCache<CacheSlot<K::Entity>>>,
    exists_cache: Option<LocalCache<bool>>,
    get_timeout: Duration,
    fan_out: usize,
}

impl<K: EntityKind> Service<K> {
    pub(crate) fn from_parts(
        repository: Repository<K>,
        cache: Option<LocalCache<CacheSlot<K::Entity>>>,
        exists_cache: Option<LocalCache<bool>>,
        get_timeout: Duration,
        fan_out: usize,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                repository,
                cache,
                exists_cache,
                get_timeout,
                fan_out,
            }),
        }
    }

    /// The underlying repository, for stats and direct queries.
    pub fn repository(&self) -> &Repository<K> {
        &self.inner.repository
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Fetch one entity under the wall-clock timeout budget. The local
    /// cache answers first; its sentinel short-circuits to `not-found`
    /// without touching the tiers. Exceeding the deadline is reported
    /// as `not-found`.
    #[instrument(skip(self, filters, options), fields(entity = %self.inner.repository.config().entity_name))]
    pub async fn get_one(
        &self,
        id: &str,
        filters: &[(String, String)],
        options: QueryOptions,
    ) -> Result<K::Entity> {
        let ck = self.read_cache_key(id, filters, &options);
        if let Some(cache) = &self.inner.cache {
            match cache.get(&ck) {
                Some(CacheSlot::Found(entity)) => return Ok(entity),
                Some(CacheSlot::AlreadyNotFound) => {
                    return Err(self.not_found(id, filters));
                }
                None => {}
            }
        }

        let query = Query::new(self.key_parts(id, filters)?).with_options(options);
        let result = match tokio::time::timeout(self.inner.get_timeout, self.resolve_get(&query))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    entity = %self.inner.repository.config().entity_name,
                    id,
                    timeout_ms = self.inner.get_timeout.as_millis() as u64,
                    "get_one timed out"
                );
                Err(self.not_found(id, filters))
            }
        };

        if let Some(cache) = &self.inner.cache {
            match &result {
                Ok(entity) => cache.set(ck, CacheSlot::Found(entity.clone())),
                Err(err) if err.is_not_found() => cache.set(ck, CacheSlot::AlreadyNotFound),
                Err(_) => {}
            }
        }

        result
    }

    /// Lazy order-preserving stream over many entities, one sub-task
    /// per id; ids that resolve to `not-found` are elided.
    pub fn get_many(
        &self,
        ids: Vec<String>,
        filters: Vec<(String, String)>,
        options: QueryOptions,
    ) -> impl Stream<Item = K::Entity> + Send + 'static {
        let service = self.clone();
        let fan_out = self.inner.fan_out;

        futures::stream::iter(ids.into_iter().map(move |id| {
            let service = service.clone();
            let filters = filters.clone();
            let options = options.clone();
            async move { service.get_one(&id, &filters, options).await.ok() }
        }))
        .buffered(fan_out)
        .filter_map(futures::future::ready)
    }

    /// Collected variant: the reply is parallel to `ids` with
    /// `not-found` slots as `None`. Unresolved ids travel as one
    /// pipelined multi-key query.
    #[instrument(skip(self, ids, filters, options), fields(entity = %self.inner.repository.config().entity_name, ids = ids.len()))]
    pub async fn get_many_collected(
        &self,
        ids: &[String],
        filters: &[(String, String)],
        options: QueryOptions,
    ) -> Result<Vec<Option<K::Entity>>> {
        let mut out: Vec<Option<K::Entity>> = vec![None; ids.len()];
        let mut unresolved = Vec::new();

        for (idx, id) in ids.iter().enumerate() {
            let cached = self
                .inner
                .cache
                .as_ref()
                .and_then(|cache| cache.get(&self.read_cache_key(id, filters, &options)));
            match cached {
                Some(CacheSlot::Found(entity)) => out[idx] = Some(entity),
                Some(CacheSlot::AlreadyNotFound) => {}
                None => unresolved.push(idx),
            }
        }

        if unresolved.is_empty() {
            return Ok(out);
        }

        let many_parts = unresolved
            .iter()
            .map(|&idx| self.key_parts(&ids[idx], filters))
            .collect::<Result<Vec<_>>>()?;
        let query = QueryMany::new(many_parts).with_options(options);

        let resolved = match self.inner.repository.get_many(&query).await {
            Err(err) if err.is_breaker_open() => {
                warn!(breaker = %err, "multi-key read re-issued around the memory tier");
                self.inner.repository.get_many(&query.bypass_memory()).await
            }
            other => other,
        }?;

        for (&idx, entity) in unresolved.iter().zip(resolved) {
            if let Some(cache) = &self.inner.cache {
                let ck = self.read_cache_key(&ids[idx], filters, &query.options);
                match &entity {
                    Some(entity) => cache.set(ck, CacheSlot::Found(entity.clone())),
                    None => cache.set(ck, CacheSlot::AlreadyNotFound),
                }
            }
            out[idx] = entity;
        }

        Ok(out)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write an entity through both tiers. If the memory-tier breaker
    /// is open, the write is retried on the fallback-only path.
    #[instrument(skip(self, entity), fields(entity = %self.inner.repository.config().entity_name))]
    pub async fn add(&self, entity: &K::Entity) -> Result<()> {
        match self.inner.repository.add(entity, true).await {
            Err(err) if err.is_breaker_open() => {
                warn!(breaker = %err, "write re-issued around the memory tier");
                self.inner.repository.add(entity, false).await?;
            }
            other => other?,
        }

        // Refresh the local caches so a same-task read observes the
        // write instead of a stale sentinel.
        if let Ok((id, filters)) = self.entity_cache_parts(entity) {
            let ck = cache_key(&id, &filters);
            if let Some(cache) = &self.inner.cache {
                cache.set(ck.clone(), CacheSlot::Found(entity.clone()));
            }
            if let Some(exists_cache) = &self.inner.exists_cache {
                exists_cache.set(ck, true);
            }
        }

        Ok(())
    }

    /// Delete an entity from both tiers, with the same breaker
    /// fallback as `add`.
    #[instrument(skip(self, filters), fields(entity = %self.inner.repository.config().entity_name, id))]
    pub async fn delete(&self, id: &str, filters: &[(String, String)]) -> Result<()> {
        let query = Query::new(self.key_parts(id, filters)?);

        match self.inner.repository.delete(&query).await {
            Err(err) if err.is_breaker_open() => {
                warn!(breaker = %err, "delete re-issued around the memory tier");
                self.inner.repository.delete(&query.bypass_memory()).await?;
            }
            other => other?,
        }

        let ck = cache_key(id, filters);
        if let Some(cache) = &self.inner.cache {
            cache.remove(&ck);
        }
        if let Some(exists_cache) = &self.inner.exists_cache {
            exists_cache.remove(&ck);
        }

        Ok(())
    }

    // =========================================================================
    // Presence
    // =========================================================================

    /// Presence check backed by its own cache, so boolean probes do
    /// not pollute the entity cache.
    #[instrument(skip(self, filters), fields(entity = %self.inner.repository.config().entity_name, id))]
    pub async fn exists(&self, id: &str, filters: &[(String, String)]) -> Result<bool> {
        let ck = cache_key(id, filters);
        if let Some(exists_cache) = &self.inner.exists_cache {
            if let Some(present) = exists_cache.get(&ck) {
                return Ok(present);
            }
        }

        let query = Query::new(self.key_parts(id, filters)?);
        let present = match self.inner.repository.exists(&query).await {
            Err(err) if err.is_breaker_open() => {
                warn!(breaker = %err, "presence check re-issued around the memory tier");
                self.inner.repository.exists(&query.bypass_memory()).await
            }
            other => other,
        }?;

        if let Some(exists_cache) = &self.inner.exists_cache {
            exists_cache.set(ck, present);
        }
        Ok(present)
    }

    /// Presence fan-out parallel to `ids`.
    pub async fn exists_many(
        &self,
        ids: &[String],
        filters: &[(String, String)],
    ) -> Result<Vec<bool>> {
        futures::stream::iter(ids.iter().map(|id| {
            let service = self.clone();
            let filters = filters.to_vec();
            let id = id.clone();
            async move { service.exists(&id, &filters).await }
        }))
        .buffered(self.inner.fan_out)
        .try_collect()
        .await
    }

    /// Close tier pools and drop cached state.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(cache) = &self.inner.cache {
            cache.clear();
        }
        if let Some(exists_cache) = &self.inner.exists_cache {
            exists_cache.clear();
        }
        self.inner.repository.shutdown().await
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn resolve_get(&self, query: &Query) -> Result<K::Entity> {
        match self.inner.repository.get(query).await {
            Err(err) if err.is_breaker_open() => {
                warn!(breaker = %err, "read re-issued around the memory tier");
                self.inner.repository.get(&query.bypass_memory()).await
            }
            other => other,
        }
    }

    /// Cache key over the id, its key-attribute filters, and every set
    /// query option, so differently-shaped reads never share an entry.
    fn read_cache_key(&self, id: &str, filters: &[(String, String)], options: &QueryOptions) -> String {
        let mut pairs = filters.to_vec();
        pairs.extend(options.filter_pairs());
        cache_key(id, &pairs)
    }

    /// Ordered key parts from an id and its filters, following the
    /// configured key attributes; the last attribute is the id.
    fn key_parts(&self, id: &str, filters: &[(String, String)]) -> Result<Vec<String>> {
        let config = self.inner.repository.config();
        let Some((_, prefix_attrs)) = config.key_attrs.split_last() else {
            return Err(Error::RequiredConfigAttribute("key_attrs"));
        };

        for (name, _) in filters {
            if !prefix_attrs.contains(name) {
                return Err(Error::InvalidQuery(format!("unknown filter '{name}'")));
            }
        }

        let mut parts = Vec::with_capacity(config.key_attrs.len());
        for attr in prefix_attrs {
            let value = filters
                .iter()
                .find(|(name, _)| name == attr)
                .map(|(_, value)| value.clone())
                .ok_or_else(|| Error::InvalidQuery(format!("missing filter '{attr}'")))?;
            parts.push(value);
        }
        parts.push(id.to_string());
        Ok(parts)
    }

    /// Cache id and filters back-derived from an entity's key parts.
    fn entity_cache_parts(&self, entity: &K::Entity) -> Result<(String, Vec<(String, String)>)> {
        let config = self.inner.repository.config();
        let parts = self.inner.repository.key_parts_of(entity)?;
        let Some((id, prefix)) = parts.split_last() else {
            return Err(Error::RequiredConfigAttribute("key_attrs"));
        };
        let filters = config
            .key_attrs
            .iter()
            .zip(prefix)
            .map(|(attr, value)| (attr.clone(), value.clone()))
            .collect();
        Ok((id.clone(), filters))
    }

    fn not_found(&self, id: &str, filters: &[(String, String)]) -> Error {
        let config = self.inner.repository.config();
        let key = match self.key_parts(id, filters) {
            Ok(parts) => parts.join(":"),
            Err(_) => id.to_string(),
        };
        Error::not_found(&config.entity_name, key)
    }
}
