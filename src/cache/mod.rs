//! Local Cache - Process-Local Short-TTL Cache
//!
//! Bounded in-process cache sitting in front of the remote memory tier.
//! Four variants selected by configuration:
//!
//! - **LRU** / **LFU**: bounded by `max_size`, evicting one entry on
//!   overflow.
//! - **TTL**: bounded by `max_size`; entries expire after `ttl`.
//! - **Jittered TTL**: like TTL but each entry's effective expiry is
//!   `now + ttl - U(0, jitter)`, spreading expiry to avoid synchronized
//!   refresh storms.
//!
//! The TTL variants are insertion-order bounded: insertions when full
//! are dropped, existing entries remain. Expiry is lazy, checked on
//! `get`.
//!
//! Values are [`CacheSlot`]s: the entity, or the already-not-found
//! sentinel that short-circuits repeated misses without touching the
//! remote tiers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

/// Cache variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheType {
    #[default]
    Lru,
    Lfu,
    Ttl,
    JitteredTtl,
}

/// Local cache configuration.
#[derive(Debug, Clone)]
pub struct LocalCacheConfig {
    pub cache_type: CacheType,
    /// Maximum number of entries
    pub max_size: usize,
    /// Entry lifetime for the TTL variants
    pub ttl: Option<Duration>,
    /// Maximum uniform reduction of the TTL for the jittered variant
    pub jitter: Option<Duration>,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            cache_type: CacheType::Lru,
            max_size: 1024,
            ttl: None,
            jitter: None,
        }
    }
}

impl LocalCacheConfig {
    pub fn lru(max_size: usize) -> Self {
        Self {
            cache_type: CacheType::Lru,
            max_size,
            ttl: None,
            jitter: None,
        }
    }

    pub fn lfu(max_size: usize) -> Self {
        Self {
            cache_type: CacheType::Lfu,
            max_size,
            ttl: None,
            jitter: None,
        }
    }

    pub fn ttl(max_size: usize, ttl: Duration) -> Self {
        Self {
            cache_type: CacheType::Ttl,
            max_size,
            ttl: Some(ttl),
            jitter: None,
        }
    }

    pub fn jittered_ttl(max_size: usize, ttl: Duration, jitter: Duration) -> Self {
        Self {
            cache_type: CacheType::JitteredTtl,
            max_size,
            ttl: Some(ttl),
            jitter: Some(jitter),
        }
    }
}

/// A cached read outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheSlot<T> {
    /// The entity
    Found(T),
    /// Sentinel: the tiers already answered not-found
    AlreadyNotFound,
}

struct Slot<T> {
    value: T,
    expires_at: Option<Instant>,
    last_access: Instant,
    access_count: u64,
}

impl<T> Slot<T> {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Bounded process-local cache.
pub struct LocalCache<T> {
    config: LocalCacheConfig,
    entries: Mutex<HashMap<String, Slot<T>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<T: Clone> LocalCache<T> {
    pub fn new(config: LocalCacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Get a value, refreshing recency/frequency tracking.
    pub fn get(&self, key: &str) -> Option<T> {
        let mut entries = self.entries.lock();

        match entries.get_mut(key) {
            Some(slot) if !slot.is_expired() => {
                slot.last_access = Instant::now();
                slot.access_count += 1;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(slot.value.clone());
            }
            Some(_) => {
                entries.remove(key);
            }
            None => {}
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert a value. Replaces an existing entry for the key; when the
    /// cache is full, the LRU/LFU variants evict one entry and the TTL
    /// variants drop the insertion.
    pub fn set(&self, key: impl Into<String>, value: T) {
        let key = key.into();
        let mut entries = self.entries.lock();

        // Expired entries do not count against the bound.
        entries.retain(|_, slot| !slot.is_expired());

        if !entries.contains_key(&key) && entries.len() >= self.config.max_size {
            match self.config.cache_type {
                CacheType::Lru => {
                    if let Some(victim) = entries
                        .iter()
                        .min_by_key(|(_, slot)| slot.last_access)
                        .map(|(k, _)| k.clone())
                    {
                        entries.remove(&victim);
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                }
                CacheType::Lfu => {
                    if let Some(victim) = entries
                        .iter()
                        .min_by_key(|(_, slot)| slot.access_count)
                        .map(|(k, _)| k.clone())
                    {
                        entries.remove(&victim);
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                }
                CacheType::Ttl | CacheType::JitteredTtl => return,
            }
        }

        let now = Instant::now();
        entries.insert(
            key,
            Slot {
                value,
                expires_at: self.expiry_from(now),
                last_access: now,
                access_count: 0,
            },
        );
    }

    /// Remove an entry.
    pub fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    /// Drop all entries.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock();
        entries.retain(|_, slot| !slot.is_expired());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counter snapshot.
    pub fn stats(&self) -> LocalCacheStats {
        LocalCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn expiry_from(&self, now: Instant) -> Option<Instant> {
        let ttl = match self.config.cache_type {
            CacheType::Ttl | CacheType::JitteredTtl => self.config.ttl?,
            _ => return None,
        };

        let jitter = match self.config.cache_type {
            CacheType::JitteredTtl => {
                let max = self.config.jitter.unwrap_or(Duration::ZERO);
                if max.is_zero() {
                    Duration::ZERO
                } else {
                    rand::thread_rng().gen_range(Duration::ZERO..max)
                }
            }
            _ => Duration::ZERO,
        };

        Some(now + ttl.saturating_sub(jitter))
    }
}

/// Local cache counter snapshot.
#[derive(Debug, Clone)]
pub struct LocalCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Derive a cache key from a logical id and its filters.
///
/// Filter pairs are ordered alphabetically by name so the same semantic
/// query always produces the same key regardless of call order.
pub fn cache_key(id: &str, filters: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = filters.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut key = String::from(id);
    for (name, value) in sorted {
        key.push(':');
        key.push_str(name);
        key.push('=');
        key.push_str(value);
    }
    key
}

// =============================================================================
// Tests
// =============================================================================
