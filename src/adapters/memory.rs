//! In-memory tier adapters for testing.
//!
//! Lock-free storage via DashMap with per-op counters, lazy TTL expiry,
//! and fault injection for breaker and disaster-path tests. Semantics
//! track the real drivers: empty hash replies mean an absent key,
//! sorted-set ranges order by (score, member), geo radius uses the same
//! haversine distance as the geo kind's fallback materialisation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;

use crate::domain::geo::haversine_meters;
use crate::domain::ports::{
    FallbackKey, FallbackStore, GeoMember, GeoRadius, MemoryNode, PutOptions, ReadOp, ReadReply,
    ScoredMember, WriteOp,
};
use crate::error::{Error, Result};

// =============================================================================
// Memory node
// =============================================================================

#[derive(Debug, Clone)]
enum Stored {
    Scalar(Bytes),
    Hash(HashMap<String, String>),
    Sorted(HashMap<String, f64>),
    Geo(HashMap<String, (f64, f64)>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Stored,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory memory-tier node for testing.
pub struct InMemoryMemoryNode {
    data: DashMap<String, Slot>,
    read_ops: AtomicU64,
    write_ops: AtomicU64,
    exists_ops: AtomicU64,
    /// Remaining injected failures; each op consumes one
    failures: AtomicU32,
}

impl Default for InMemoryMemoryNode {
    fn default() -> Self {
        Self {
            data: DashMap::new(),
            read_ops: AtomicU64::new(0),
            write_ops: AtomicU64::new(0),
            exists_ops: AtomicU64::new(0),
            failures: AtomicU32::new(0),
        }
    }
}

impl InMemoryMemoryNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` operations fail with a tier error.
    pub fn inject_failures(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn read_ops(&self) -> u64 {
        self.read_ops.load(Ordering::Relaxed)
    }

    pub fn write_ops(&self) -> u64 {
        self.write_ops.load(Ordering::Relaxed)
    }

    pub fn exists_ops(&self) -> u64 {
        self.exists_ops.load(Ordering::Relaxed)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.data.retain(|_, slot| !slot.is_expired());
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw scalar value of a live key, for assertions.
    pub fn scalar(&self, key: &str) -> Option<Bytes> {
        match self.live(key)? {
            Stored::Scalar(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Live key presence, without counting as an op.
    pub fn contains(&self, key: &str) -> bool {
        self.live(key).is_some()
    }

    /// Whether a live key carries a TTL.
    pub fn has_ttl(&self, key: &str) -> bool {
        self.data
            .get(key)
            .filter(|slot| !slot.is_expired())
            .map(|slot| slot.expires_at.is_some())
            .unwrap_or(false)
    }

    fn live(&self, key: &str) -> Option<Stored> {
        let expired = match self.data.get(key) {
            Some(slot) if slot.is_expired() => true,
            Some(slot) => return Some(slot.value.clone()),
            None => return None,
        };
        if expired {
            self.data.remove(key);
        }
        None
    }

    fn take_failure(&self) -> Result<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .failures
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(Error::memory_tier("injected failure"));
        }
        Ok(())
    }

    fn apply_read(&self, op: &ReadOp) -> Result<ReadReply> {
        match op {
            ReadOp::Get(key) => {
                let value = match self.live(key) {
                    Some(Stored::Scalar(bytes)) => Some(bytes),
                    Some(_) => return Err(Error::memory_tier("WRONGTYPE")),
                    None => None,
                };
                Ok(ReadReply::Value(value))
            }
            ReadOp::Exists(key) => {
                self.exists_ops.fetch_add(1, Ordering::Relaxed);
                Ok(ReadReply::Exists(self.live(key).is_some()))
            }
            ReadOp::HGetAll(key) => match self.live(key) {
                Some(Stored::Hash(map)) => Ok(ReadReply::Fields(map)),
                Some(_) => Err(Error::memory_tier("WRONGTYPE")),
                None => Ok(ReadReply::Fields(HashMap::new())),
            },
            ReadOp::HGet(key, fields) => {
                let map = match self.live(key) {
                    Some(Stored::Hash(map)) => map,
                    Some(_) => return Err(Error::memory_tier("WRONGTYPE")),
                    None => HashMap::new(),
                };
                Ok(ReadReply::FieldValues(
                    fields.iter().map(|f| map.get(f).cloned()).collect(),
                ))
            }
            ReadOp::ZRange {
                key,
                start,
                stop,
                reverse,
                withscores,
            } => {
                let mut pairs = self.sorted_pairs(key)?;
                if *reverse {
                    pairs.reverse();
                }

                let len = pairs.len() as isize;
                let norm = |i: isize| if i < 0 { len + i } else { i };
                let from = norm(*start).max(0);
                let to = norm(*stop).min(len - 1);

                let members = if from > to || from >= len {
                    Vec::new()
                } else {
                    pairs[from as usize..=to as usize]
                        .iter()
                        .map(|(member, score)| ScoredMember {
                            member: member.clone(),
                            score: withscores.then_some(*score),
                        })
                        .collect()
                };
                Ok(ReadReply::Members(members))
            }
            ReadOp::ZRangeByScore {
                key,
                min,
                max,
                offset,
                count,
                withscores,
            } => {
                let pairs = self.sorted_pairs(key)?;
                let in_range = pairs
                    .into_iter()
                    .filter(|(_, score)| score >= min && score <= max);

                let selected: Vec<(String, f64)> = match (offset, count) {
                    (Some(offset), Some(count)) => in_range.skip(*offset).take(*count).collect(),
                    _ => in_range.collect(),
                };

                Ok(ReadReply::Members(
                    selected
                        .into_iter()
                        .map(|(member, score)| ScoredMember {
                            member,
                            score: withscores.then_some(score),
                        })
                        .collect(),
                ))
            }
            ReadOp::GeoRadius { key, query } => {
                let points = match self.live(key) {
                    Some(Stored::Geo(points)) => points,
                    Some(_) => return Err(Error::memory_tier("WRONGTYPE")),
                    None => HashMap::new(),
                };
                Ok(ReadReply::GeoMembers(radius_select(&points, query)))
            }
        }
    }

    fn sorted_pairs(&self, key: &str) -> Result<Vec<(String, f64)>> {
        let map = match self.live(key) {
            Some(Stored::Sorted(map)) => map,
            Some(_) => return Err(Error::memory_tier("WRONGTYPE")),
            None => HashMap::new(),
        };
        let mut pairs: Vec<(String, f64)> = map.into_iter().collect();
        pairs.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        Ok(pairs)
    }

    fn apply_write(&self, op: WriteOp) -> Result<()> {
        match op {
            WriteOp::Delete(key) => {
                self.data.remove(&key);
            }
            WriteOp::Set(key, value) => {
                self.data.insert(
                    key,
                    Slot {
                        value: Stored::Scalar(value),
                        expires_at: None,
                    },
                );
            }
            WriteOp::Expire(key, ttl) => {
                if let Some(mut slot) = self.data.get_mut(&key) {
                    slot.expires_at = Some(Instant::now() + ttl);
                }
            }
            WriteOp::HSet(key, fields) => {
                let mut slot = self.data.entry(key).or_insert_with(|| Slot {
                    value: Stored::Hash(HashMap::new()),
                    expires_at: None,
                });
                match &mut slot.value {
                    Stored::Hash(map) => map.extend(fields),
                    _ => return Err(Error::memory_tier("WRONGTYPE")),
                }
            }
            WriteOp::ZAdd(key, members) => {
                let mut slot = self.data.entry(key).or_insert_with(|| Slot {
                    value: Stored::Sorted(HashMap::new()),
                    expires_at: None,
                });
                match &mut slot.value {
                    Stored::Sorted(map) => map.extend(members),
                    _ => return Err(Error::memory_tier("WRONGTYPE")),
                }
            }
            WriteOp::GeoAdd(key, points) => {
                let mut slot = self.data.entry(key).or_insert_with(|| Slot {
                    value: Stored::Geo(HashMap::new()),
                    expires_at: None,
                });
                match &mut slot.value {
                    Stored::Geo(map) => {
                        for (member, latitude, longitude) in points {
                            map.insert(member, (latitude, longitude));
                        }
                    }
                    _ => return Err(Error::memory_tier("WRONGTYPE")),
                }
            }
        }
        Ok(())
    }
}

fn radius_select(points: &HashMap<String, (f64, f64)>, query: &GeoRadius) -> Vec<GeoMember> {
    let radius_meters = query.unit.to_meters(query.radius);

    let mut selected: Vec<(GeoMember, f64)> = Vec::new();
    for (member, (latitude, longitude)) in points {
        let distance = haversine_meters(query.latitude, query.longitude, *latitude, *longitude);
        if distance <= radius_meters {
            selected.push((
                GeoMember {
                    member: member.clone(),
                    latitude: query.with_coord.then_some(*latitude),
                    longitude: query.with_coord.then_some(*longitude),
                    distance: query.with_dist.then(|| query.unit.from_meters(distance)),
                },
                distance,
            ));
        }
    }

    selected.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    if let Some(count) = query.count {
        selected.truncate(count);
    }
    selected.into_iter().map(|(point, _)| point).collect()
}

#[async_trait]
impl MemoryNode for InMemoryMemoryNode {
    async fn read_batch(&self, ops: Vec<ReadOp>) -> Result<Vec<ReadReply>> {
        self.read_ops.fetch_add(ops.len() as u64, Ordering::Relaxed);
        self.take_failure()?;
        ops.iter().map(|op| self.apply_read(op)).collect()
    }

    async fn write_batch(&self, ops: Vec<WriteOp>, _atomic: bool) -> Result<()> {
        self.write_ops.fetch_add(ops.len() as u64, Ordering::Relaxed);
        self.take_failure()?;
        for op in ops {
            self.apply_write(op)?;
        }
        Ok(())
    }
}

// =============================================================================
// Fallback store
// =============================================================================

/// In-memory fallback store for testing.
pub struct InMemoryFallbackStore {
    collections: DashMap<String, DashMap<String, Value>>,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    failures: AtomicU32,
}

impl Default for InMemoryFallbackStore {
    fn default() -> Self {
        Self {
            collections: DashMap::new(),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            failures: AtomicU32::new(0),
        }
    }
}

impl InMemoryFallbackStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` operations fail with a tier error.
    pub fn inject_failures(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    /// Seed a document directly, bypassing counters.
    pub fn seed(&self, collection: &str, id: &str, doc: Value) {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc);
    }

    /// Number of documents in a collection.
    pub fn collection_len(&self, collection: &str) -> usize {
        self.collections
            .get(collection)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    fn take_failure(&self) -> Result<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .failures
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(Error::fallback_tier("injected failure"));
        }
        Ok(())
    }

    fn lookup(&self, key: &FallbackKey) -> Option<Value> {
        self.collections
            .get(&key.collection)
            .and_then(|collection| collection.get(&key.id).map(|doc| doc.clone()))
    }
}

#[async_trait]
impl FallbackStore for InMemoryFallbackStore {
    async fn get(&self, key: &FallbackKey) -> Result<Option<Value>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.take_failure()?;
        Ok(self.lookup(key))
    }

    async fn put(&self, key: &FallbackKey, doc: &Value, _options: &PutOptions) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.take_failure()?;
        self.collections
            .entry(key.collection.clone())
            .or_default()
            .insert(key.id.clone(), doc.clone());
        Ok(())
    }

    async fn delete(&self, key: &FallbackKey) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.take_failure()?;
        if let Some(collection) = self.collections.get(&key.collection) {
            collection.remove(&key.id);
        }
        Ok(())
    }

    async fn get_many(&self, keys: &[FallbackKey]) -> Result<Vec<Option<Value>>> {
        self.reads.fetch_add(keys.len() as u64, Ordering::Relaxed);
        self.take_failure()?;
        Ok(keys.iter().map(|key| self.lookup(key)).collect())
    }
}

// =============================================================================
// Tests
// =============================================================================
