//! Memory Tier - Sharded Remote Key-Value Store
//!
//! Presents one uniform surface regardless of shard count. For each
//! operation the caller supplies a key; the tier routes through the
//! hash ring and issues the call to the chosen node. Multi-key batches
//! are grouped per node and pipelined.
//!
//! The tier does not interpret failures - they surface as the single
//! tier-error kind and the circuit breaker decides what to do.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::domain::ports::{
    GeoMember, GeoRadius, MemoryBatch, MemoryNode, ReadOp, ReadReply, ScoredMember, WriteOp,
};
use crate::error::{Error, Result};
use crate::tier::ring::HashRing;

/// Sharded memory tier over one or many nodes.
pub struct MemoryTier {
    nodes: Vec<Arc<dyn MemoryNode>>,
    ring: HashRing,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryTier {
    /// Tier with one virtual slot per node.
    pub fn new(nodes: Vec<Arc<dyn MemoryNode>>) -> Result<Self> {
        let ring = HashRing::new(nodes.len())?;
        Ok(Self {
            nodes,
            ring,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }

    /// Tier with an explicit virtual-node multiplier.
    pub fn with_virtual_nodes(nodes: Vec<Arc<dyn MemoryNode>>, virtual_nodes: usize) -> Result<Self> {
        let ring = HashRing::with_virtual_nodes(nodes.len(), virtual_nodes)?;
        Ok(Self {
            nodes,
            ring,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }

    /// The ring used for routing.
    pub fn ring(&self) -> &HashRing {
        &self.ring
    }

    /// Number of shards.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn node_for(&self, key: &str) -> &Arc<dyn MemoryNode> {
        &self.nodes[self.ring.node_index_for(key)]
    }

    // =========================================================================
    // Scalar ops
    // =========================================================================

    /// Stored bytes or absent.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match self.read_one(ReadOp::Get(key.to_string())).await? {
            ReadReply::Value(v) => Ok(v),
            other => Err(reply_mismatch("get", &other)),
        }
    }

    /// Store bytes.
    pub async fn set(&self, key: &str, value: impl Into<Bytes>) -> Result<()> {
        self.write_one(WriteOp::Set(key.to_string(), value.into()))
            .await
    }

    /// Idempotent removal.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.write_one(WriteOp::Delete(key.to_string())).await
    }

    /// Boolean presence.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self.read_one(ReadOp::Exists(key.to_string())).await? {
            ReadReply::Exists(b) => Ok(b),
            other => Err(reply_mismatch("exists", &other)),
        }
    }

    /// Set a TTL; silently ignored by the node if the key is absent.
    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.write_one(WriteOp::Expire(key.to_string(), ttl)).await
    }

    // =========================================================================
    // Hash-map ops
    // =========================================================================

    pub async fn hset(&self, key: &str, fields: Vec<(String, String)>) -> Result<()> {
        self.write_one(WriteOp::HSet(key.to_string(), fields)).await
    }

    /// Parallel sequence with absent fields as `None`.
    pub async fn hmget(&self, key: &str, fields: Vec<String>) -> Result<Vec<Option<String>>> {
        match self.read_one(ReadOp::HGet(key.to_string(), fields)).await? {
            ReadReply::FieldValues(v) => Ok(v),
            other => Err(reply_mismatch("hmget", &other)),
        }
    }

    pub async fn hgetall(&self, key: &str) -> Result<std::collections::HashMap<String, String>> {
        match self.read_one(ReadOp::HGetAll(key.to_string())).await? {
            ReadReply::Fields(map) => Ok(map),
            other => Err(reply_mismatch("hgetall", &other)),
        }
    }

    // =========================================================================
    // Sorted-set ops
    // =========================================================================

    pub async fn zadd(&self, key: &str, members: Vec<(String, f64)>) -> Result<()> {
        self.write_one(WriteOp::ZAdd(key.to_string(), members)).await
    }

    pub async fn zrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
        reverse: bool,
        withscores: bool,
    ) -> Result<Vec<ScoredMember>> {
        let op = ReadOp::ZRange {
            key: key.to_string(),
            start,
            stop,
            reverse,
            withscores,
        };
        match self.read_one(op).await? {
            ReadReply::Members(m) => Ok(m),
            other => Err(reply_mismatch("zrange", &other)),
        }
    }

    pub async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        offset: Option<usize>,
        count: Option<usize>,
        withscores: bool,
    ) -> Result<Vec<ScoredMember>> {
        let op = ReadOp::ZRangeByScore {
            key: key.to_string(),
            min,
            max,
            offset,
            count,
            withscores,
        };
        match self.read_one(op).await? {
            ReadReply::Members(m) => Ok(m),
            other => Err(reply_mismatch("zrangebyscore", &other)),
        }
    }

    // =========================================================================
    // Geo ops
    // =========================================================================

    pub async fn geo_add(&self, key: &str, points: Vec<(String, f64, f64)>) -> Result<()> {
        self.write_one(WriteOp::GeoAdd(key.to_string(), points))
            .await
    }

    pub async fn geo_radius(&self, key: &str, query: GeoRadius) -> Result<Vec<GeoMember>> {
        let op = ReadOp::GeoRadius {
            key: key.to_string(),
            query,
        };
        match self.read_one(op).await? {
            ReadReply::GeoMembers(m) => Ok(m),
            other => Err(reply_mismatch("georadius", &other)),
        }
    }

    // =========================================================================
    // Batches
    // =========================================================================

    /// Execute reads across shards, replying in input order. Ops are
    /// grouped per node and each group travels as one pipeline.
    pub async fn read_batch(&self, ops: Vec<ReadOp>) -> Result<Vec<ReadReply>> {
        self.reads.fetch_add(ops.len() as u64, Ordering::Relaxed);

        if ops.is_empty() {
            return Ok(Vec::new());
        }

        let mut grouped: Vec<Vec<(usize, ReadOp)>> = vec![Vec::new(); self.nodes.len()];
        for (idx, op) in ops.into_iter().enumerate() {
            grouped[self.ring.node_index_for(op.key())].push((idx, op));
        }

        let mut pending = Vec::new();
        for (node_idx, group) in grouped.into_iter().enumerate() {
            if group.is_empty() {
                continue;
            }
            let (indexes, node_ops): (Vec<usize>, Vec<ReadOp>) = group.into_iter().unzip();
            let node = Arc::clone(&self.nodes[node_idx]);
            pending.push(async move {
                let replies = node.read_batch(node_ops).await?;
                Ok::<_, Error>((indexes, replies))
            });
        }

        let mut slots: Vec<Option<ReadReply>> = Vec::new();
        let results = futures::future::try_join_all(pending).await?;
        for (indexes, replies) in results {
            for (idx, reply) in indexes.into_iter().zip(replies) {
                if slots.len() <= idx {
                    slots.resize(idx + 1, None);
                }
                slots[idx] = Some(reply);
            }
        }

        slots
            .into_iter()
            .map(|s| s.ok_or_else(|| Error::memory_tier("node dropped a batched reply")))
            .collect()
    }

    /// Execute a write batch. Ops are grouped per node; each group is
    /// applied atomically on its node (`multi_exec`).
    pub async fn exec(&self, batch: MemoryBatch) -> Result<()> {
        self.writes.fetch_add(batch.len() as u64, Ordering::Relaxed);

        if batch.is_empty() {
            return Ok(());
        }

        let mut grouped: Vec<Vec<WriteOp>> = vec![Vec::new(); self.nodes.len()];
        for op in batch.into_ops() {
            grouped[self.ring.node_index_for(op.key())].push(op);
        }

        let mut pending = Vec::new();
        for (node_idx, group) in grouped.into_iter().enumerate() {
            if group.is_empty() {
                continue;
            }
            let node = Arc::clone(&self.nodes[node_idx]);
            pending.push(async move { node.write_batch(group, true).await });
        }

        futures::future::try_join_all(pending).await?;
        Ok(())
    }

    /// Close every node's connection pool.
    pub async fn shutdown(&self) -> Result<()> {
        for node in &self.nodes {
            node.shutdown().await?;
        }
        Ok(())
    }

    /// Counter snapshot.
    pub fn stats(&self) -> MemoryTierStats {
        MemoryTierStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            nodes: self.nodes.len(),
        }
    }

    async fn read_one(&self, op: ReadOp) -> Result<ReadReply> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let node = self.node_for(op.key());
        let mut replies = node.read_batch(vec![op]).await?;
        replies
            .pop()
            .ok_or_else(|| Error::memory_tier("node returned an empty reply batch"))
    }

    async fn write_one(&self, op: WriteOp) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let node = self.node_for(op.key());
        node.write_batch(vec![op], false).await
    }
}

/// Memory-tier counter snapshot.
#[derive(Debug, Clone)]
pub struct MemoryTierStats {
    pub reads: u64,
    pub writes: u64,
    pub nodes: usize,
}

fn reply_mismatch(op: &str, reply: &ReadReply) -> Error {
    Error::memory_tier(format!("unexpected reply for {op}: {reply:?}"))
}

// =============================================================================
// Tests
// =============================================================================
