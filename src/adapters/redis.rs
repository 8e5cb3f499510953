//! Redis Memory-Node Adapter
//!
//! Implements the `MemoryNode` port over a multiplexed connection
//! manager. Read batches travel as one pipeline; write batches as one
//! `MULTI`/`EXEC` transaction when atomic.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::Pipeline;
use tracing::debug;

use crate::domain::ports::{GeoMember, MemoryNode, ReadOp, ReadReply, ScoredMember, WriteOp};
use crate::error::Result;

/// One Redis shard of the memory tier.
pub struct RedisMemoryNode {
    manager: ConnectionManager,
}

impl RedisMemoryNode {
    /// Connect to a Redis URL (`redis://host:port/db`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        debug!(url, "connected redis memory node");
        Ok(Self { manager })
    }

    /// Wrap an existing connection manager.
    pub fn from_manager(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    fn add_read(pipe: &mut Pipeline, op: &ReadOp) {
        match op {
            ReadOp::Get(key) => {
                pipe.cmd("GET").arg(key);
            }
            ReadOp::Exists(key) => {
                pipe.cmd("EXISTS").arg(key);
            }
            ReadOp::HGetAll(key) => {
                pipe.cmd("HGETALL").arg(key);
            }
            ReadOp::HGet(key, fields) => {
                let cmd = pipe.cmd("HMGET").arg(key);
                for field in fields {
                    cmd.arg(field);
                }
            }
            ReadOp::ZRange {
                key,
                start,
                stop,
                reverse,
                withscores,
            } => {
                let name = if *reverse { "ZREVRANGE" } else { "ZRANGE" };
                let cmd = pipe.cmd(name).arg(key).arg(*start).arg(*stop);
                if *withscores {
                    cmd.arg("WITHSCORES");
                }
            }
            ReadOp::ZRangeByScore {
                key,
                min,
                max,
                offset,
                count,
                withscores,
            } => {
                let cmd = pipe.cmd("ZRANGEBYSCORE").arg(key).arg(*min).arg(*max);
                if *withscores {
                    cmd.arg("WITHSCORES");
                }
                if let (Some(offset), Some(count)) = (offset, count) {
                    cmd.arg("LIMIT").arg(*offset).arg(*count);
                }
            }
            ReadOp::GeoRadius { key, query } => {
                let cmd = pipe
                    .cmd("GEORADIUS")
                    .arg(key)
                    .arg(query.longitude)
                    .arg(query.latitude)
                    .arg(query.radius)
                    .arg(query.unit.as_str());
                if query.with_dist {
                    cmd.arg("WITHDIST");
                }
                if query.with_coord {
                    cmd.arg("WITHCOORD");
                }
                if let Some(count) = query.count {
                    cmd.arg("COUNT").arg(count);
                }
                cmd.arg("ASC");
            }
        }
    }

    fn decode_reply(op: &ReadOp, value: redis::Value) -> Result<ReadReply> {
        match op {
            ReadOp::Get(_) => {
                let bytes: Option<Vec<u8>> = redis::from_redis_value(&value)?;
                Ok(ReadReply::Value(bytes.map(Bytes::from)))
            }
            ReadOp::Exists(_) => {
                let present: bool = redis::from_redis_value(&value)?;
                Ok(ReadReply::Exists(present))
            }
            ReadOp::HGetAll(_) => {
                let fields: HashMap<String, String> = redis::from_redis_value(&value)?;
                Ok(ReadReply::Fields(fields))
            }
            ReadOp::HGet(_, _) => {
                let values: Vec<Option<String>> = redis::from_redis_value(&value)?;
                Ok(ReadReply::FieldValues(values))
            }
            ReadOp::ZRange { withscores, .. } | ReadOp::ZRangeByScore { withscores, .. } => {
                let members = if *withscores {
                    let pairs: Vec<(String, f64)> = redis::from_redis_value(&value)?;
                    pairs
                        .into_iter()
                        .map(|(member, score)| ScoredMember::scored(member, score))
                        .collect()
                } else {
                    let names: Vec<String> = redis::from_redis_value(&value)?;
                    names.into_iter().map(ScoredMember::bare).collect()
                };
                Ok(ReadReply::Members(members))
            }
            ReadOp::GeoRadius { query, .. } => {
                // GEORADIUS replies grow fields in a fixed order:
                // member, then distance, then (longitude, latitude).
                let members = match (query.with_dist, query.with_coord) {
                    (false, false) => {
                        let names: Vec<String> = redis::from_redis_value(&value)?;
                        names
                            .into_iter()
                            .map(|member| GeoMember {
                                member,
                                latitude: None,
                                longitude: None,
                                distance: None,
                            })
                            .collect()
                    }
                    (true, false) => {
                        let rows: Vec<(String, f64)> = redis::from_redis_value(&value)?;
                        rows.into_iter()
                            .map(|(member, distance)| GeoMember {
                                member,
                                latitude: None,
                                longitude: None,
                                distance: Some(distance),
                            })
                            .collect()
                    }
                    (false, true) => {
                        let rows: Vec<(String, (f64, f64))> = redis::from_redis_value(&value)?;
                        rows.into_iter()
                            .map(|(member, (longitude, latitude))| GeoMember {
                                member,
                                latitude: Some(latitude),
                                longitude: Some(longitude),
                                distance: None,
                            })
                            .collect()
                    }
                    (true, true) => {
                        let rows: Vec<(String, f64, (f64, f64))> =
                            redis::from_redis_value(&value)?;
                        rows.into_iter()
                            .map(|(member, distance, (longitude, latitude))| GeoMember {
                                member,
                                latitude: Some(latitude),
                                longitude: Some(longitude),
                                distance: Some(distance),
                            })
                            .collect()
                    }
                };
                Ok(ReadReply::GeoMembers(members))
            }
        }
    }

    fn add_write(pipe: &mut Pipeline, op: &WriteOp) {
        match op {
            WriteOp::Delete(key) => {
                pipe.cmd("DEL").arg(key);
            }
            WriteOp::Set(key, value) => {
                pipe.cmd("SET").arg(key).arg(value.as_ref());
            }
            WriteOp::Expire(key, ttl) => {
                pipe.cmd("EXPIRE").arg(key).arg(ttl.as_secs().max(1));
            }
            WriteOp::HSet(key, fields) => {
                let cmd = pipe.cmd("HSET").arg(key);
                for (field, value) in fields {
                    cmd.arg(field).arg(value);
                }
            }
            WriteOp::ZAdd(key, members) => {
                let cmd = pipe.cmd("ZADD").arg(key);
                for (member, score) in members {
                    cmd.arg(*score).arg(member);
                }
            }
            WriteOp::GeoAdd(key, points) => {
                let cmd = pipe.cmd("GEOADD").arg(key);
                for (member, latitude, longitude) in points {
                    cmd.arg(*longitude).arg(*latitude).arg(member);
                }
            }
        }
    }
}

#[async_trait]
impl MemoryNode for RedisMemoryNode {
    async fn read_batch(&self, ops: Vec<ReadOp>) -> Result<Vec<ReadReply>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for op in &ops {
            Self::add_read(&mut pipe, op);
        }

        let mut conn = self.manager.clone();
        let values: Vec<redis::Value> = pipe.query_async(&mut conn).await?;

        ops.iter()
            .zip(values)
            .map(|(op, value)| Self::decode_reply(op, value))
            .collect()
    }

    async fn write_batch(&self, ops: Vec<WriteOp>, atomic: bool) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        if atomic {
            pipe.atomic();
        }
        for op in &ops {
            Self::add_write(&mut pipe, op);
            pipe.ignore();
        }

        let mut conn = self.manager.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}
