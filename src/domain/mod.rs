//! Domain layer: tier ports and the value objects that cross them.

pub mod geo;
pub mod ports;

pub use geo::{haversine_meters, DistanceUnit};
pub use ports::{
    FallbackKey, FallbackStore, GeoMember, GeoRadius, MemoryBatch, MemoryNode, PutOptions, ReadOp,
    ReadReply, ScoredMember, WriteOp,
};
