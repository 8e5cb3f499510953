//! Infrastructure adapters implementing the tier ports.

pub mod memory;
pub mod mongo;
pub mod redis;

pub use memory::{InMemoryFallbackStore, InMemoryMemoryNode};
pub use mongo::MongoFallbackStore;
pub use redis::RedisMemoryNode;
