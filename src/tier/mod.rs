//! Tier machinery: consistent-hash sharding, the sharded memory tier,
//! the fallback tier, and the per-tier circuit breaker.

mod breaker;
mod fallback;
mod memory;
mod ring;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use fallback::{FallbackTier, FallbackTierStats};
pub use memory::{MemoryTier, MemoryTierStats};
pub use ring::HashRing;
