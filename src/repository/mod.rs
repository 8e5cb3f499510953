//! Repository layer: the generic coordinator and its entity kinds.

mod boolean;
mod config;
mod coordinator;
mod geo;
mod hash;
mod kind;
mod query;
mod sorted_set;

pub use boolean::{BooleanEntry, BooleanKind};
pub use config::{RepositoryConfig, NOT_FOUND_TAG};
pub use coordinator::{Repository, RepositoryStats};
pub use geo::{GeoEntry, GeoKind};
pub use hash::HashKind;
pub use kind::EntityKind;
pub use query::{Query, QueryMany, QueryOptions};
pub use sorted_set::{SortedSetEntry, SortedSetKind};
