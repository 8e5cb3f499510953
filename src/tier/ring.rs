//! Hash Ring - Deterministic Key Sharding
//!
//! Maps a key to one of N memory nodes by stable hash. The ring is
//! immutable: callers reconstruct one for topology changes, so
//! `node_index_for` is a pure function of the key and the fixed node
//! list.

use md5::{Digest, Md5};

use crate::error::{Error, Result};

/// Consistent-hash ring over a fixed node list.
///
/// The ring holds `virtual_nodes` slots (default one per node) assigned
/// round-robin; a key hashes to a slot and the slot names the node.
#[derive(Debug, Clone)]
pub struct HashRing {
    /// Slot index -> node index
    slots: Vec<usize>,
    /// Number of physical nodes
    node_count: usize,
}

impl HashRing {
    /// Ring with one slot per node.
    pub fn new(node_count: usize) -> Result<Self> {
        Self::with_virtual_nodes(node_count, node_count)
    }

    /// Ring with a virtual-node multiplier. `virtual_nodes` must be at
    /// least the node count so every node owns a slot.
    pub fn with_virtual_nodes(node_count: usize, virtual_nodes: usize) -> Result<Self> {
        if node_count == 0 {
            return Err(Error::Config(
                "hash ring requires at least one node".to_string(),
            ));
        }
        if virtual_nodes < node_count {
            return Err(Error::Config(format!(
                "virtual node count {virtual_nodes} is below node count {node_count}"
            )));
        }

        let slots = (0..virtual_nodes).map(|i| i % node_count).collect();
        Ok(Self { slots, node_count })
    }

    /// Node index owning `key`.
    pub fn node_index_for(&self, key: &str) -> usize {
        let digest: [u8; 16] = Md5::digest(key.as_bytes()).into();
        let hash = u128::from_be_bytes(digest);
        self.slots[(hash % self.slots.len() as u128) as usize]
    }

    /// Number of physical nodes.
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// Number of virtual slots.
    pub fn virtual_nodes(&self) -> usize {
        self.slots.len()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_ring_rejected() {
        assert!(HashRing::new(0).is_err());
    }

    #[test]
    fn test_undersized_virtual_nodes_rejected() {
        assert!(HashRing::with_virtual_nodes(4, 2).is_err());
    }

    #[test]
    fn test_single_node_gets_everything() {
        let ring = HashRing::new(1).unwrap();
        for key in ["a", "person:p1", "entity:not-found:x"] {
            assert_eq!(ring.node_index_for(key), 0);
        }
    }

    #[test]
    fn test_deterministic_routing() {
        let ring = HashRing::new(3).unwrap();
        let first = ring.node_index_for("person:p1");
        for _ in 0..10 {
            assert_eq!(ring.node_index_for("person:p1"), first);
        }

        // A fresh ring with the same topology routes identically.
        let other = HashRing::new(3).unwrap();
        assert_eq!(other.node_index_for("person:p1"), first);
    }

    #[test]
    fn test_virtual_nodes_cover_all_nodes() {
        let ring = HashRing::with_virtual_nodes(3, 12).unwrap();
        assert_eq!(ring.virtual_nodes(), 12);

        let mut seen = [false; 3];
        for i in 0..5000 {
            seen[ring.node_index_for(&format!("key-{i}"))] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_balanced_within_bounded_skew() {
        let ring = HashRing::new(3).unwrap();
        let mut counts = [0usize; 3];
        for i in 0..30_000 {
            counts[ring.node_index_for(&format!("entity:key-{i}"))] += 1;
        }
        for count in counts {
            // Expect ~10k per node; allow generous skew.
            assert!((7_000..=13_000).contains(&count), "skewed: {counts:?}");
        }
    }

    proptest! {
        #[test]
        fn prop_routing_in_bounds(key in ".*", nodes in 1usize..16) {
            let ring = HashRing::new(nodes).unwrap();
            prop_assert!(ring.node_index_for(&key) < nodes);
        }

        #[test]
        fn prop_routing_is_pure(key in ".*") {
            let ring = HashRing::new(5).unwrap();
            prop_assert_eq!(ring.node_index_for(&key), ring.node_index_for(&key));
        }
    }
}
