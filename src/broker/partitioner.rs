//! Consistent-hash partition selection.
//!
//! Envelopes with the same partition key always land on the same partition,
//! which is what gives per-key ordering.
//!
//! ## Time Complexity
//! - Partition lookup: O(log n) where n = partitions * virtual_nodes
//! - Ring construction: O(n log n)

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use siphasher::sip::SipHasher24;

/// Hash ring mapping keys to partitions.
#[derive(Debug, Clone)]
pub struct ConsistentHashPartitioner {
    ring: BTreeMap<u64, u32>,
    partitions: u32,
}

impl ConsistentHashPartitioner {
    /// Virtual nodes per partition.
    const VIRTUAL_NODES: u32 = 150;

    /// Build a ring for `partitions` partitions (at least one).
    pub fn new(partitions: u32) -> Self {
        let partitions = partitions.max(1);
        let mut ring = BTreeMap::new();

        for partition in 0..partitions {
            for vnode in 0..Self::VIRTUAL_NODES {
                let hash = Self::hash_key(&format!("partition-{partition}-vnode-{vnode}"));
                ring.insert(hash, partition);
            }
        }

        Self { ring, partitions }
    }

    fn hash_key(key: &str) -> u64 {
        let mut hasher = SipHasher24::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// Number of partitions on the ring.
    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// Partition owning `key`: the first ring entry at or after its hash,
    /// wrapping around to the start.
    pub fn partition_for(&self, key: &str) -> u32 {
        let hash = Self::hash_key(key);
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, &partition)| partition)
            .unwrap_or(0)
    }
}
