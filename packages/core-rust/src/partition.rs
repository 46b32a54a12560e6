//! Partition hash and ownership lookup.
//!
//! Every key belongs to exactly one partition: `fnv1a_hash(key) % count`.
//! Record stores are created per `(map, partition)` pair, and the node that
//! owns a partition is the only one that loads or persists its keys.
//!
//! - [`DEFAULT_PARTITION_COUNT`]: 271, a prime for uniform modulo distribution
//! - [`partition_for_key`] / [`hash_to_partition`]: key routing
//! - [`PartitionTable`]: versioned partition-to-owner table with round-robin
//!   assignment and ownership diffs for membership changes

use std::collections::BTreeSet;

use crate::hash::fnv1a_hash;

/// Default number of partitions.
pub const DEFAULT_PARTITION_COUNT: u32 = 271;

/// Compute the partition ID for a key given an explicit partition count.
///
/// # Panics
///
/// Panics if `partition_count` is zero.
///
/// # Examples
///
/// ```
/// use harbor_core::partition::partition_for_key;
///
/// assert_eq!(partition_for_key("anything", 1), 0);
/// assert_eq!(partition_for_key("hello", 271), 95);
/// ```
#[must_use]
pub fn partition_for_key(key: &str, partition_count: u32) -> u32 {
    assert!(partition_count > 0, "partition_count must be positive");
    fnv1a_hash(key) % partition_count
}

/// Compute the partition ID for a key using [`DEFAULT_PARTITION_COUNT`].
#[must_use]
pub fn hash_to_partition(key: &str) -> u32 {
    partition_for_key(key, DEFAULT_PARTITION_COUNT)
}

/// Versioned partition-to-owner table.
///
/// Uses a `Vec<Option<String>>` indexed by partition ID, since partition IDs
/// are dense integers in `[0, partition_count)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    owners: Vec<Option<String>>,
    version: u64,
}

impl PartitionTable {
    /// Creates a table with all partitions unassigned and version 0.
    #[must_use]
    pub fn new(partition_count: u32) -> Self {
        Self {
            owners: vec![None; partition_count as usize],
            version: 0,
        }
    }

    /// Builds a table that spreads partitions round-robin over `members`.
    ///
    /// Members are sorted first so every node computes the same table from
    /// the same membership.
    #[must_use]
    pub fn round_robin(partition_count: u32, members: &[String], version: u64) -> Self {
        let mut sorted: Vec<&String> = members.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut table = Self::new(partition_count);
        table.version = version;
        if sorted.is_empty() {
            return table;
        }
        for (pid, slot) in table.owners.iter_mut().enumerate() {
            *slot = Some(sorted[pid % sorted.len()].clone());
        }
        table
    }

    /// Total partition count.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // constructed from a u32
    pub fn partition_count(&self) -> u32 {
        self.owners.len() as u32
    }

    /// Table version; bumped on every ownership change.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Assign an owner to a partition.
    ///
    /// # Panics
    ///
    /// Panics if `partition_id` is out of range.
    pub fn set_owner(&mut self, partition_id: u32, node_id: String) {
        assert!(
            partition_id < self.partition_count(),
            "partition_id {partition_id} out of range [0, {})",
            self.partition_count()
        );
        self.owners[partition_id as usize] = Some(node_id);
        self.version += 1;
    }

    /// Owner node of a partition, if assigned.
    #[must_use]
    pub fn get_owner(&self, partition_id: u32) -> Option<&str> {
        self.owners
            .get(partition_id as usize)
            .and_then(|o| o.as_deref())
    }

    /// Owner of the partition a key routes to.
    #[must_use]
    pub fn get_owner_for_key(&self, key: &str) -> Option<&str> {
        self.get_owner(partition_for_key(key, self.partition_count()))
    }

    /// All partition IDs owned by the given node, ascending.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn partitions_for_node(&self, node_id: &str) -> BTreeSet<u32> {
        self.owners
            .iter()
            .enumerate()
            .filter_map(|(i, owner)| {
                owner
                    .as_deref()
                    .filter(|&o| o == node_id)
                    .map(|_| i as u32)
            })
            .collect()
    }

    /// Ownership changes for `node_id` when moving from `self` to `next`.
    ///
    /// Returns `(gained, lost)` partition sets.
    #[must_use]
    pub fn ownership_diff(&self, next: &Self, node_id: &str) -> (BTreeSet<u32>, BTreeSet<u32>) {
        let before = self.partitions_for_node(node_id);
        let after = next.partitions_for_node(node_id);
        let gained = after.difference(&before).copied().collect();
        let lost = before.difference(&after).copied().collect();
        (gained, lost)
    }
}
