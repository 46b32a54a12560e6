//! Harbor Core: value model, key hashing, and partition routing shared by
//! the server crates.

pub mod hash;
pub mod partition;
pub mod types;

pub use partition::{hash_to_partition, partition_for_key, PartitionTable, DEFAULT_PARTITION_COUNT};
pub use types::Value;
