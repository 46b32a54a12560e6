//! [`StorageEngine`](super::StorageEngine) implementations.

mod hashmap;

pub use hashmap::HashMapStorage;
