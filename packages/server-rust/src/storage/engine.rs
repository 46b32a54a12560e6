//! Low-level storage engine trait.
//!
//! Defines [`StorageEngine`], the innermost storage layer of a record store.
//! Implementations provide in-memory key-value storage; all operations are
//! synchronous and never touch the persistence backend.

use super::record::Record;

/// Low-level typed key-value storage.
///
/// Wrapped in `Box<dyn StorageEngine>` inside each record store.
pub trait StorageEngine: Send + Sync + 'static {
    /// Insert or replace a record by key. Returns the previous record if any.
    fn put(&self, key: &str, record: Record) -> Option<Record>;

    /// Insert only if the key is absent.
    ///
    /// Returns `Ok(())` when inserted, or `Err(existing)` with a copy of the
    /// record already present. The check and insert are atomic.
    fn put_if_absent(&self, key: &str, record: Record) -> Result<(), Record>;

    /// Retrieve a record by key, or `None` if not present.
    fn get(&self, key: &str) -> Option<Record>;

    /// Apply `f` to the record in place. Returns `false` if the key is absent.
    ///
    /// Uses `&mut dyn FnMut` for `Box<dyn StorageEngine>` compatibility.
    fn update(&self, key: &str, f: &mut dyn FnMut(&mut Record)) -> bool;

    /// Remove a record by key, returning the removed record.
    fn remove(&self, key: &str) -> Option<Record>;

    /// Check if a key exists without returning the record.
    fn contains_key(&self, key: &str) -> bool;

    /// Return the number of entries.
    fn len(&self) -> usize;

    /// Check if the storage is empty.
    fn is_empty(&self) -> bool;

    /// Remove all entries, returning the keys that were present.
    fn clear(&self) -> Vec<String>;

    /// Return a point-in-time snapshot of all entries.
    ///
    /// The snapshot is mutation-tolerant (concurrent modifications do not fail).
    fn snapshot_iter(&self) -> Vec<(String, Record)>;
}
