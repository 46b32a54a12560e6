//! Per-map-per-partition record store trait.
//!
//! Defines [`RecordStore`], the interface the map service and proxies call.
//! It combines the in-memory [`StorageEngine`](super::StorageEngine) with the
//! map's persistence backend: read-through loading, write-through or
//! write-behind persistence, and the initial bulk load.

use async_trait::async_trait;
use harbor_core::Value;

use super::mapstore::LoadReport;
use super::record::Record;
use crate::error::MapStoreResult;

/// Progress of a record store's initial bulk load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    NotStarted,
    Loading,
    Loaded,
}

/// Key identifying a record store: `(map_name, partition_id)`.
pub type RecordStoreKey = (String, u32);

/// Per-map-per-partition record store.
///
/// Used as `Arc<dyn RecordStore>`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Name of the map this record store manages.
    fn name(&self) -> &str;

    /// Partition ID this record store belongs to.
    fn partition_id(&self) -> u32;

    // --- Initial load ---

    fn load_state(&self) -> LoadState;

    /// Runs the initial load if it has not been started yet.
    ///
    /// Returns `None` when another caller already started it.
    async fn load_initial(&self) -> Option<LoadReport>;

    /// Resolves once the initial load has completed, starting it if needed.
    async fn wait_until_loaded(&self);

    // --- Keyed operations ---

    /// Value for `key`, loading it from the backend on a miss.
    async fn get(&self, key: &str) -> MapStoreResult<Option<Value>>;

    /// Values for `keys` in request order; misses are batch-loaded with a
    /// single `load_all`. Absent keys are omitted.
    async fn get_all(&self, keys: &[String]) -> MapStoreResult<Vec<(String, Value)>>;

    async fn contains_key(&self, key: &str) -> MapStoreResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Stores `value`, returning the previous in-memory value.
    async fn put(&self, key: &str, value: Value) -> MapStoreResult<Option<Value>>;

    /// Stores `value` only if `key` has no value (in memory or backend).
    /// Returns the existing value when nothing was written.
    async fn put_if_absent(&self, key: &str, value: Value) -> MapStoreResult<Option<Value>>;

    /// Stores `value` only if `key` has a value. Returns the replaced value.
    async fn replace(&self, key: &str, value: Value) -> MapStoreResult<Option<Value>>;

    /// Stores `value` only if the current value equals `expected`.
    async fn replace_if_same(&self, key: &str, expected: &Value, value: Value) -> MapStoreResult<bool>;

    /// Removes `key`, returning the removed value. Removing an absent key
    /// makes no backend delete.
    async fn remove(&self, key: &str) -> MapStoreResult<Option<Value>>;

    // --- Aggregates (wait for the initial load) ---

    async fn contains_value(&self, value: &Value) -> MapStoreResult<bool>;

    async fn size(&self) -> MapStoreResult<usize>;

    async fn entry_set(&self) -> MapStoreResult<Vec<(String, Value)>>;

    async fn key_set(&self) -> MapStoreResult<Vec<String>> {
        Ok(self.entry_set().await?.into_iter().map(|(k, _)| k).collect())
    }

    async fn values(&self) -> MapStoreResult<Vec<Value>> {
        Ok(self.entry_set().await?.into_iter().map(|(_, v)| v).collect())
    }

    /// Removes every resident entry and deletes the keyset from the backend.
    /// Returns the number of removed entries.
    async fn clear(&self) -> MapStoreResult<usize>;

    // --- Persistence ---

    /// Flushes every pending write-behind entry regardless of due time.
    ///
    /// Failed entries are re-queued with backoff and the error is returned.
    async fn flush(&self) -> MapStoreResult<usize>;

    /// Flushes entries due at `now` (millis since epoch).
    async fn flush_due(&self, now: i64) -> MapStoreResult<usize>;

    /// Number of pending write-behind entries.
    fn pending_count(&self) -> usize;

    // --- Inspection ---

    /// Check if a key exists in memory (does NOT load from the backend).
    fn exists_in_memory(&self, key: &str) -> bool;

    /// Copy of the in-memory record, without touching access statistics.
    fn get_record(&self, key: &str) -> Option<Record>;

    // --- Lifecycle ---

    /// Drops all in-memory state and pending entries; the next access runs a
    /// fresh initial load.
    fn reset(&self);

    /// Rejects further mutations while leaving pending entries flushable.
    ///
    /// Mutations fail with [`NotOwned`](crate::MapStoreError::NotOwned), or
    /// [`ShuttingDown`](crate::MapStoreError::ShuttingDown) when
    /// `is_shutdown` is set. A mutation that got in before the close is
    /// already queued and is written by the next flush.
    fn close(&self, is_shutdown: bool);

    /// Accepts mutations again after [`close`](Self::close). No effect on a
    /// destroyed store.
    fn reopen(&self);

    /// Closes, resets, and notifies observers that the store is gone.
    fn destroy(&self, is_shutdown: bool);
}
