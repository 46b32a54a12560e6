//! Per-map MapStore statistics.
//!
//! Counters are kept as atomics for cheap local snapshots and mirrored to the
//! `metrics` facade, labelled by map name, for whatever exporter the host
//! process installs.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::BackendOperation;

/// Live statistics shared by every record store of one map.
#[derive(Debug, Default)]
pub struct LocalMapStats {
    map_name: String,
    dirty_entries: AtomicU64,
    stored_entries: AtomicU64,
    store_calls: AtomicU64,
    deleted_entries: AtomicU64,
    delete_calls: AtomicU64,
    load_calls: AtomicU64,
    load_all_calls: AtomicU64,
    loaded_entries: AtomicU64,
    backend_failures: AtomicU64,
    suppressed_duplicates: AtomicU64,
}

/// Point-in-time copy of [`LocalMapStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalMapStatsSnapshot {
    /// Mutations queued but not yet confirmed by the backend.
    pub dirty_entry_count: u64,
    pub stored_entries: u64,
    pub store_calls: u64,
    pub deleted_entries: u64,
    pub delete_calls: u64,
    pub load_calls: u64,
    pub load_all_calls: u64,
    pub loaded_entries: u64,
    pub backend_failures: u64,
    pub suppressed_duplicates: u64,
}

impl LocalMapStats {
    #[must_use]
    pub fn new(map_name: impl Into<String>) -> Self {
        Self {
            map_name: map_name.into(),
            ..Self::default()
        }
    }

    /// A new key entered the write-behind queue.
    pub fn increment_dirty(&self) {
        let now = self.dirty_entries.fetch_add(1, Ordering::AcqRel) + 1;
        self.publish_dirty(now);
    }

    /// `n` queued entries were confirmed or discarded.
    pub fn decrement_dirty(&self, n: u64) {
        if n == 0 {
            return;
        }
        let prev = self
            .dirty_entries
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(n))
            })
            .unwrap_or_default();
        self.publish_dirty(prev.saturating_sub(n));
    }

    /// Current number of unconfirmed queued mutations.
    #[must_use]
    pub fn dirty_entry_count(&self) -> u64 {
        self.dirty_entries.load(Ordering::Acquire)
    }

    pub fn record_store(&self, entries: u64) {
        self.store_calls.fetch_add(1, Ordering::Relaxed);
        self.stored_entries.fetch_add(entries, Ordering::Relaxed);
        metrics::counter!("harbor_mapstore_stored_entries_total", "map" => self.map_name.clone())
            .increment(entries);
    }

    pub fn record_delete(&self, entries: u64) {
        self.delete_calls.fetch_add(1, Ordering::Relaxed);
        self.deleted_entries.fetch_add(entries, Ordering::Relaxed);
        metrics::counter!("harbor_mapstore_deleted_entries_total", "map" => self.map_name.clone())
            .increment(entries);
    }

    pub fn record_load(&self, found: bool) {
        self.load_calls.fetch_add(1, Ordering::Relaxed);
        if found {
            self.loaded_entries.fetch_add(1, Ordering::Relaxed);
        }
        metrics::counter!("harbor_mapstore_load_calls_total", "map" => self.map_name.clone())
            .increment(1);
    }

    pub fn record_load_all(&self, entries: u64) {
        self.load_all_calls.fetch_add(1, Ordering::Relaxed);
        self.loaded_entries.fetch_add(entries, Ordering::Relaxed);
        metrics::counter!("harbor_mapstore_loaded_entries_total", "map" => self.map_name.clone())
            .increment(entries);
    }

    pub fn record_failure(&self, operation: BackendOperation) {
        self.backend_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "harbor_mapstore_backend_failures_total",
            "map" => self.map_name.clone(),
            "operation" => operation.as_str()
        )
        .increment(1);
    }

    pub fn record_suppressed_duplicate(&self) {
        self.suppressed_duplicates.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> LocalMapStatsSnapshot {
        LocalMapStatsSnapshot {
            dirty_entry_count: self.dirty_entries.load(Ordering::Acquire),
            stored_entries: self.stored_entries.load(Ordering::Relaxed),
            store_calls: self.store_calls.load(Ordering::Relaxed),
            deleted_entries: self.deleted_entries.load(Ordering::Relaxed),
            delete_calls: self.delete_calls.load(Ordering::Relaxed),
            load_calls: self.load_calls.load(Ordering::Relaxed),
            load_all_calls: self.load_all_calls.load(Ordering::Relaxed),
            loaded_entries: self.loaded_entries.load(Ordering::Relaxed),
            backend_failures: self.backend_failures.load(Ordering::Relaxed),
            suppressed_duplicates: self.suppressed_duplicates.load(Ordering::Relaxed),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn publish_dirty(&self, value: u64) {
        metrics::gauge!("harbor_mapstore_dirty_entries", "map" => self.map_name.clone())
            .set(value as f64);
    }
}
