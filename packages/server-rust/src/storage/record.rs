//! Record types for the storage layer.
//!
//! Defines the unit stored in [`StorageEngine`](super::StorageEngine):
//! [`Record`] and its server-internal [`RecordMetadata`].

use std::time::{SystemTime, UNIX_EPOCH};

use harbor_core::Value;

/// Metadata tracked for every record in a [`RecordStore`](super::RecordStore).
#[derive(Debug, Clone, Default)]
pub struct RecordMetadata {
    /// Write generation, drawn from the map-wide sequence on every write.
    /// Queue entries carry the version they were created from so a stale
    /// flush confirmation never touches a newer record.
    pub version: u64,
    /// Wall-clock time (millis since epoch) when this record was created.
    pub creation_time: i64,
    /// Wall-clock time of the last read access.
    pub last_access_time: i64,
    /// Wall-clock time of the last write.
    pub last_update_time: i64,
    /// Wall-clock time when last confirmed by the backend. 0 = never stored.
    pub last_stored_time: i64,
    /// Number of read accesses.
    pub hits: u32,
    /// `true` while a mutation has not yet been confirmed by the backend.
    pub dirty: bool,
}

impl RecordMetadata {
    /// Creates new metadata with version 1 and all timestamps set to `now`.
    #[must_use]
    pub fn new(now: i64, dirty: bool) -> Self {
        Self {
            version: 1,
            creation_time: now,
            last_access_time: now,
            last_update_time: now,
            last_stored_time: 0,
            hits: 0,
            dirty,
        }
    }

    /// Records a read access: increments `hits` and updates `last_access_time`.
    pub fn on_access(&mut self, now: i64) {
        self.hits = self.hits.saturating_add(1);
        self.last_access_time = now;
    }

    /// Records a write of generation `version`.
    pub fn on_update(&mut self, now: i64, version: u64, dirty: bool) {
        self.version = version;
        self.last_update_time = now;
        self.last_access_time = now;
        self.dirty = dirty;
    }

    /// Records a backend confirmation: clears `dirty`.
    pub fn on_store(&mut self, now: i64) {
        self.last_stored_time = now;
        self.dirty = false;
    }
}

/// A map entry held in memory: value plus server-internal metadata.
#[derive(Debug, Clone)]
pub struct Record {
    pub value: Value,
    pub metadata: RecordMetadata,
}

impl Record {
    /// A record written by a caller; dirty when a backend store is configured.
    #[must_use]
    pub fn new(value: Value, now: i64, dirty: bool) -> Self {
        Self {
            value,
            metadata: RecordMetadata::new(now, dirty),
        }
    }

    /// A record materialized from the backend. Never dirty.
    #[must_use]
    pub fn loaded(value: Value, now: i64) -> Self {
        let mut metadata = RecordMetadata::new(now, false);
        metadata.last_stored_time = now;
        Self { value, metadata }
    }

    /// Whether the latest mutation is still awaiting backend confirmation.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.metadata.dirty
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // millis fit in i64 until year 292_278_994
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}
