//! Mutation observer trait, composite fan-out, and an event publisher.
//!
//! Defines [`MutationObserver`] for reacting to record mutations within a
//! [`RecordStore`](super::RecordStore), [`CompositeMutationObserver`] which
//! fans out notifications, and [`EntryEventPublisher`] which turns mutations
//! into [`EntryEvent`]s on a channel for listener dispatch.

use std::sync::Arc;

use harbor_core::Value;
use tokio::sync::mpsc;

use super::record::Record;

/// Observer for record mutations within a `RecordStore`.
///
/// Used as `Arc<dyn MutationObserver>`.
pub trait MutationObserver: Send + Sync {
    /// Called after a new record is inserted by a caller or the initial
    /// bulk load.
    fn on_put(&self, map_name: &str, key: &str, record: &Record);

    /// Called after an existing record is overwritten by a caller.
    fn on_update(&self, map_name: &str, key: &str, record: &Record, old_value: &Value);

    /// Called after a record is removed.
    fn on_remove(&self, map_name: &str, key: &str, record: &Record);

    /// Called after a read-through miss materializes a record from the
    /// backend.
    fn on_load(&self, map_name: &str, key: &str, record: &Record);

    /// Called when all entries of a record store are cleared.
    fn on_clear(&self, map_name: &str, partition_id: u32);

    /// Called when the record store is reset after losing ownership.
    fn on_reset(&self, map_name: &str, partition_id: u32);

    /// Called when the record store is destroyed.
    fn on_destroy(&self, map_name: &str, partition_id: u32, is_shutdown: bool);
}

/// Composite observer that fans out to multiple observers.
#[derive(Default)]
pub struct CompositeMutationObserver {
    observers: Vec<Arc<dyn MutationObserver>>,
}

impl CompositeMutationObserver {
    /// Creates a composite observer with the given list of observers.
    #[must_use]
    pub fn new(observers: Vec<Arc<dyn MutationObserver>>) -> Self {
        Self { observers }
    }

    /// Adds an observer after construction.
    pub fn add(&mut self, observer: Arc<dyn MutationObserver>) {
        self.observers.push(observer);
    }
}

impl MutationObserver for CompositeMutationObserver {
    fn on_put(&self, map_name: &str, key: &str, record: &Record) {
        for observer in &self.observers {
            observer.on_put(map_name, key, record);
        }
    }

    fn on_update(&self, map_name: &str, key: &str, record: &Record, old_value: &Value) {
        for observer in &self.observers {
            observer.on_update(map_name, key, record, old_value);
        }
    }

    fn on_remove(&self, map_name: &str, key: &str, record: &Record) {
        for observer in &self.observers {
            observer.on_remove(map_name, key, record);
        }
    }

    fn on_load(&self, map_name: &str, key: &str, record: &Record) {
        for observer in &self.observers {
            observer.on_load(map_name, key, record);
        }
    }

    fn on_clear(&self, map_name: &str, partition_id: u32) {
        for observer in &self.observers {
            observer.on_clear(map_name, partition_id);
        }
    }

    fn on_reset(&self, map_name: &str, partition_id: u32) {
        for observer in &self.observers {
            observer.on_reset(map_name, partition_id);
        }
    }

    fn on_destroy(&self, map_name: &str, partition_id: u32, is_shutdown: bool) {
        for observer in &self.observers {
            observer.on_destroy(map_name, partition_id, is_shutdown);
        }
    }
}

/// Kind of entry event delivered to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryEventKind {
    Added,
    Updated,
    Removed,
    /// Materialized from the backend by a read-through miss.
    Loaded,
    /// Every entry of one partition was cleared.
    Cleared,
}

/// Entry-level change notification.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryEvent {
    pub map_name: String,
    pub kind: EntryEventKind,
    /// Empty for [`EntryEventKind::Cleared`].
    pub key: String,
    pub value: Option<Value>,
    pub old_value: Option<Value>,
}

/// Observer that publishes [`EntryEvent`]s to an unbounded channel.
///
/// Sends never block the mutating caller; a dropped receiver silently
/// disables publishing.
pub struct EntryEventPublisher {
    tx: mpsc::UnboundedSender<EntryEvent>,
}

impl EntryEventPublisher {
    /// Creates a publisher and the receiving end listeners consume.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EntryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn publish(&self, event: EntryEvent) {
        let _ = self.tx.send(event);
    }
}

impl MutationObserver for EntryEventPublisher {
    fn on_put(&self, map_name: &str, key: &str, record: &Record) {
        self.publish(EntryEvent {
            map_name: map_name.to_string(),
            kind: EntryEventKind::Added,
            key: key.to_string(),
            value: Some(record.value.clone()),
            old_value: None,
        });
    }

    fn on_update(&self, map_name: &str, key: &str, record: &Record, old_value: &Value) {
        self.publish(EntryEvent {
            map_name: map_name.to_string(),
            kind: EntryEventKind::Updated,
            key: key.to_string(),
            value: Some(record.value.clone()),
            old_value: Some(old_value.clone()),
        });
    }

    fn on_remove(&self, map_name: &str, key: &str, record: &Record) {
        self.publish(EntryEvent {
            map_name: map_name.to_string(),
            kind: EntryEventKind::Removed,
            key: key.to_string(),
            value: None,
            old_value: Some(record.value.clone()),
        });
    }

    fn on_load(&self, map_name: &str, key: &str, record: &Record) {
        self.publish(EntryEvent {
            map_name: map_name.to_string(),
            kind: EntryEventKind::Loaded,
            key: key.to_string(),
            value: Some(record.value.clone()),
            old_value: None,
        });
    }

    fn on_clear(&self, map_name: &str, _partition_id: u32) {
        self.publish(EntryEvent {
            map_name: map_name.to_string(),
            kind: EntryEventKind::Cleared,
            key: String::new(),
            value: None,
            old_value: None,
        });
    }

    fn on_reset(&self, _map_name: &str, _partition_id: u32) {}

    fn on_destroy(&self, _map_name: &str, _partition_id: u32, _is_shutdown: bool) {}
}
