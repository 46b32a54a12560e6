//! Per-map-per-partition record store backed by a persistence backend.
//!
//! [`DefaultRecordStore`] coordinates the in-memory
//! [`StorageEngine`](crate::storage::StorageEngine) with the map's backend
//! through the shared [`MapContainer`]:
//!
//! - reads fall through to `load` on a miss and cache the result clean
//! - writes go to the backend synchronously (write-through) or through the
//!   [`WriteBehindQueue`](crate::storage::mapstore::WriteBehindQueue)
//! - the initial bulk load populates memory without ever writing back
//!
//! Every memory mutation happens under the `pending` mutex, which also guards
//! the queue, so the queue always reflects the latest in-memory write for a
//! key. The mutex is never held across an await point. Flushing is
//! serialized by a separate async lock that reads never take.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use harbor_core::Value;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{MapStoreError, MapStoreResult};
use crate::storage::engine::StorageEngine;
use crate::storage::map_container::{MapContainer, WriteMode};
use crate::storage::mapstore::{
    ConfirmedEntry, InitialLoadMode, LoadReport, LoadSink, WriteBehindEntry, WriteBehindQueue,
    WriteOperation,
};
use crate::storage::mutation_observer::MutationObserver;
use crate::storage::record::{now_millis, Record};
use crate::storage::record_store::{LoadState, RecordStore};

/// State guarded by the record store's `pending` mutex.
struct PendingState {
    queue: WriteBehindQueue,
    /// Keys written by callers while the initial load runs. Loaded values for
    /// these keys are dropped.
    touched: HashSet<String>,
    /// Keys the bulk load proved absent from the backend.
    absent: HashSet<String>,
    /// Write-through keys whose last backend write has not been confirmed.
    unconfirmed: HashSet<String>,
    /// Set once the store stops accepting mutations.
    closed: Option<Closed>,
}

#[derive(Debug, Clone, Copy)]
enum Closed {
    Released,
    Shutdown,
}

impl Closed {
    fn new(is_shutdown: bool) -> Self {
        if is_shutdown {
            Self::Shutdown
        } else {
            Self::Released
        }
    }
}

enum PutCondition<'a> {
    Always,
    IfAbsent,
    IfPresent,
    IfEquals(&'a Value),
}

impl PutCondition<'_> {
    fn allows(&self, current: Option<&Record>) -> bool {
        match self {
            Self::Always => true,
            Self::IfAbsent => current.is_none(),
            Self::IfPresent => current.is_some(),
            Self::IfEquals(expected) => current.is_some_and(|r| r.value == **expected),
        }
    }
}

enum Applied {
    Rejected(Option<Value>),
    Written { old: Option<Record>, record: Record },
}

pub struct DefaultRecordStore {
    name: String,
    partition_id: u32,
    engine: Box<dyn StorageEngine>,
    container: Arc<MapContainer>,
    pending: Mutex<PendingState>,
    flush_lock: tokio::sync::Mutex<()>,
    load_state: watch::Sender<LoadState>,
    /// Bumped on reset so a load started before it cannot apply results.
    load_epoch: AtomicU64,
    destroyed: AtomicBool,
}

impl DefaultRecordStore {
    #[must_use]
    pub fn new(partition_id: u32, engine: Box<dyn StorageEngine>, container: Arc<MapContainer>) -> Self {
        let (load_state, _) = watch::channel(LoadState::NotStarted);
        Self {
            name: container.name().to_string(),
            partition_id,
            engine,
            pending: Mutex::new(PendingState {
                queue: container.new_queue(),
                touched: HashSet::new(),
                absent: HashSet::new(),
                unconfirmed: HashSet::new(),
                closed: None,
            }),
            container,
            flush_lock: tokio::sync::Mutex::new(()),
            load_state,
            load_epoch: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
        }
    }

    fn write_mode(&self) -> WriteMode {
        self.container.write_mode()
    }

    fn is_loading(&self) -> bool {
        *self.load_state.borrow() == LoadState::Loading
    }

    /// Mutations on a closed store would never reach the backend.
    fn check_open(&self, pending: &PendingState) -> MapStoreResult<()> {
        match pending.closed {
            None => Ok(()),
            Some(Closed::Released) => Err(MapStoreError::NotOwned {
                partition_id: self.partition_id,
            }),
            Some(Closed::Shutdown) => Err(MapStoreError::ShuttingDown),
        }
    }

    /// Eager maps gate every operation on the initial load.
    async fn await_ready(&self) {
        if self.container.initial_load_mode() == InitialLoadMode::Eager {
            self.wait_until_loaded().await;
        }
    }

    fn touch(&self, key: &str) -> Option<Value> {
        let now = now_millis();
        let mut found = None;
        self.engine.update(key, &mut |record| {
            record.metadata.on_access(now);
            found = Some(record.value.clone());
        });
        found
    }

    fn may_exist_in_backend(&self, key: &str) -> bool {
        if !self.container.adapter().can_load() {
            return false;
        }
        let pending = self.pending.lock();
        !pending.queue.has_pending_delete(key) && !pending.absent.contains(key)
    }

    async fn load_if_possible(&self, key: &str) -> MapStoreResult<Option<Value>> {
        if !self.may_exist_in_backend(key) {
            return Ok(None);
        }
        self.container.adapter().load(key).await
    }

    /// Caches a read-through result unless a caller mutated the key meanwhile.
    fn cache_loaded(&self, key: &str, value: Value) -> Option<Value> {
        let pending = self.pending.lock();
        if pending.queue.has_pending_delete(key) {
            return None;
        }
        let mut record = Record::loaded(value.clone(), now_millis());
        record.metadata.version = self.container.next_version();
        match self.engine.put_if_absent(key, record.clone()) {
            Ok(()) => {
                drop(pending);
                self.container.observer().on_load(&self.name, key, &record);
                Some(value)
            }
            Err(existing) => Some(existing.value),
        }
    }

    fn apply_put(
        &self,
        key: &str,
        value: Value,
        condition: &PutCondition<'_>,
        now: i64,
    ) -> MapStoreResult<Applied> {
        let mut pending = self.pending.lock();
        self.check_open(&pending)?;
        let current = self.engine.get(key);
        if !condition.allows(current.as_ref()) {
            return Ok(Applied::Rejected(current.map(|r| r.value)));
        }

        let version = self.container.next_version();
        let dirty = self.write_mode() != WriteMode::Disabled;
        let record = match &current {
            Some(prev) => {
                let mut record = prev.clone();
                record.value = value;
                record.metadata.on_update(now, version, dirty);
                record
            }
            None => {
                let mut record = Record::new(value, now, dirty);
                record.metadata.version = version;
                record
            }
        };
        self.engine.put(key, record.clone());

        pending.absent.remove(key);
        if self.is_loading() {
            pending.touched.insert(key.to_string());
        }
        let newly_dirty = match self.write_mode() {
            WriteMode::WriteBehind => pending
                .queue
                .enqueue_store(key, record.value.clone(), version, now),
            WriteMode::WriteThrough => pending.unconfirmed.insert(key.to_string()),
            WriteMode::Disabled => false,
        };
        if newly_dirty {
            self.container.stats().increment_dirty();
        }
        Ok(Applied::Written {
            old: current,
            record,
        })
    }

    /// Removes `key` from memory and queues the backend delete.
    ///
    /// With `known_in_backend` the delete is queued even when nothing was
    /// resident.
    fn apply_remove(&self, key: &str, now: i64, known_in_backend: bool) -> MapStoreResult<Option<Record>> {
        let mut pending = self.pending.lock();
        self.check_open(&pending)?;
        let removed = self.engine.remove(key);
        if removed.is_none() && !known_in_backend {
            return Ok(None);
        }
        if self.is_loading() {
            pending.touched.insert(key.to_string());
        }
        if pending.unconfirmed.remove(key) {
            self.container.stats().decrement_dirty(1);
        }
        if self.write_mode() == WriteMode::WriteBehind {
            let version = removed.as_ref().map_or(0, |r| r.metadata.version);
            if pending.queue.enqueue_delete(key, version, now) {
                self.container.stats().increment_dirty();
            }
        }
        Ok(removed)
    }

    async fn write_value(
        &self,
        key: &str,
        value: Value,
        condition: PutCondition<'_>,
    ) -> MapStoreResult<(bool, Option<Value>)> {
        let now = now_millis();
        // Write-through calls are serialized per partition to keep per-key order.
        let _serial = match self.write_mode() {
            WriteMode::WriteThrough => Some(self.flush_lock.lock().await),
            _ => None,
        };

        let (old, record) = match self.apply_put(key, value, &condition, now)? {
            Applied::Rejected(current) => return Ok((false, current)),
            Applied::Written { old, record } => (old, record),
        };
        match &old {
            Some(prev) => self
                .container
                .observer()
                .on_update(&self.name, key, &record, &prev.value),
            None => self.container.observer().on_put(&self.name, key, &record),
        }

        if self.write_mode() == WriteMode::WriteThrough {
            let entry = WriteBehindEntry {
                key: key.to_string(),
                operation: WriteOperation::Store(record.value.clone()),
                sequence: record.metadata.version,
                due_time: now,
                record_version: record.metadata.version,
                attempts: 0,
            };
            self.persist_now(&[entry], now).await?;
            if self.pending.lock().unconfirmed.remove(key) {
                self.container.stats().decrement_dirty(1);
            }
        }
        Ok((true, old.map(|r| r.value)))
    }

    /// Sends entries straight to the backend, bypassing the queue.
    async fn persist_now(&self, entries: &[WriteBehindEntry], now: i64) -> MapStoreResult<()> {
        let outcome = self.container.adapter().flush_batch(entries).await?;
        self.apply_confirmations(&outcome.confirmed, now);
        Ok(())
    }

    /// Clears `dirty` and merges post-processed values, but only on records
    /// that were not rewritten after the entry was created.
    fn apply_confirmations(&self, confirmed: &[ConfirmedEntry], now: i64) {
        for entry in confirmed.iter().filter(|c| !c.is_delete) {
            self.engine.update(&entry.key, &mut |record| {
                if record.metadata.version == entry.record_version {
                    record.metadata.on_store(now);
                    if let Some(merged) = &entry.merged {
                        record.value = merged.clone();
                    }
                }
            });
        }
    }

    async fn process_batch(&self, entries: Vec<WriteBehindEntry>, now: i64) -> MapStoreResult<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let drained = entries.len() as u64;
        match self.container.adapter().flush_batch(&entries).await {
            Ok(outcome) => {
                self.apply_confirmations(&outcome.confirmed, now);
                self.container.stats().decrement_dirty(drained);
                tracing::debug!(
                    map = %self.name,
                    partition_id = self.partition_id,
                    flushed = outcome.confirmed.len(),
                    suppressed = outcome.suppressed,
                    "write-behind batch flushed"
                );
                Ok(outcome.confirmed.len())
            }
            Err(e) => {
                let superseded = self.pending.lock().queue.requeue_failed(
                    entries,
                    now,
                    &self.container.config().retry,
                );
                self.container.stats().decrement_dirty(superseded as u64);
                Err(e)
            }
        }
    }

    fn resident_entries(&self) -> Vec<(String, Value)> {
        self.engine
            .snapshot_iter()
            .into_iter()
            .map(|(k, r)| (k, r.value))
            .collect()
    }

    fn reset_state(&self) {
        let discarded = {
            let mut pending = self.pending.lock();
            self.load_epoch.fetch_add(1, Ordering::AcqRel);
            let discarded = pending.queue.clear() + std::mem::take(&mut pending.unconfirmed).len();
            pending.touched.clear();
            pending.absent.clear();
            self.engine.clear();
            self.load_state.send_replace(LoadState::NotStarted);
            discarded
        };
        if discarded > 0 {
            tracing::warn!(
                map = %self.name,
                partition_id = self.partition_id,
                discarded,
                "record store reset with unflushed entries"
            );
        }
        self.container.stats().decrement_dirty(discarded as u64);
    }
}

/// Applies initial-load results for one load epoch.
struct EpochSink<'a> {
    store: &'a DefaultRecordStore,
    epoch: u64,
}

impl EpochSink<'_> {
    fn is_current(&self) -> bool {
        self.store.load_epoch.load(Ordering::Acquire) == self.epoch
    }
}

impl LoadSink for EpochSink<'_> {
    fn apply_loaded(&self, key: &str, value: Value) -> bool {
        let store = self.store;
        let pending = store.pending.lock();
        if !self.is_current() || pending.touched.contains(key) || pending.queue.contains_key(key) {
            return false;
        }
        let mut record = Record::loaded(value, now_millis());
        record.metadata.version = store.container.next_version();
        if store.engine.put_if_absent(key, record.clone()).is_err() {
            return false;
        }
        drop(pending);
        store.container.observer().on_put(&store.name, key, &record);
        true
    }

    fn mark_absent(&self, key: &str) {
        let mut pending = self.store.pending.lock();
        if self.is_current() && !pending.touched.contains(key) && !self.store.engine.contains_key(key) {
            pending.absent.insert(key.to_string());
        }
    }
}

#[async_trait]
impl RecordStore for DefaultRecordStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn partition_id(&self) -> u32 {
        self.partition_id
    }

    // --- Initial load ---

    fn load_state(&self) -> LoadState {
        *self.load_state.borrow()
    }

    async fn load_initial(&self) -> Option<LoadReport> {
        let started = self.load_state.send_if_modified(|state| {
            if *state == LoadState::NotStarted {
                *state = LoadState::Loading;
                true
            } else {
                false
            }
        });
        if !started {
            return None;
        }

        let epoch = self.load_epoch.load(Ordering::Acquire);
        let report = if self.container.adapter().can_enumerate_keys() {
            let loader = self.container.new_loader(self.partition_id);
            loader.run(&EpochSink { store: self, epoch }).await
        } else {
            LoadReport::default()
        };

        {
            let mut pending = self.pending.lock();
            if self.load_epoch.load(Ordering::Acquire) == epoch {
                pending.touched.clear();
                self.load_state.send_if_modified(|state| {
                    if *state == LoadState::Loading {
                        *state = LoadState::Loaded;
                        true
                    } else {
                        false
                    }
                });
            }
        }

        tracing::info!(
            map = %self.name,
            partition_id = self.partition_id,
            loaded = report.applied,
            owned_keys = report.owned_keys,
            failed_chunks = report.failed_chunks,
            "partition loaded"
        );
        Some(report)
    }

    async fn wait_until_loaded(&self) {
        let mut rx = self.load_state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                LoadState::Loaded => return,
                LoadState::NotStarted => {
                    if self.destroyed.load(Ordering::Acquire) {
                        return;
                    }
                    self.load_initial().await;
                }
                LoadState::Loading => {
                    if rx.changed().await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    // --- Keyed operations ---

    async fn get(&self, key: &str) -> MapStoreResult<Option<Value>> {
        self.await_ready().await;
        if let Some(value) = self.touch(key) {
            return Ok(Some(value));
        }
        let Some(loaded) = self.load_if_possible(key).await? else {
            return Ok(None);
        };
        Ok(self.cache_loaded(key, loaded))
    }

    async fn get_all(&self, keys: &[String]) -> MapStoreResult<Vec<(String, Value)>> {
        self.await_ready().await;

        let mut found: HashMap<String, Value> = HashMap::with_capacity(keys.len());
        let mut misses: Vec<String> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::with_capacity(keys.len());
        for key in keys {
            if !seen.insert(key.as_str()) {
                continue;
            }
            if let Some(value) = self.touch(key) {
                found.insert(key.clone(), value);
            } else if self.may_exist_in_backend(key) {
                misses.push(key.clone());
            }
        }

        if !misses.is_empty() {
            let loaded = self.container.adapter().load_all(&misses).await?;
            for (key, value) in loaded {
                if let Some(value) = self.cache_loaded(&key, value) {
                    found.insert(key, value);
                }
            }
        }

        Ok(keys
            .iter()
            .filter_map(|k| found.remove(k).map(|v| (k.clone(), v)))
            .collect())
    }

    async fn put(&self, key: &str, value: Value) -> MapStoreResult<Option<Value>> {
        self.await_ready().await;
        let (_, old) = self.write_value(key, value, PutCondition::Always).await?;
        Ok(old)
    }

    async fn put_if_absent(&self, key: &str, value: Value) -> MapStoreResult<Option<Value>> {
        if let Some(existing) = self.get(key).await? {
            return Ok(Some(existing));
        }
        let (applied, current) = self.write_value(key, value, PutCondition::IfAbsent).await?;
        Ok(if applied { None } else { current })
    }

    async fn replace(&self, key: &str, value: Value) -> MapStoreResult<Option<Value>> {
        if self.get(key).await?.is_none() {
            return Ok(None);
        }
        let (applied, previous) = self.write_value(key, value, PutCondition::IfPresent).await?;
        Ok(if applied { previous } else { None })
    }

    async fn replace_if_same(&self, key: &str, expected: &Value, value: Value) -> MapStoreResult<bool> {
        match self.get(key).await? {
            Some(current) if current == *expected => {}
            _ => return Ok(false),
        }
        let (applied, _) = self
            .write_value(key, value, PutCondition::IfEquals(expected))
            .await?;
        Ok(applied)
    }

    async fn remove(&self, key: &str) -> MapStoreResult<Option<Value>> {
        self.await_ready().await;
        let now = now_millis();
        let _serial = match self.write_mode() {
            WriteMode::WriteThrough => Some(self.flush_lock.lock().await),
            _ => None,
        };

        let (removed, old_value) = match self.apply_remove(key, now, false)? {
            Some(record) => {
                let value = record.value.clone();
                (record, value)
            }
            None => {
                // Not resident; the backend may still hold the key.
                let Some(loaded) = self.load_if_possible(key).await? else {
                    return Ok(None);
                };
                match self.apply_remove(key, now, true)? {
                    Some(record) => {
                        let value = record.value.clone();
                        (record, value)
                    }
                    None => (Record::loaded(loaded.clone(), now), loaded),
                }
            }
        };
        self.container.observer().on_remove(&self.name, key, &removed);

        if self.write_mode() == WriteMode::WriteThrough {
            let entry = WriteBehindEntry {
                key: key.to_string(),
                operation: WriteOperation::Delete,
                sequence: self.container.next_version(),
                due_time: now,
                record_version: removed.metadata.version,
                attempts: 0,
            };
            self.persist_now(&[entry], now).await?;
        }
        Ok(Some(old_value))
    }

    // --- Aggregates ---

    async fn contains_value(&self, value: &Value) -> MapStoreResult<bool> {
        self.wait_until_loaded().await;
        Ok(self
            .engine
            .snapshot_iter()
            .iter()
            .any(|(_, record)| record.value == *value))
    }

    async fn size(&self) -> MapStoreResult<usize> {
        self.wait_until_loaded().await;
        Ok(self.engine.len())
    }

    async fn entry_set(&self) -> MapStoreResult<Vec<(String, Value)>> {
        self.wait_until_loaded().await;
        Ok(self.resident_entries())
    }

    async fn clear(&self) -> MapStoreResult<usize> {
        self.wait_until_loaded().await;
        let now = now_millis();
        let _serial = match self.write_mode() {
            WriteMode::WriteThrough => Some(self.flush_lock.lock().await),
            _ => None,
        };

        let keys = {
            let mut pending = self.pending.lock();
            self.check_open(&pending)?;
            let keys = self.engine.clear();
            let unconfirmed = std::mem::take(&mut pending.unconfirmed);
            self.container.stats().decrement_dirty(unconfirmed.len() as u64);
            if self.write_mode() == WriteMode::WriteBehind {
                for key in &keys {
                    if pending.queue.enqueue_delete(key, 0, now) {
                        self.container.stats().increment_dirty();
                    }
                }
            }
            keys
        };
        self.container
            .observer()
            .on_clear(&self.name, self.partition_id);

        if self.write_mode() == WriteMode::WriteThrough {
            self.container.adapter().delete_all(&keys).await?;
        }
        Ok(keys.len())
    }

    // --- Persistence ---

    async fn flush(&self) -> MapStoreResult<usize> {
        let _guard = self.flush_lock.lock().await;
        let entries = self.pending.lock().queue.drain_all();
        self.process_batch(entries, now_millis()).await
    }

    async fn flush_due(&self, now: i64) -> MapStoreResult<usize> {
        let _guard = self.flush_lock.lock().await;
        let entries = self.pending.lock().queue.drain_due(now);
        self.process_batch(entries, now).await
    }

    fn pending_count(&self) -> usize {
        self.pending.lock().queue.len()
    }

    // --- Inspection ---

    fn exists_in_memory(&self, key: &str) -> bool {
        self.engine.contains_key(key)
    }

    fn get_record(&self, key: &str) -> Option<Record> {
        self.engine.get(key)
    }

    // --- Lifecycle ---

    fn reset(&self) {
        self.reset_state();
        self.container
            .observer()
            .on_reset(&self.name, self.partition_id);
    }

    fn close(&self, is_shutdown: bool) {
        self.pending.lock().closed = Some(Closed::new(is_shutdown));
    }

    fn reopen(&self) {
        let mut pending = self.pending.lock();
        if !self.destroyed.load(Ordering::Acquire) {
            pending.closed = None;
        }
    }

    fn destroy(&self, is_shutdown: bool) {
        {
            let mut pending = self.pending.lock();
            pending.closed = Some(Closed::new(is_shutdown));
            self.destroyed.store(true, Ordering::Release);
        }
        self.reset_state();
        self.container
            .observer()
            .on_destroy(&self.name, self.partition_id, is_shutdown);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use harbor_core::partition_for_key;

    use super::*;
    use crate::error::{BackendOperation, MapStoreError};
    use crate::storage::datastores::{BackendWrite, InMemoryMapStore};
    use crate::storage::engines::HashMapStorage;
    use crate::storage::mapstore::MapStoreConfig;
    use crate::storage::mutation_observer::{EntryEventKind, EntryEventPublisher};
    use crate::traits::MapStore;

    fn build(
        backend: &Arc<InMemoryMapStore>,
        config: impl FnOnce(MapStoreConfig) -> MapStoreConfig,
        observers: Vec<Arc<dyn MutationObserver>>,
        partition_count: u32,
        partition_id: u32,
    ) -> Arc<DefaultRecordStore> {
        let dyn_store: Arc<dyn MapStore> = Arc::clone(backend) as _;
        let container = Arc::new(
            MapContainer::new(
                "m",
                "node-1",
                partition_count,
                config(MapStoreConfig::with_store(dyn_store)),
                observers,
            )
            .unwrap(),
        );
        Arc::new(DefaultRecordStore::new(
            partition_id,
            Box::new(HashMapStorage::new()),
            container,
        ))
    }

    fn write_behind(backend: &Arc<InMemoryMapStore>) -> Arc<DefaultRecordStore> {
        build(backend, |c| c.write_delay_seconds(1), Vec::new(), 1, 0)
    }

    fn write_through(backend: &Arc<InMemoryMapStore>) -> Arc<DefaultRecordStore> {
        build(backend, |c| c, Vec::new(), 1, 0)
    }

    fn dirty_count(store: &DefaultRecordStore) -> u64 {
        store.container.stats().dirty_entry_count()
    }

    fn seeded(n: usize) -> Arc<InMemoryMapStore> {
        let backend = Arc::new(InMemoryMapStore::new());
        backend.seed((0..n).map(|i| (format!("key-{i}"), Value::Int(i as i64))));
        backend
    }

    fn lazy_only() -> Arc<InMemoryMapStore> {
        Arc::new(InMemoryMapStore::new().without_key_enumeration())
    }

    // --- Write-behind ---

    #[tokio::test]
    async fn write_behind_defers_store_until_flush() {
        let backend = lazy_only();
        let store = write_behind(&backend);

        assert_eq!(store.put("a", Value::Int(1)).await.unwrap(), None);
        assert_eq!(backend.calls().store, 0);
        assert_eq!(store.pending_count(), 1);
        assert_eq!(dirty_count(&store), 1);
        assert!(store.get_record("a").unwrap().is_dirty());

        assert_eq!(store.flush().await.unwrap(), 1);
        assert_eq!(backend.get("a"), Some(Value::Int(1)));
        assert_eq!(store.pending_count(), 0);
        assert_eq!(dirty_count(&store), 0);
        assert!(!store.get_record("a").unwrap().is_dirty());
    }

    #[tokio::test]
    async fn repeated_updates_coalesce_into_one_store() {
        let backend = lazy_only();
        let store = write_behind(&backend);

        for i in 0..10 {
            store.put("a", Value::Int(i)).await.unwrap();
        }
        assert_eq!(dirty_count(&store), 1);
        store.flush().await.unwrap();

        assert_eq!(backend.store_count("a"), 1);
        assert_eq!(backend.get("a"), Some(Value::Int(9)));
    }

    #[tokio::test]
    async fn put_then_remove_before_flush_never_stores() {
        let backend = lazy_only();
        let store = write_behind(&backend);

        store.put("k", Value::Int(1)).await.unwrap();
        assert_eq!(store.remove("k").await.unwrap(), Some(Value::Int(1)));
        store.flush().await.unwrap();

        assert_eq!(backend.store_count("k"), 0);
        assert!(!backend.contains_key("k"));
        assert_eq!(dirty_count(&store), 0);
    }

    #[tokio::test]
    async fn flushed_batch_preserves_per_key_order() {
        let backend = lazy_only();
        let store = write_behind(&backend);

        store.put("a", Value::Int(1)).await.unwrap();
        store.flush().await.unwrap();
        store.remove("a").await.unwrap();
        store.flush().await.unwrap();
        store.put("a", Value::Int(2)).await.unwrap();
        store.flush().await.unwrap();

        let history: Vec<BackendWrite> = backend.history();
        assert_eq!(
            history,
            vec![
                BackendWrite::Store { key: "a".into(), value: Value::Int(1) },
                BackendWrite::Delete { key: "a".into() },
                BackendWrite::Store { key: "a".into(), value: Value::Int(2) },
            ]
        );
    }

    #[tokio::test]
    async fn failed_flush_requeues_and_retries() {
        let backend = lazy_only();
        let store = write_behind(&backend);
        store.put("a", Value::Int(1)).await.unwrap();
        store.put("b", Value::Int(2)).await.unwrap();

        backend.set_fail_writes(true);
        let err = store.flush().await.unwrap_err();
        assert_eq!(err.backend_operation(), Some(BackendOperation::StoreAll));
        assert_eq!(store.pending_count(), 2);
        assert_eq!(dirty_count(&store), 2);
        assert!(store.get_record("a").unwrap().is_dirty());

        // Not due yet: backoff pushed the entries into the future.
        assert_eq!(store.flush_due(now_millis()).await.unwrap(), 0);

        backend.set_fail_writes(false);
        assert_eq!(store.flush().await.unwrap(), 2);
        assert_eq!(backend.len(), 2);
        assert_eq!(dirty_count(&store), 0);
    }

    #[tokio::test]
    async fn flush_due_only_takes_entries_past_the_delay() {
        let backend = lazy_only();
        let store = write_behind(&backend);
        store.put("a", Value::Int(1)).await.unwrap();

        assert_eq!(store.flush_due(now_millis()).await.unwrap(), 0);
        assert_eq!(store.flush_due(now_millis() + 1_000).await.unwrap(), 1);
        assert_eq!(backend.get("a"), Some(Value::Int(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn update_during_inflight_flush_stays_dirty() {
        let backend = Arc::new(
            InMemoryMapStore::new()
                .without_key_enumeration()
                .with_write_latency(Duration::from_millis(100)),
        );
        let store = write_behind(&backend);
        store.put("a", Value::Int(1)).await.unwrap();

        let flushing = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.flush().await })
        };
        tokio::task::yield_now().await;

        store.put("a", Value::Int(2)).await.unwrap();
        assert_eq!(flushing.await.unwrap().unwrap(), 1);

        assert_eq!(backend.get("a"), Some(Value::Int(1)));
        let record = store.get_record("a").unwrap();
        assert_eq!(record.value, Value::Int(2));
        assert!(record.is_dirty());
        assert_eq!(store.pending_count(), 1);
        assert_eq!(dirty_count(&store), 1);

        store.flush().await.unwrap();
        assert_eq!(backend.get("a"), Some(Value::Int(2)));
        assert_eq!(dirty_count(&store), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reads_do_not_wait_for_a_slow_flush() {
        let backend = Arc::new(
            InMemoryMapStore::new()
                .without_key_enumeration()
                .with_write_latency(Duration::from_secs(30)),
        );
        let store = write_behind(&backend);
        store.put("a", Value::Int(1)).await.unwrap();

        let flushing = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.flush().await })
        };
        tokio::task::yield_now().await;

        let start = tokio::time::Instant::now();
        assert_eq!(store.get("a").await.unwrap(), Some(Value::Int(1)));
        store.put("b", Value::Int(2)).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));

        flushing.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn post_processed_value_is_merged_back() {
        let backend = Arc::new(
            InMemoryMapStore::new()
                .without_key_enumeration()
                .with_post_processor(|v| {
                    v.set_field("id", Value::Int(7));
                }),
        );
        let store = write_behind(&backend);
        store.put("a", Value::Map(BTreeMap::new())).await.unwrap();
        store.flush().await.unwrap();

        let record = store.get_record("a").unwrap();
        assert_eq!(record.value.field("id"), Some(&Value::Int(7)));
        assert!(!record.is_dirty());
    }

    // --- Write-through ---

    #[tokio::test]
    async fn write_through_stores_each_mutation_immediately() {
        let backend = lazy_only();
        let store = write_through(&backend);

        store.put("a", Value::Int(1)).await.unwrap();
        assert_eq!(backend.calls().store, 1);
        assert!(!store.get_record("a").unwrap().is_dirty());
        assert_eq!(store.pending_count(), 0);

        store.remove("a").await.unwrap();
        assert_eq!(backend.calls().delete, 1);
        assert!(backend.is_empty());
        assert_eq!(dirty_count(&store), 0);
    }

    #[tokio::test]
    async fn write_through_failure_is_returned_and_record_stays_dirty() {
        let backend = lazy_only();
        let store = write_through(&backend);
        backend.set_fail_writes(true);

        let err = store.put("a", Value::Int(1)).await.unwrap_err();
        assert!(matches!(err, MapStoreError::Backend { .. }));
        let record = store.get_record("a").unwrap();
        assert_eq!(record.value, Value::Int(1));
        assert!(record.is_dirty());
        assert_eq!(store.pending_count(), 0);
        assert_eq!(dirty_count(&store), 1);

        // Retrying the same key does not count it twice.
        assert!(store.put("a", Value::Int(2)).await.is_err());
        assert_eq!(dirty_count(&store), 1);

        backend.set_fail_writes(false);
        store.put("a", Value::Int(3)).await.unwrap();
        assert!(!store.get_record("a").unwrap().is_dirty());
        assert_eq!(dirty_count(&store), 0);
    }

    #[tokio::test]
    async fn removing_unconfirmed_write_through_record_clears_its_dirty_count() {
        let backend = lazy_only();
        let store = write_through(&backend);
        backend.set_fail_writes(true);
        assert!(store.put("a", Value::Int(1)).await.is_err());
        assert!(store.put("b", Value::Int(1)).await.is_err());
        assert_eq!(dirty_count(&store), 2);

        assert!(store.remove("a").await.is_err());
        assert_eq!(dirty_count(&store), 1);

        store.reset();
        assert_eq!(dirty_count(&store), 0);
    }

    #[tokio::test]
    async fn write_through_post_processing_merges_immediately() {
        let backend = Arc::new(
            InMemoryMapStore::new()
                .without_key_enumeration()
                .with_post_processor(|v| *v = Value::Int(100)),
        );
        let store = write_through(&backend);
        store.put("a", Value::Int(1)).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(Value::Int(100)));
    }

    #[tokio::test]
    async fn removing_absent_key_makes_no_backend_delete() {
        let backend = lazy_only();
        let store = write_through(&backend);

        assert_eq!(store.remove("nope").await.unwrap(), None);
        let calls = backend.calls();
        assert_eq!(calls.delete, 0);
        assert_eq!(calls.delete_all, 0);
    }

    #[tokio::test]
    async fn removing_backend_only_key_deletes_it() {
        let backend = lazy_only();
        backend.seed([("a", Value::Int(5))]);
        let store = write_through(&backend);

        assert_eq!(store.remove("a").await.unwrap(), Some(Value::Int(5)));
        assert!(!backend.contains_key("a"));
    }

    #[tokio::test]
    async fn clear_deletes_resident_keyset_with_one_call() {
        let backend = lazy_only();
        let store = write_through(&backend);
        for key in ["a", "b", "c"] {
            store.put(key, Value::Int(1)).await.unwrap();
        }

        assert_eq!(store.clear().await.unwrap(), 3);
        assert_eq!(backend.calls().delete_all, 1);
        assert!(backend.is_empty());
        assert_eq!(store.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn clear_in_write_behind_queues_deletes() {
        let backend = lazy_only();
        let store = write_behind(&backend);
        store.put("a", Value::Int(1)).await.unwrap();
        store.put("b", Value::Int(2)).await.unwrap();
        store.flush().await.unwrap();

        store.clear().await.unwrap();
        assert_eq!(store.pending_count(), 2);
        assert_eq!(backend.len(), 2);

        store.flush().await.unwrap();
        assert!(backend.is_empty());
        assert_eq!(backend.calls().delete_all, 1);
    }

    // --- Reads ---

    #[tokio::test]
    async fn read_through_caches_clean_and_never_writes_back() {
        let backend = lazy_only();
        backend.seed([("a", Value::Int(1))]);
        let store = write_behind(&backend);

        assert_eq!(store.get("a").await.unwrap(), Some(Value::Int(1)));
        assert_eq!(store.get("a").await.unwrap(), Some(Value::Int(1)));
        assert_eq!(backend.calls().load, 1);
        assert!(!store.get_record("a").unwrap().is_dirty());

        store.flush().await.unwrap();
        assert_eq!(backend.calls().store, 0);
        assert_eq!(backend.calls().store_all, 0);
    }

    #[tokio::test]
    async fn null_loads_are_not_cached() {
        let backend = lazy_only();
        let store = write_through(&backend);

        assert_eq!(store.get("missing").await.unwrap(), None);
        assert_eq!(store.get("missing").await.unwrap(), None);
        assert_eq!(backend.calls().load, 2);
        assert!(!store.exists_in_memory("missing"));
    }

    #[tokio::test]
    async fn pending_delete_hides_backend_value() {
        let backend = lazy_only();
        backend.seed([("a", Value::Int(1))]);
        let store = write_behind(&backend);

        store.get("a").await.unwrap();
        store.remove("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(backend.calls().load, 1);
    }

    #[tokio::test]
    async fn get_all_loads_misses_with_one_call() {
        let backend = lazy_only();
        backend.seed([("a", Value::Int(1)), ("b", Value::Int(2)), ("c", Value::Int(3))]);
        let store = write_through(&backend);
        store.get("a").await.unwrap();

        let keys: Vec<String> = ["a", "b", "x", "c", "b"].iter().map(ToString::to_string).collect();
        let result = store.get_all(&keys).await.unwrap();

        let got: Vec<&str> = result.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(got, vec!["a", "b", "c"]);
        assert_eq!(backend.calls().load_all, 1);
        assert_eq!(backend.load_all_sizes(), vec![3]);
    }

    #[tokio::test]
    async fn conditional_writes_consult_the_backend() {
        let backend = lazy_only();
        backend.seed([("a", Value::Int(1))]);
        let store = write_through(&backend);

        assert_eq!(store.put_if_absent("a", Value::Int(2)).await.unwrap(), Some(Value::Int(1)));
        assert_eq!(store.put_if_absent("b", Value::Int(3)).await.unwrap(), None);
        assert_eq!(store.replace("c", Value::Int(0)).await.unwrap(), None);
        assert_eq!(store.replace("b", Value::Int(4)).await.unwrap(), Some(Value::Int(3)));
        assert!(store.replace_if_same("b", &Value::Int(4), Value::Int(5)).await.unwrap());
        assert!(!store.replace_if_same("b", &Value::Int(4), Value::Int(6)).await.unwrap());

        assert_eq!(backend.get("a"), Some(Value::Int(1)));
        assert_eq!(backend.get("b"), Some(Value::Int(5)));
        assert!(!backend.contains_key("c"));
        assert!(store.contains_key("b").await.unwrap());
        assert!(store.contains_value(&Value::Int(5)).await.unwrap());
    }

    // --- Initial load ---

    #[tokio::test]
    async fn eager_mode_loads_everything_before_first_operation() {
        let backend = seeded(100);
        let store = build(
            &backend,
            |c| c.initial_load_mode(InitialLoadMode::Eager).load_chunk_size(30),
            Vec::new(),
            1,
            0,
        );

        assert_eq!(store.get("key-5").await.unwrap(), Some(Value::Int(5)));
        assert_eq!(store.load_state(), LoadState::Loaded);
        assert_eq!(backend.calls().load, 0);
        assert_eq!(backend.calls().load_all_keys, 1);
        assert_eq!(backend.load_all_sizes(), vec![30, 30, 30, 10]);
        assert_eq!(store.size().await.unwrap(), 100);
    }

    #[tokio::test]
    async fn loaded_entries_are_never_written_back() {
        let backend = seeded(50);
        let store = build(&backend, |c| c.write_delay_seconds(1), Vec::new(), 1, 0);

        assert_eq!(store.size().await.unwrap(), 50);
        assert_eq!(dirty_count(&store), 0);
        store.flush().await.unwrap();
        assert_eq!(backend.stored_entry_count(), 0);
    }

    #[tokio::test]
    async fn lazy_aggregates_wait_for_the_load() {
        let backend = seeded(20);
        let store = build(&backend, |c| c, Vec::new(), 1, 0);

        assert_eq!(store.load_state(), LoadState::NotStarted);
        assert_eq!(store.key_set().await.unwrap().len(), 20);
        assert_eq!(store.values().await.unwrap().len(), 20);
        assert_eq!(store.load_state(), LoadState::Loaded);
    }

    #[tokio::test]
    async fn load_only_materializes_owned_partition() {
        let backend = seeded(300);
        let count = 4;
        let store = build(&backend, |c| c, Vec::new(), count, 1);

        let expected = (0..300)
            .filter(|i| partition_for_key(&format!("key-{i}"), count) == 1)
            .count();
        assert_eq!(store.size().await.unwrap(), expected);
        for (key, _) in store.entry_set().await.unwrap() {
            assert_eq!(partition_for_key(&key, count), 1);
        }
    }

    #[tokio::test]
    async fn caller_write_wins_over_loaded_value() {
        let backend = seeded(10);
        let store = build(&backend, |c| c.write_delay_seconds(1), Vec::new(), 1, 0);

        store.put("key-3", Value::from("mine")).await.unwrap();
        store.load_initial().await.unwrap();

        assert_eq!(store.get("key-3").await.unwrap(), Some(Value::from("mine")));
        assert_eq!(store.size().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn keys_missing_from_bulk_load_are_not_reloaded() {
        let backend = Arc::new(InMemoryMapStore::new().with_null_load_all());
        backend.seed([("a", Value::Int(1))]);
        let store = build(&backend, |c| c, Vec::new(), 1, 0);

        store.wait_until_loaded().await;
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(backend.calls().load, 0);

        store.put("a", Value::Int(2)).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(Value::Int(2)));
    }

    #[tokio::test]
    async fn second_load_initial_is_a_no_op() {
        let backend = seeded(5);
        let store = build(&backend, |c| c, Vec::new(), 1, 0);

        assert!(store.load_initial().await.is_some());
        assert!(store.load_initial().await.is_none());
        assert_eq!(backend.calls().load_all_keys, 1);
    }

    #[tokio::test]
    async fn eager_load_blocks_only_its_own_store() {
        let slow = Arc::new(InMemoryMapStore::new().with_load_gate());
        slow.seed([("a", Value::Int(1))]);
        let fast = seeded(3);
        let eager = |c: MapStoreConfig| c.initial_load_mode(InitialLoadMode::Eager);
        let loading = build(&slow, eager, Vec::new(), 1, 0);
        let other = build(&fast, eager, Vec::new(), 1, 0);

        let pending_get = {
            let store = Arc::clone(&loading);
            tokio::spawn(async move { store.get("a").await })
        };
        while slow.calls().load_all == 0 {
            tokio::task::yield_now().await;
        }
        let pending_put = {
            let store = Arc::clone(&loading);
            tokio::spawn(async move { store.put("b", Value::Int(2)).await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(loading.load_state(), LoadState::Loading);
        assert!(!pending_get.is_finished());
        assert!(!pending_put.is_finished());
        assert!(!loading.exists_in_memory("b"));

        assert_eq!(other.get("key-1").await.unwrap(), Some(Value::Int(1)));
        assert_eq!(other.load_state(), LoadState::Loaded);

        slow.open_load_gate();
        assert_eq!(pending_get.await.unwrap().unwrap(), Some(Value::Int(1)));
        assert_eq!(pending_put.await.unwrap().unwrap(), None);
        assert_eq!(loading.load_state(), LoadState::Loaded);
        assert_eq!(slow.calls().load, 0);
    }

    // --- Lifecycle & observers ---

    #[tokio::test]
    async fn mutation_resuming_after_close_is_rejected() {
        let backend = Arc::new(
            InMemoryMapStore::new()
                .without_key_enumeration()
                .with_load_gate(),
        );
        let store = build(&backend, |c| c.write_delay_seconds(60), Vec::new(), 1, 0);

        let pending = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.put_if_absent("k", Value::Int(1)).await })
        };
        while backend.calls().load == 0 {
            tokio::task::yield_now().await;
        }

        store.close(false);
        assert_eq!(store.flush().await.unwrap(), 0);
        backend.open_load_gate();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, MapStoreError::NotOwned { partition_id: 0 }));
        assert_eq!(store.pending_count(), 0);
        assert!(!store.exists_in_memory("k"));
        assert!(matches!(
            store.remove("other").await.unwrap_err(),
            MapStoreError::NotOwned { .. }
        ));

        store.reopen();
        assert_eq!(store.put_if_absent("k", Value::Int(1)).await.unwrap(), None);
        assert_eq!(store.pending_count(), 1);
    }

    #[tokio::test]
    async fn close_keeps_earlier_mutations_flushable() {
        let backend = lazy_only();
        let store = write_behind(&backend);
        store.put("a", Value::Int(1)).await.unwrap();

        store.close(true);
        assert!(matches!(
            store.put("b", Value::Int(2)).await.unwrap_err(),
            MapStoreError::ShuttingDown
        ));
        assert_eq!(store.flush().await.unwrap(), 1);
        assert_eq!(backend.get("a"), Some(Value::Int(1)));
        assert!(!backend.contains_key("b"));
    }

    #[tokio::test]
    async fn destroyed_store_cannot_be_reopened() {
        let backend = lazy_only();
        let store = write_behind(&backend);
        store.destroy(false);
        store.reopen();
        assert!(matches!(
            store.put("a", Value::Int(1)).await.unwrap_err(),
            MapStoreError::NotOwned { .. }
        ));
    }

    #[tokio::test]
    async fn reset_discards_pending_entries() {
        let backend = lazy_only();
        let store = write_behind(&backend);
        store.put("a", Value::Int(1)).await.unwrap();
        store.put("b", Value::Int(1)).await.unwrap();

        store.reset();
        assert_eq!(store.pending_count(), 0);
        assert_eq!(dirty_count(&store), 0);
        assert!(!store.exists_in_memory("a"));
        assert_eq!(store.load_state(), LoadState::NotStarted);
    }

    #[tokio::test]
    async fn bulk_loaded_entries_are_announced_as_added() {
        let backend = seeded(4);
        let (publisher, mut rx) = EntryEventPublisher::channel();
        let observer: Arc<dyn MutationObserver> = Arc::new(publisher);
        let store = build(&backend, |c| c, vec![observer], 1, 0);

        store.wait_until_loaded().await;
        let kinds: Vec<EntryEventKind> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![EntryEventKind::Added; 4]);
    }

    #[tokio::test]
    async fn observers_see_entry_events() {
        let backend = lazy_only();
        backend.seed([("loaded", Value::Int(0))]);
        let (publisher, mut rx) = EntryEventPublisher::channel();
        let observer: Arc<dyn MutationObserver> = Arc::new(publisher);
        let store = build(&backend, |c| c, vec![observer], 1, 0);

        store.put("a", Value::Int(1)).await.unwrap();
        store.put("a", Value::Int(2)).await.unwrap();
        store.get("loaded").await.unwrap();
        store.remove("a").await.unwrap();

        let kinds: Vec<EntryEventKind> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                EntryEventKind::Added,
                EntryEventKind::Updated,
                EntryEventKind::Loaded,
                EntryEventKind::Removed,
            ]
        );
    }
}
