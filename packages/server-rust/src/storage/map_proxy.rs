//! Map-level facade.
//!
//! [`MapProxy`] routes keyed operations to the owning partition's record
//! store by FNV-1a hash and fans aggregates out over the node's owned
//! partitions.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use harbor_core::{partition_for_key, Value};

use super::map_service::MapService;
use super::mapstore::LocalMapStatsSnapshot;
use super::record_store::RecordStore;
use crate::error::MapStoreResult;

#[derive(Clone)]
pub struct MapProxy {
    service: Arc<MapService>,
    name: String,
    partition_count: u32,
}

impl MapProxy {
    pub(crate) fn new(service: Arc<MapService>, name: impl Into<String>, partition_count: u32) -> Self {
        Self {
            service,
            name: name.into(),
            partition_count,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn partition_for(&self, key: &str) -> u32 {
        partition_for_key(key, self.partition_count)
    }

    async fn store_for(&self, key: &str) -> MapStoreResult<Arc<dyn RecordStore>> {
        self.service.record_store(&self.name, self.partition_for(key)).await
    }

    async fn owned_stores(&self) -> MapStoreResult<Vec<Arc<dyn RecordStore>>> {
        let mut stores = Vec::new();
        for partition_id in self.service.owned_partitions().iter().copied() {
            stores.push(self.service.record_store(&self.name, partition_id).await?);
        }
        Ok(stores)
    }

    // --- Keyed operations ---

    pub async fn get(&self, key: &str) -> MapStoreResult<Option<Value>> {
        self.store_for(key).await?.get(key).await
    }

    pub async fn contains_key(&self, key: &str) -> MapStoreResult<bool> {
        self.store_for(key).await?.contains_key(key).await
    }

    pub async fn put(&self, key: &str, value: Value) -> MapStoreResult<Option<Value>> {
        self.store_for(key).await?.put(key, value).await
    }

    pub async fn put_if_absent(&self, key: &str, value: Value) -> MapStoreResult<Option<Value>> {
        self.store_for(key).await?.put_if_absent(key, value).await
    }

    pub async fn replace(&self, key: &str, value: Value) -> MapStoreResult<Option<Value>> {
        self.store_for(key).await?.replace(key, value).await
    }

    pub async fn replace_if_same(&self, key: &str, expected: &Value, value: Value) -> MapStoreResult<bool> {
        self.store_for(key)
            .await?
            .replace_if_same(key, expected, value)
            .await
    }

    pub async fn remove(&self, key: &str) -> MapStoreResult<Option<Value>> {
        self.store_for(key).await?.remove(key).await
    }

    /// Values for `keys` in request order, one `get_all` per partition.
    pub async fn get_all(&self, keys: &[String]) -> MapStoreResult<Vec<(String, Value)>> {
        let mut by_partition: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        for key in keys {
            by_partition
                .entry(self.partition_for(key))
                .or_default()
                .push(key.clone());
        }

        let mut found: HashMap<String, Value> = HashMap::with_capacity(keys.len());
        for (partition_id, partition_keys) in by_partition {
            let store = self.service.record_store(&self.name, partition_id).await?;
            found.extend(store.get_all(&partition_keys).await?);
        }
        Ok(keys
            .iter()
            .filter_map(|k| found.remove(k).map(|v| (k.clone(), v)))
            .collect())
    }

    // --- Aggregates ---

    pub async fn size(&self) -> MapStoreResult<usize> {
        let mut total = 0;
        for store in self.owned_stores().await? {
            total += store.size().await?;
        }
        Ok(total)
    }

    pub async fn is_empty(&self) -> MapStoreResult<bool> {
        Ok(self.size().await? == 0)
    }

    pub async fn contains_value(&self, value: &Value) -> MapStoreResult<bool> {
        for store in self.owned_stores().await? {
            if store.contains_value(value).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn entry_set(&self) -> MapStoreResult<Vec<(String, Value)>> {
        let mut entries = Vec::new();
        for store in self.owned_stores().await? {
            entries.extend(store.entry_set().await?);
        }
        Ok(entries)
    }

    pub async fn key_set(&self) -> MapStoreResult<Vec<String>> {
        Ok(self.entry_set().await?.into_iter().map(|(k, _)| k).collect())
    }

    pub async fn values(&self) -> MapStoreResult<Vec<Value>> {
        Ok(self.entry_set().await?.into_iter().map(|(_, v)| v).collect())
    }

    /// Clears every owned partition. Returns the number of removed entries.
    pub async fn clear(&self) -> MapStoreResult<usize> {
        let mut removed = 0;
        for store in self.owned_stores().await? {
            removed += store.clear().await?;
        }
        Ok(removed)
    }

    /// Blocks until every owned partition finished its initial load.
    pub async fn wait_until_loaded(&self) -> MapStoreResult<()> {
        for store in self.owned_stores().await? {
            store.wait_until_loaded().await;
        }
        Ok(())
    }

    // --- Persistence ---

    /// Synchronously writes every pending entry to the backend.
    pub async fn flush(&self) -> MapStoreResult<usize> {
        self.service.flush_map(&self.name).await
    }

    /// Schedules a flush on the background worker and returns immediately.
    pub async fn soft_flush(&self) -> MapStoreResult<()> {
        self.service.soft_flush(&self.name).await
    }

    #[must_use]
    pub fn stats(&self) -> Option<LocalMapStatsSnapshot> {
        self.service.stats(&self.name)
    }

    /// Entries not yet confirmed by the backend.
    #[must_use]
    pub fn dirty_entry_count(&self) -> u64 {
        self.stats().map_or(0, |s| s.dirty_entry_count)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::service::config::ServerConfig;
    use crate::storage::datastores::InMemoryMapStore;
    use crate::storage::mapstore::{InitialLoadMode, MapStoreConfig};
    use crate::storage::mutation_observer::{EntryEventKind, EntryEventPublisher};
    use crate::traits::MapStore;

    async fn map_with(
        partition_count: u32,
        backend: &Arc<InMemoryMapStore>,
        config: impl FnOnce(MapStoreConfig) -> MapStoreConfig,
    ) -> MapProxy {
        let svc = Arc::new(MapService::new(ServerConfig {
            node_id: "node-1".to_string(),
            partition_count,
            ..ServerConfig::default()
        }));
        let dyn_store: Arc<dyn MapStore> = Arc::clone(backend) as _;
        svc.configure_map("m", config(MapStoreConfig::with_store(dyn_store)))
            .unwrap();
        svc.get_map("m").await.unwrap()
    }

    fn seeded(n: usize) -> Arc<InMemoryMapStore> {
        let backend = Arc::new(InMemoryMapStore::new());
        backend.seed((0..n).map(|i| (format!("key-{i}"), Value::Int(i as i64))));
        backend
    }

    fn ceil_div(a: usize, b: usize) -> usize {
        a.div_ceil(b)
    }

    #[tokio::test]
    async fn eager_load_in_chunks_of_five() {
        let backend = seeded(100);
        let map = map_with(1, &backend, |c| {
            c.initial_load_mode(InitialLoadMode::Eager).load_chunk_size(5)
        })
        .await;

        assert_eq!(map.get("key-42").await.unwrap(), Some(Value::Int(42)));
        assert_eq!(map.size().await.unwrap(), 100);
        assert_eq!(backend.calls().load_all, 20);
        assert!(backend.load_all_sizes().iter().all(|&n| n == 5));
        assert_eq!(backend.calls().load, 0);
    }

    #[tokio::test]
    async fn chunk_count_is_per_partition() {
        let backend = seeded(257);
        let count = 7;
        let chunk = 10;
        let map = map_with(count, &backend, |c| c.load_chunk_size(chunk)).await;

        assert_eq!(map.size().await.unwrap(), 257);
        let expected: usize = (0..count)
            .map(|pid| {
                let owned = (0..257)
                    .filter(|i| partition_for_key(&format!("key-{i}"), count) == pid)
                    .count();
                ceil_div(owned, chunk)
            })
            .sum();
        assert_eq!(backend.calls().load_all, expected);
    }

    #[tokio::test]
    async fn eager_first_operation_sees_every_key() {
        let backend = seeded(64);
        let map = map_with(5, &backend, |c| c.initial_load_mode(InitialLoadMode::Eager)).await;

        let mut keys = map.key_set().await.unwrap();
        keys.sort();
        assert_eq!(keys.len(), 64);
        assert_eq!(backend.calls().load, 0);
    }

    #[tokio::test]
    async fn two_quick_puts_store_only_the_latest() {
        let backend = Arc::new(InMemoryMapStore::new());
        let map = map_with(3, &backend, |c| c.write_delay_seconds(1)).await;

        map.put("k", Value::from("v1")).await.unwrap();
        map.put("k", Value::from("v2")).await.unwrap();
        map.flush().await.unwrap();

        assert_eq!(backend.store_count("k"), 1);
        assert_eq!(backend.get("k"), Some(Value::from("v2")));
    }

    #[tokio::test]
    async fn put_then_remove_never_reaches_the_backend() {
        let backend = Arc::new(InMemoryMapStore::new());
        let map = map_with(3, &backend, |c| c.write_delay_seconds(1)).await;

        map.put("k", Value::Int(1)).await.unwrap();
        map.remove("k").await.unwrap();
        map.flush().await.unwrap();

        assert_eq!(backend.store_count("k"), 0);
        assert!(!backend.contains_key("k"));
    }

    #[tokio::test]
    async fn null_bulk_load_leaves_map_empty() {
        let backend = Arc::new(InMemoryMapStore::new().with_null_load_all());
        backend.seed((0..10).map(|i| (format!("key-{i}"), Value::Int(i))));
        let map = map_with(2, &backend, |c| c.load_chunk_size(3)).await;

        assert_eq!(map.size().await.unwrap(), 0);
        assert!(map.is_empty().await.unwrap());
        assert!(backend.calls().load_all >= 2);
    }

    #[tokio::test]
    async fn post_processed_value_is_visible_to_get() {
        let backend = Arc::new(InMemoryMapStore::new().with_post_processor(|v| {
            v.set_field("id", Value::from("generated"));
        }));
        let map = map_with(3, &backend, |c| c.write_delay_seconds(1)).await;

        map.put("k", Value::Map(BTreeMap::new())).await.unwrap();
        map.flush().await.unwrap();

        let value = map.get("k").await.unwrap().unwrap();
        assert_eq!(value.field("id"), Some(&Value::from("generated")));
    }

    #[tokio::test]
    async fn dirty_count_tracks_distinct_keys() {
        let backend = Arc::new(InMemoryMapStore::new());
        let map = map_with(5, &backend, |c| c.write_delay_seconds(60)).await;

        for i in 0..25 {
            map.put(&format!("k{i}"), Value::Int(i)).await.unwrap();
            map.put(&format!("k{i}"), Value::Int(i + 1)).await.unwrap();
        }
        assert_eq!(map.dirty_entry_count(), 25);

        map.flush().await.unwrap();
        assert_eq!(map.dirty_entry_count(), 0);
        assert_eq!(backend.len(), 25);
    }

    #[tokio::test]
    async fn write_through_counts_one_call_per_mutation() {
        let backend = Arc::new(InMemoryMapStore::new());
        let map = map_with(3, &backend, |c| c).await;

        for i in 0..10 {
            map.put(&format!("k{i}"), Value::Int(i)).await.unwrap();
        }
        map.remove("k0").await.unwrap();
        assert_eq!(map.remove("ten").await.unwrap(), None);

        let calls = backend.calls();
        assert_eq!(calls.store, 10);
        assert_eq!(calls.delete, 1);
        assert_eq!(calls.store_all, 0);
    }

    #[tokio::test]
    async fn put_after_null_load_is_stored() {
        let backend = Arc::new(InMemoryMapStore::new().without_key_enumeration());
        let map = map_with(3, &backend, |c| c).await;

        assert_eq!(map.get("k").await.unwrap(), None);
        map.put("k", Value::Int(1)).await.unwrap();
        assert_eq!(backend.get("k"), Some(Value::Int(1)));
    }

    #[tokio::test]
    async fn get_all_spans_partitions_in_request_order() {
        let backend = Arc::new(InMemoryMapStore::new().without_key_enumeration());
        backend.seed((0..20).map(|i| (format!("key-{i}"), Value::Int(i))));
        let map = map_with(4, &backend, |c| c).await;

        let keys: Vec<String> = [3, 17, 99, 0].iter().map(|i| format!("key-{i}")).collect();
        let got = map.get_all(&keys).await.unwrap();
        let got_keys: Vec<&str> = got.iter().map(|(k, _)| k.as_str()).collect();

        assert_eq!(got_keys, vec!["key-3", "key-17", "key-0"]);
        assert_eq!(backend.calls().load, 0);
    }

    #[tokio::test]
    async fn clear_deletes_from_backend() {
        let backend = seeded(30);
        let map = map_with(3, &backend, |c| c).await;

        assert_eq!(map.clear().await.unwrap(), 30);
        assert!(backend.is_empty());
        assert_eq!(map.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn conditional_writes_trigger_store() {
        let backend = Arc::new(InMemoryMapStore::new());
        let map = map_with(3, &backend, |c| c).await;

        map.put_if_absent("a", Value::Int(1)).await.unwrap();
        map.replace("a", Value::Int(2)).await.unwrap();
        assert!(map.replace_if_same("a", &Value::Int(2), Value::Int(3)).await.unwrap());

        assert_eq!(backend.calls().store, 3);
        assert_eq!(backend.get("a"), Some(Value::Int(3)));
        assert!(map.contains_value(&Value::Int(3)).await.unwrap());
        assert!(map.contains_key("a").await.unwrap());
    }

    #[tokio::test]
    async fn bulk_loaded_entries_raise_added_events() {
        let backend = seeded(5);
        let (publisher, mut rx) = EntryEventPublisher::channel();
        let svc = Arc::new(
            MapService::new(ServerConfig {
                node_id: "node-1".to_string(),
                partition_count: 2,
                ..ServerConfig::default()
            })
            .with_observer(Arc::new(publisher)),
        );
        let dyn_store: Arc<dyn MapStore> = Arc::clone(&backend) as _;
        svc.configure_map("m", MapStoreConfig::with_store(dyn_store)).unwrap();
        let map = svc.get_map("m").await.unwrap();

        map.wait_until_loaded().await.unwrap();
        let added = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| e.kind == EntryEventKind::Added)
            .count();
        assert_eq!(added, 5);
    }
}
