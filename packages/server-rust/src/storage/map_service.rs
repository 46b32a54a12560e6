//! Node-wide registry of maps and their record stores.
//!
//! [`MapService`] owns one [`MapContainer`] per active map and one
//! [`RecordStore`] per `(map, owned partition)`. It activates stores on first
//! access (running the backend `init` once per map and starting the initial
//! load), reacts to partition ownership changes, runs the write-behind flush
//! worker, and performs the final flush and backend `destroy` on shutdown.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use harbor_core::PartitionTable;

use super::factory::RecordStoreFactory;
use super::map_container::MapContainer;
use super::map_proxy::MapProxy;
use super::mapstore::{
    FlushScheduler, FlushTask, InitialLoadMode, LocalMapStatsSnapshot, MapStoreConfig,
    RecordStoreRegistry,
};
use super::mutation_observer::MutationObserver;
use super::record_store::RecordStore;
use crate::error::{MapStoreError, MapStoreResult};
use crate::service::config::ServerConfig;
use crate::service::worker::BackgroundWorker;

pub struct MapService {
    config: ServerConfig,
    map_configs: DashMap<String, MapStoreConfig>,
    containers: DashMap<String, Arc<MapContainer>>,
    stores: RecordStoreRegistry,
    owned: ArcSwap<BTreeSet<u32>>,
    observers: Vec<Arc<dyn MutationObserver>>,
    factory: RecordStoreFactory,
    flush_worker: tokio::sync::Mutex<Option<BackgroundWorker<FlushScheduler>>>,
    shutting_down: AtomicBool,
}

impl MapService {
    /// Creates a service that owns every partition until told otherwise.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        let owned: BTreeSet<u32> = (0..config.partition_count).collect();
        Self {
            config,
            map_configs: DashMap::new(),
            containers: DashMap::new(),
            stores: Arc::new(DashMap::new()),
            owned: ArcSwap::from_pointee(owned),
            observers: Vec::new(),
            factory: RecordStoreFactory::new(),
            flush_worker: tokio::sync::Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Registers an observer for every map activated afterwards.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn MutationObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    #[must_use]
    pub fn with_factory(mut self, factory: RecordStoreFactory) -> Self {
        self.factory = factory;
        self
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Attaches a backend configuration to `name`.
    ///
    /// # Errors
    ///
    /// Returns [`MapStoreError::Configuration`] if the configuration is
    /// invalid or the map is already active.
    pub fn configure_map(&self, name: impl Into<String>, config: MapStoreConfig) -> MapStoreResult<()> {
        let name = name.into();
        config.validate()?;
        if self.containers.contains_key(&name) {
            return Err(MapStoreError::Configuration(format!(
                "map '{name}' is already active"
            )));
        }
        self.map_configs.insert(name, config);
        Ok(())
    }

    /// Starts the background flush worker. Calling it twice is a no-op.
    pub async fn start(&self) {
        let mut worker = self.flush_worker.lock().await;
        if worker.is_none() {
            *worker = Some(BackgroundWorker::start(
                "write-behind-flush",
                FlushScheduler::new(Arc::clone(&self.stores)),
                self.config.flush_interval(),
            ));
            tracing::info!(
                node_id = %self.config.node_id,
                interval = ?self.config.flush_interval(),
                "flush worker started"
            );
        }
    }

    // --- Activation ---

    fn ensure_running(&self) -> MapStoreResult<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(MapStoreError::ShuttingDown);
        }
        Ok(())
    }

    #[must_use]
    pub fn owns_partition(&self, partition_id: u32) -> bool {
        self.owned.load().contains(&partition_id)
    }

    #[must_use]
    pub fn owned_partitions(&self) -> Arc<BTreeSet<u32>> {
        self.owned.load_full()
    }

    /// Container for `name`, created and initialized on first use.
    ///
    /// # Errors
    ///
    /// Returns a configuration error from activation, or a backend error if
    /// the backend `init` hook fails.
    pub async fn container(&self, name: &str) -> MapStoreResult<Arc<MapContainer>> {
        self.ensure_running()?;
        let container = match self.containers.entry(name.to_string()) {
            Entry::Occupied(e) => Arc::clone(e.get()),
            Entry::Vacant(v) => {
                let config = self
                    .map_configs
                    .get(name)
                    .map(|c| c.value().clone())
                    .unwrap_or_default();
                let container = Arc::new(MapContainer::new(
                    name,
                    self.config.node_id.clone(),
                    self.config.partition_count,
                    config,
                    self.observers.clone(),
                )?);
                v.insert(Arc::clone(&container));
                container
            }
        };
        container.ensure_initialized().await?;
        Ok(container)
    }

    /// Record store for `(map, partition_id)`, activated on first use.
    ///
    /// A newly activated store starts its initial load in the background.
    ///
    /// # Errors
    ///
    /// Returns [`MapStoreError::NotOwned`] if this node does not own the
    /// partition, [`MapStoreError::ShuttingDown`] after shutdown began, or
    /// an activation error from [`container`](Self::container).
    pub async fn record_store(&self, map: &str, partition_id: u32) -> MapStoreResult<Arc<dyn RecordStore>> {
        self.ensure_running()?;
        if !self.owns_partition(partition_id) {
            return Err(MapStoreError::NotOwned { partition_id });
        }
        let key = (map.to_string(), partition_id);
        if let Some(store) = self.stores.get(&key) {
            return Ok(Arc::clone(store.value()));
        }

        let container = self.container(map).await?;
        let (store, created) = match self.stores.entry(key) {
            Entry::Occupied(e) => (Arc::clone(e.get()), false),
            Entry::Vacant(v) => {
                let store = self.factory.create(&container, partition_id);
                v.insert(Arc::clone(&store));
                (store, true)
            }
        };
        if created {
            tracing::debug!(map = %map, partition_id, "record store activated");
            let loading = Arc::clone(&store);
            tokio::spawn(async move {
                loading.load_initial().await;
            });
        }
        Ok(store)
    }

    /// Record stores of `map` on this node, ordered by partition.
    #[must_use]
    pub fn stores_for_map(&self, map: &str) -> Vec<Arc<dyn RecordStore>> {
        let mut stores: Vec<(u32, Arc<dyn RecordStore>)> = self
            .stores
            .iter()
            .filter(|e| e.key().0 == map)
            .map(|e| (e.key().1, Arc::clone(e.value())))
            .collect();
        stores.sort_by_key(|(pid, _)| *pid);
        stores.into_iter().map(|(_, s)| s).collect()
    }

    /// Facade over every owned partition of `name`.
    ///
    /// Eager maps activate all owned partitions up front so their initial
    /// loads start immediately.
    ///
    /// # Errors
    ///
    /// Returns an activation error from [`container`](Self::container).
    pub async fn get_map(self: &Arc<Self>, name: &str) -> MapStoreResult<MapProxy> {
        let container = self.container(name).await?;
        if container.initial_load_mode() == InitialLoadMode::Eager {
            for partition_id in self.owned_partitions().iter().copied() {
                self.record_store(name, partition_id).await?;
            }
        }
        Ok(MapProxy::new(Arc::clone(self), name, self.config.partition_count))
    }

    // --- Partition ownership ---

    /// Takes ownership of `partition_id` and activates fresh record stores
    /// for every active map, each running its own initial load.
    ///
    /// # Errors
    ///
    /// Returns the first activation error.
    pub async fn on_partition_owned(&self, partition_id: u32) -> MapStoreResult<()> {
        self.ensure_running()?;
        self.owned.rcu(|owned| {
            let mut owned = BTreeSet::clone(owned);
            owned.insert(partition_id);
            owned
        });
        tracing::info!(partition_id, "partition owned");

        let maps: Vec<String> = self.containers.iter().map(|e| e.key().clone()).collect();
        for map in maps {
            self.record_store(&map, partition_id).await?;
        }
        Ok(())
    }

    /// Releases `partition_id`: closes its record stores to new mutations,
    /// flushes their pending writes, then destroys them.
    ///
    /// # Errors
    ///
    /// Returns the backend error if a flush fails. Ownership is kept and
    /// nothing is released in that case.
    pub async fn on_partition_lost(&self, partition_id: u32) -> MapStoreResult<()> {
        self.owned.rcu(|owned| {
            let mut owned = BTreeSet::clone(owned);
            owned.remove(&partition_id);
            owned
        });

        let stores: Vec<Arc<dyn RecordStore>> = self
            .stores
            .iter()
            .filter(|e| e.key().1 == partition_id)
            .map(|e| Arc::clone(e.value()))
            .collect();
        for store in &stores {
            store.close(false);
        }
        for store in &stores {
            if let Err(e) = store.flush().await {
                for store in &stores {
                    store.reopen();
                }
                self.owned.rcu(|owned| {
                    let mut owned = BTreeSet::clone(owned);
                    owned.insert(partition_id);
                    owned
                });
                tracing::warn!(
                    map = %store.name(),
                    partition_id,
                    error = %e,
                    "flush before partition release failed; keeping ownership"
                );
                return Err(e);
            }
        }

        for store in stores {
            self.stores.remove(&(store.name().to_string(), partition_id));
            store.destroy(false);
        }
        tracing::info!(partition_id, "partition released");
        Ok(())
    }

    /// Reconciles ownership with `table`.
    ///
    /// # Errors
    ///
    /// Returns the first error from gaining or losing a partition; the
    /// remaining changes are still applied.
    pub async fn apply_partition_table(&self, table: &PartitionTable) -> MapStoreResult<()> {
        let target = table.partitions_for_node(&self.config.node_id);
        let current = self.owned_partitions();
        let mut first_error = None;

        for &partition_id in current.difference(&target) {
            if let Err(e) = self.on_partition_lost(partition_id).await {
                first_error.get_or_insert(e);
            }
        }
        for &partition_id in target.difference(&current) {
            if let Err(e) = self.on_partition_owned(partition_id).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    // --- Persistence ---

    /// Flushes every pending entry of `map`.
    ///
    /// # Errors
    ///
    /// Returns the first backend error; other partitions are still flushed.
    pub async fn flush_map(&self, map: &str) -> MapStoreResult<usize> {
        let mut flushed = 0;
        let mut first_error = None;
        for store in self.stores_for_map(map) {
            match store.flush().await {
                Ok(n) => flushed += n,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(flushed), Err)
    }

    /// Asks the flush worker to flush `map` without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns [`MapStoreError::Internal`] if the worker is not running.
    pub async fn soft_flush(&self, map: &str) -> MapStoreResult<()> {
        let worker = self.flush_worker.lock().await;
        let Some(worker) = worker.as_ref() else {
            return Err(MapStoreError::Internal(anyhow::anyhow!(
                "flush worker not started"
            )));
        };
        worker
            .submit(FlushTask::FlushMap {
                map_name: map.to_string(),
            })
            .await?;
        Ok(())
    }

    #[must_use]
    pub fn stats(&self, map: &str) -> Option<LocalMapStatsSnapshot> {
        self.containers.get(map).map(|c| c.stats().snapshot())
    }

    // --- Lifecycle ---

    /// Flushes all pending writes, destroys every record store, and runs
    /// each map's backend `destroy` hook once.
    ///
    /// # Errors
    ///
    /// Returns the first backend `destroy` error.
    pub async fn shutdown(&self) -> MapStoreResult<()> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let timeout = self.config.shutdown_flush_timeout();
        for entry in self.stores.iter() {
            entry.value().close(true);
        }

        let worker = self.flush_worker.lock().await.take();
        let flushed = match worker {
            Some(mut worker) => tokio::time::timeout(timeout, async move {
                worker.stop().await;
            })
            .await
            .is_ok(),
            None => {
                let scheduler = FlushScheduler::new(Arc::clone(&self.stores));
                tokio::time::timeout(timeout, scheduler.flush_all(|_| true))
                    .await
                    .is_ok()
            }
        };
        if !flushed {
            tracing::warn!(?timeout, "final flush timed out; unflushed entries are lost");
        }

        let stores: Vec<Arc<dyn RecordStore>> = self.stores.iter().map(|e| Arc::clone(e.value())).collect();
        self.stores.clear();
        for store in stores {
            store.destroy(true);
        }

        let containers: Vec<Arc<MapContainer>> = self.containers.iter().map(|e| Arc::clone(e.value())).collect();
        let mut first_error = None;
        for container in containers {
            if let Err(e) = container.destroy().await {
                tracing::warn!(map = %container.name(), error = %e, "backend destroy failed");
                first_error.get_or_insert(e);
            }
        }
        tracing::info!(node_id = %self.config.node_id, "map service stopped");
        first_error.map_or(Ok(()), Err)
    }
}
