//! Map-wide state shared by every record store of one map.
//!
//! A [`MapContainer`] is created on first activation of a map. It validates
//! the map store configuration, owns the [`BackendAdapter`], statistics, the
//! observer fan-out, and the sequence generator, and runs the backend's
//! `init`/`destroy` hooks exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::OnceCell;

use super::mapstore::{
    BackendAdapter, InitialLoadMode, InitialLoader, LocalMapStats, MapStoreConfig,
    SequenceGenerator, WriteBehindQueue,
};
use super::mutation_observer::{CompositeMutationObserver, MutationObserver};
use crate::error::{MapStoreError, MapStoreResult};
use crate::traits::MapStoreContext;

/// How mutations reach the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// No store-capable backend; mutations stay in memory.
    Disabled,
    /// Each mutation is stored synchronously before the call returns.
    WriteThrough,
    /// Mutations are queued and flushed after the write delay.
    WriteBehind,
}

pub struct MapContainer {
    name: String,
    node_id: String,
    partition_count: u32,
    config: MapStoreConfig,
    write_mode: WriteMode,
    adapter: Arc<BackendAdapter>,
    stats: Arc<LocalMapStats>,
    observer: Arc<CompositeMutationObserver>,
    sequencer: Arc<SequenceGenerator>,
    initialized: OnceCell<()>,
    destroyed: AtomicBool,
}

impl MapContainer {
    /// Validates `config` and builds the map-wide state.
    ///
    /// # Errors
    ///
    /// Returns [`MapStoreError::Configuration`] if the configuration is
    /// invalid or the backend's capabilities cannot serve it.
    pub fn new(
        name: impl Into<String>,
        node_id: impl Into<String>,
        partition_count: u32,
        config: MapStoreConfig,
        observers: Vec<Arc<dyn MutationObserver>>,
    ) -> MapStoreResult<Self> {
        let name = name.into();
        if partition_count == 0 {
            return Err(MapStoreError::Configuration(
                "partition_count must be positive".to_string(),
            ));
        }
        let capabilities = config.validate()?;
        let stats = Arc::new(LocalMapStats::new(name.clone()));
        let adapter = Arc::new(BackendAdapter::new(
            name.clone(),
            config.active_store().cloned(),
            capabilities,
            Arc::clone(&stats),
        ));

        let write_mode = if !adapter.can_store() {
            WriteMode::Disabled
        } else if config.is_write_behind() {
            WriteMode::WriteBehind
        } else {
            WriteMode::WriteThrough
        };

        Ok(Self {
            name,
            node_id: node_id.into(),
            partition_count,
            config,
            write_mode,
            adapter,
            stats,
            observer: Arc::new(CompositeMutationObserver::new(observers)),
            sequencer: Arc::new(SequenceGenerator::default()),
            initialized: OnceCell::new(),
            destroyed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    #[must_use]
    pub fn config(&self) -> &MapStoreConfig {
        &self.config
    }

    #[must_use]
    pub fn write_mode(&self) -> WriteMode {
        self.write_mode
    }

    #[must_use]
    pub fn initial_load_mode(&self) -> InitialLoadMode {
        self.config.initial_load_mode
    }

    #[must_use]
    pub fn adapter(&self) -> &Arc<BackendAdapter> {
        &self.adapter
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<LocalMapStats> {
        &self.stats
    }

    #[must_use]
    pub fn observer(&self) -> &CompositeMutationObserver {
        &self.observer
    }

    /// Next write generation for this map.
    #[must_use]
    pub fn next_version(&self) -> u64 {
        self.sequencer.next_sequence()
    }

    /// Empty write-behind queue for a new record store of this map.
    #[must_use]
    pub fn new_queue(&self) -> WriteBehindQueue {
        WriteBehindQueue::new(
            self.config.write_delay(),
            self.config.due_time_policy,
            Arc::clone(&self.sequencer),
        )
    }

    /// Initial loader for one partition of this map.
    #[must_use]
    pub fn new_loader(&self, partition_id: u32) -> InitialLoader {
        InitialLoader::new(
            self.name.clone(),
            Arc::clone(&self.adapter),
            partition_id,
            self.partition_count,
            self.config.load_chunk_size,
        )
    }

    /// Runs the backend `init` hook once; later calls return immediately.
    ///
    /// # Errors
    ///
    /// Returns [`MapStoreError::Backend`] if `init` fails. A failed `init`
    /// is retried by the next activation.
    pub async fn ensure_initialized(&self) -> MapStoreResult<()> {
        self.initialized
            .get_or_try_init(|| async {
                let ctx = MapStoreContext {
                    map_name: self.name.clone(),
                    node_id: self.node_id.clone(),
                    properties: self.config.properties.clone(),
                };
                self.adapter.init(&ctx).await?;
                tracing::info!(
                    map = %self.name,
                    write_mode = ?self.write_mode,
                    load_mode = ?self.config.initial_load_mode,
                    "map store activated"
                );
                Ok::<(), MapStoreError>(())
            })
            .await?;
        Ok(())
    }

    /// Runs the backend `destroy` hook once, if the map was ever initialized.
    ///
    /// # Errors
    ///
    /// Returns [`MapStoreError::Backend`] if `destroy` fails.
    pub async fn destroy(&self) -> MapStoreResult<()> {
        if self.initialized.get().is_none() || self.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.adapter.destroy().await
    }
}
