//! Write-behind flushing on the background worker.
//!
//! [`FlushScheduler`] is the [`BackgroundRunnable`] behind the node's flush
//! worker. Each tick it flushes the due entries of every record store with
//! pending writes; [`FlushTask`]s request an immediate full flush of one map
//! or of everything, and worker shutdown runs a final full flush.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::service::worker::BackgroundRunnable;
use crate::storage::record::now_millis;
use crate::storage::record_store::{RecordStore, RecordStoreKey};

/// Live record stores of the node, keyed by `(map_name, partition_id)`.
pub type RecordStoreRegistry = Arc<DashMap<RecordStoreKey, Arc<dyn RecordStore>>>;

/// On-demand flush requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushTask {
    /// Flush every pending entry of one map, due or not.
    FlushMap { map_name: String },
    /// Flush every pending entry of every map.
    FlushAll,
}

pub struct FlushScheduler {
    stores: RecordStoreRegistry,
}

impl FlushScheduler {
    #[must_use]
    pub fn new(stores: RecordStoreRegistry) -> Self {
        Self { stores }
    }

    /// Record stores with pending entries. Registry guards are released
    /// before any flush is awaited.
    fn pending_stores(&self, filter: impl Fn(&RecordStoreKey) -> bool) -> Vec<Arc<dyn RecordStore>> {
        self.stores
            .iter()
            .filter(|entry| filter(entry.key()) && entry.value().pending_count() > 0)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Flushes entries due at `now` across all stores. Returns the number of
    /// entries confirmed by the backend.
    pub async fn flush_due(&self, now: i64) -> usize {
        let mut flushed = 0;
        for store in self.pending_stores(|_| true) {
            match store.flush_due(now).await {
                Ok(n) => flushed += n,
                Err(e) => tracing::warn!(
                    map = %store.name(),
                    partition_id = store.partition_id(),
                    pending = store.pending_count(),
                    error = %e,
                    "write-behind flush failed; entries re-queued"
                ),
            }
        }
        flushed
    }

    /// Flushes every pending entry of the stores selected by `filter`.
    pub async fn flush_all(&self, filter: impl Fn(&RecordStoreKey) -> bool) -> usize {
        let mut flushed = 0;
        for store in self.pending_stores(filter) {
            match store.flush().await {
                Ok(n) => flushed += n,
                Err(e) => tracing::warn!(
                    map = %store.name(),
                    partition_id = store.partition_id(),
                    error = %e,
                    "forced flush failed; entries re-queued"
                ),
            }
        }
        flushed
    }
}

#[async_trait]
impl BackgroundRunnable for FlushScheduler {
    type Task = FlushTask;

    async fn run(&mut self, task: FlushTask) {
        let flushed = match &task {
            FlushTask::FlushMap { map_name } => self.flush_all(|(name, _)| name == map_name).await,
            FlushTask::FlushAll => self.flush_all(|_| true).await,
        };
        tracing::debug!(?task, flushed, "flush task finished");
    }

    async fn on_tick(&mut self) {
        self.flush_due(now_millis()).await;
    }

    async fn shutdown(&mut self) {
        let flushed = self.flush_all(|_| true).await;
        tracing::info!(flushed, "final write-behind flush finished");
    }
}
