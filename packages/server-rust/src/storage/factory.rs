//! Factory for creating fully-wired [`RecordStore`] instances.
//!
//! [`RecordStoreFactory`] is the dependency injection point that creates
//! [`DefaultRecordStore`] instances: a fresh [`StorageEngine`] per store
//! (by default [`HashMapStorage`]) connected to the map's shared
//! [`MapContainer`].

use std::sync::Arc;

use crate::storage::engine::StorageEngine;
use crate::storage::engines::HashMapStorage;
use crate::storage::impls::DefaultRecordStore;
use crate::storage::map_container::MapContainer;
use crate::storage::record_store::RecordStore;

type EngineBuilder = Arc<dyn Fn() -> Box<dyn StorageEngine> + Send + Sync>;

/// Creates one [`RecordStore`] per `(map, partition)` activation.
#[derive(Clone)]
pub struct RecordStoreFactory {
    engine: EngineBuilder,
}

impl RecordStoreFactory {
    /// Factory backed by [`HashMapStorage`] engines.
    #[must_use]
    pub fn new() -> Self {
        Self::with_engine(|| Box::new(HashMapStorage::new()))
    }

    /// Factory using a custom storage engine for every store.
    #[must_use]
    pub fn with_engine(engine: impl Fn() -> Box<dyn StorageEngine> + Send + Sync + 'static) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }

    /// Creates a [`RecordStore`] for `partition_id` of the container's map.
    #[must_use]
    pub fn create(&self, container: &Arc<MapContainer>, partition_id: u32) -> Arc<dyn RecordStore> {
        Arc::new(DefaultRecordStore::new(
            partition_id,
            (self.engine)(),
            Arc::clone(container),
        ))
    }
}

impl Default for RecordStoreFactory {
    fn default() -> Self {
        Self::new()
    }
}
