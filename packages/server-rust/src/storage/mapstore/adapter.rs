//! Uniform facade over a user-supplied [`MapStore`].
//!
//! The adapter resolves the backend's capabilities once, normalizes loader
//! results (null maps and null values mean "absent"), picks single-key or
//! batch calls, guards against duplicate store issuance, and wraps every
//! failure in [`MapStoreError::Backend`].

use std::collections::HashMap;
use std::sync::Arc;

use harbor_core::Value;
use parking_lot::Mutex;

use super::stats::LocalMapStats;
use super::write_behind::{WriteBehindEntry, WriteOperation};
use crate::error::{BackendOperation, MapStoreError, MapStoreResult};
use crate::traits::{Capabilities, MapStore, MapStoreContext};

/// Backend confirmation for one flushed entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmedEntry {
    pub key: String,
    pub record_version: u64,
    pub is_delete: bool,
    /// Value as rewritten by a post-processing backend.
    pub merged: Option<Value>,
}

/// Result of a successful [`BackendAdapter::flush_batch`].
#[derive(Debug, Default)]
pub struct FlushOutcome {
    pub confirmed: Vec<ConfirmedEntry>,
    /// Entries skipped because the same or a newer generation of the key
    /// was already being written.
    pub suppressed: usize,
}

/// Keys a batch claimed in the in-flight guard; released on drop, so a
/// failed or cancelled write frees them too.
struct InFlightClaim<'a> {
    in_flight: &'a Mutex<HashMap<String, u64>>,
    claimed: Vec<(String, u64)>,
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock();
        for (key, sequence) in &self.claimed {
            if in_flight.get(key) == Some(sequence) {
                in_flight.remove(key);
            }
        }
    }
}

pub struct BackendAdapter {
    map_name: String,
    store: Option<Arc<dyn MapStore>>,
    capabilities: Capabilities,
    stats: Arc<LocalMapStats>,
    /// Sequence currently being written, per key. Only keys of batches in
    /// flight are present.
    in_flight: Mutex<HashMap<String, u64>>,
}

impl BackendAdapter {
    /// Wraps `store` with the capabilities validated at activation.
    #[must_use]
    pub fn new(
        map_name: impl Into<String>,
        store: Option<Arc<dyn MapStore>>,
        capabilities: Capabilities,
        stats: Arc<LocalMapStats>,
    ) -> Self {
        Self {
            map_name: map_name.into(),
            store,
            capabilities,
            stats,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// An adapter for a map without a backend.
    #[must_use]
    pub fn disabled(map_name: impl Into<String>, stats: Arc<LocalMapStats>) -> Self {
        Self::new(map_name, None, Capabilities::NONE, stats)
    }

    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    #[must_use]
    pub fn can_load(&self) -> bool {
        self.store.is_some() && self.capabilities.loader
    }

    #[must_use]
    pub fn can_store(&self) -> bool {
        self.store.is_some() && self.capabilities.store
    }

    #[must_use]
    pub fn can_enumerate_keys(&self) -> bool {
        self.can_load() && self.capabilities.load_all_keys
    }

    fn fail(&self, operation: BackendOperation, source: anyhow::Error) -> MapStoreError {
        self.stats.record_failure(operation);
        tracing::warn!(
            map = %self.map_name,
            operation = %operation,
            error = %source,
            "backend call failed"
        );
        MapStoreError::Backend {
            map: self.map_name.clone(),
            operation,
            source,
        }
    }

    /// Calls the backend's `init` hook if it declared lifecycle support.
    ///
    /// # Errors
    ///
    /// Returns [`MapStoreError::Backend`] if the hook fails.
    pub async fn init(&self, ctx: &MapStoreContext) -> MapStoreResult<()> {
        match &self.store {
            Some(store) if self.capabilities.lifecycle => store
                .init(ctx)
                .await
                .map_err(|e| self.fail(BackendOperation::Init, e)),
            _ => Ok(()),
        }
    }

    /// Calls the backend's `destroy` hook if it declared lifecycle support.
    ///
    /// # Errors
    ///
    /// Returns [`MapStoreError::Backend`] if the hook fails.
    pub async fn destroy(&self) -> MapStoreResult<()> {
        match &self.store {
            Some(store) if self.capabilities.lifecycle => store
                .destroy()
                .await
                .map_err(|e| self.fail(BackendOperation::Destroy, e)),
            _ => Ok(()),
        }
    }

    /// Loads one key. A `Null` value counts as absent.
    ///
    /// # Errors
    ///
    /// Returns [`MapStoreError::Backend`] if the backend fails.
    pub async fn load(&self, key: &str) -> MapStoreResult<Option<Value>> {
        let Some(store) = self.store.as_ref().filter(|_| self.capabilities.loader) else {
            return Ok(None);
        };
        let loaded = store
            .load(key)
            .await
            .map_err(|e| self.fail(BackendOperation::Load, e))?
            .filter(|v| !matches!(v, Value::Null));
        self.stats.record_load(loaded.is_some());
        Ok(loaded)
    }

    /// Loads several keys with a single `load_all` call.
    ///
    /// The result only contains requested keys with non-null values. A
    /// backend returning no map at all yields an empty result.
    ///
    /// # Errors
    ///
    /// Returns [`MapStoreError::Backend`] if the backend fails.
    pub async fn load_all(&self, keys: &[String]) -> MapStoreResult<HashMap<String, Value>> {
        let Some(store) = self.store.as_ref().filter(|_| self.capabilities.loader) else {
            return Ok(HashMap::new());
        };
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let mut raw = store
            .load_all(keys)
            .await
            .map_err(|e| self.fail(BackendOperation::LoadAll, e))?
            .unwrap_or_default();

        let mut loaded = HashMap::with_capacity(raw.len().min(keys.len()));
        for key in keys {
            if let Some(value) = raw.remove(key) {
                if !matches!(value, Value::Null) {
                    loaded.insert(key.clone(), value);
                }
            }
        }
        self.stats.record_load_all(loaded.len() as u64);
        Ok(loaded)
    }

    /// Enumerates the backend keyset. `None` when unsupported or declined.
    ///
    /// # Errors
    ///
    /// Returns [`MapStoreError::Backend`] if the backend fails.
    pub async fn load_all_keys(&self) -> MapStoreResult<Option<Vec<String>>> {
        let Some(store) = self.store.as_ref().filter(|_| self.can_enumerate_keys()) else {
            return Ok(None);
        };
        store
            .load_all_keys()
            .await
            .map_err(|e| self.fail(BackendOperation::LoadAllKeys, e))
    }

    /// Deletes a whole keyset with one `delete_all` call.
    ///
    /// # Errors
    ///
    /// Returns [`MapStoreError::Backend`] if the backend fails.
    pub async fn delete_all(&self, keys: &[String]) -> MapStoreResult<()> {
        let Some(store) = self.store.as_ref().filter(|_| self.capabilities.store) else {
            return Ok(());
        };
        if keys.is_empty() {
            return Ok(());
        }
        store
            .delete_all(keys)
            .await
            .map_err(|e| self.fail(BackendOperation::DeleteAll, e))?;
        self.stats.record_delete(keys.len() as u64);
        Ok(())
    }

    /// Writes a batch of queue entries to the backend.
    ///
    /// Stores go out first, then deletes; a batch holds at most one entry
    /// per key so per-key order is preserved. A one-entry group uses the
    /// single-key call, larger groups use the batch call. An entry whose key
    /// is already being written at the same or a newer sequence is logged
    /// and suppressed.
    ///
    /// # Errors
    ///
    /// Returns [`MapStoreError::Backend`] for the first failing call.
    pub async fn flush_batch(&self, entries: &[WriteBehindEntry]) -> MapStoreResult<FlushOutcome> {
        let Some(store) = self.store.as_ref().filter(|_| self.capabilities.store) else {
            // Nothing to persist to; treat as confirmed.
            return Ok(FlushOutcome {
                confirmed: entries.iter().map(confirm_unchanged).collect(),
                suppressed: 0,
            });
        };

        let mut stores: Vec<(String, Value)> = Vec::new();
        let mut store_versions: Vec<u64> = Vec::new();
        let mut deletes: Vec<String> = Vec::new();
        let mut delete_versions: Vec<u64> = Vec::new();
        let mut claim = InFlightClaim {
            in_flight: &self.in_flight,
            claimed: Vec::with_capacity(entries.len()),
        };
        let mut suppressed = 0;

        {
            let mut in_flight = self.in_flight.lock();
            for entry in entries {
                if let Some(&writing) = in_flight.get(&entry.key) {
                    if entry.sequence <= writing {
                        tracing::error!(
                            map = %self.map_name,
                            key = %entry.key,
                            sequence = entry.sequence,
                            in_flight = writing,
                            delete = entry.is_delete(),
                            "duplicate write suppressed"
                        );
                        self.stats.record_suppressed_duplicate();
                        suppressed += 1;
                        continue;
                    }
                }
                in_flight.insert(entry.key.clone(), entry.sequence);
                claim.claimed.push((entry.key.clone(), entry.sequence));
                match &entry.operation {
                    WriteOperation::Store(value) => {
                        stores.push((entry.key.clone(), value.clone()));
                        store_versions.push(entry.record_version);
                    }
                    WriteOperation::Delete => {
                        deletes.push(entry.key.clone());
                        delete_versions.push(entry.record_version);
                    }
                }
            }
        }

        let result = self.write(store.as_ref(), &mut stores, &deletes).await;
        drop(claim);
        result?;

        let post_processing = self.capabilities.post_processing;
        let mut confirmed = Vec::with_capacity(stores.len() + deletes.len());
        for ((key, value), record_version) in stores.into_iter().zip(store_versions) {
            confirmed.push(ConfirmedEntry {
                key,
                record_version,
                is_delete: false,
                merged: post_processing.then_some(value),
            });
        }
        for (key, record_version) in deletes.into_iter().zip(delete_versions) {
            confirmed.push(ConfirmedEntry {
                key,
                record_version,
                is_delete: true,
                merged: None,
            });
        }
        Ok(FlushOutcome {
            confirmed,
            suppressed,
        })
    }

    async fn write(
        &self,
        store: &dyn MapStore,
        stores: &mut [(String, Value)],
        deletes: &[String],
    ) -> MapStoreResult<()> {
        match &mut *stores {
            [] => {}
            [(key, value)] => store
                .store(key, value)
                .await
                .map_err(|e| self.fail(BackendOperation::Store, e))?,
            batch => store
                .store_all(batch)
                .await
                .map_err(|e| self.fail(BackendOperation::StoreAll, e))?,
        }
        if !stores.is_empty() {
            self.stats.record_store(stores.len() as u64);
        }

        match deletes {
            [] => {}
            [key] => store
                .delete(key)
                .await
                .map_err(|e| self.fail(BackendOperation::Delete, e))?,
            batch => store
                .delete_all(batch)
                .await
                .map_err(|e| self.fail(BackendOperation::DeleteAll, e))?,
        }
        if !deletes.is_empty() {
            self.stats.record_delete(deletes.len() as u64);
        }
        Ok(())
    }
}

fn confirm_unchanged(entry: &WriteBehindEntry) -> ConfirmedEntry {
    ConfirmedEntry {
        key: entry.key.clone(),
        record_version: entry.record_version,
        is_delete: entry.is_delete(),
        merged: None,
    }
}
