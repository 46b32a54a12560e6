//! Initial bulk load for one partition.
//!
//! The loader enumerates the backend keyset once, keeps only keys routed to
//! its partition, and fetches them in fixed-size `load_all` chunks. Loaded
//! values go through a [`LoadSink`], which decides whether a value may still
//! be applied (a concurrent caller mutation always wins).

use std::collections::BTreeSet;
use std::sync::Arc;

use harbor_core::{partition_for_key, Value};

use super::adapter::BackendAdapter;

/// Receiver of initial-load results, implemented by record stores.
pub trait LoadSink: Send + Sync {
    /// Offers a loaded value. Returns `true` if it was applied.
    fn apply_loaded(&self, key: &str, value: Value) -> bool;

    /// The bulk load proved `key` absent from the backend.
    fn mark_absent(&self, key: &str);
}

/// Summary of one initial load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Keys owned by this partition according to `load_all_keys`.
    pub owned_keys: usize,
    pub chunks: usize,
    pub failed_chunks: usize,
    /// Values applied to the record store.
    pub applied: usize,
    /// Values dropped because the key was mutated concurrently.
    pub skipped: usize,
    /// Enumerated keys the backend did not return on `load_all`.
    pub absent: usize,
    /// `false` when the backend could not or would not enumerate keys.
    pub enumerated: bool,
}

pub struct InitialLoader {
    map_name: String,
    adapter: Arc<BackendAdapter>,
    partition_id: u32,
    partition_count: u32,
    chunk_size: usize,
}

impl InitialLoader {
    #[must_use]
    pub fn new(
        map_name: impl Into<String>,
        adapter: Arc<BackendAdapter>,
        partition_id: u32,
        partition_count: u32,
        chunk_size: usize,
    ) -> Self {
        Self {
            map_name: map_name.into(),
            adapter,
            partition_id,
            partition_count,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Keys from `all_keys` routed to this partition, deduplicated and sorted.
    #[must_use]
    pub fn owned_keys(&self, all_keys: Vec<String>) -> Vec<String> {
        all_keys
            .into_iter()
            .filter(|k| partition_for_key(k, self.partition_count) == self.partition_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Runs the bulk load to completion.
    ///
    /// Failures never abort the load: a failed keyset enumeration falls back
    /// to read-through loading, and a failed chunk leaves its keys to be
    /// loaded on demand.
    pub async fn run(&self, sink: &dyn LoadSink) -> LoadReport {
        let mut report = LoadReport::default();

        let all_keys = match self.adapter.load_all_keys().await {
            Ok(Some(keys)) => keys,
            Ok(None) => return report,
            Err(e) => {
                tracing::warn!(
                    map = %self.map_name,
                    partition_id = self.partition_id,
                    error = %e,
                    "key enumeration failed; falling back to lazy loading"
                );
                return report;
            }
        };
        report.enumerated = true;

        let keys = self.owned_keys(all_keys);
        report.owned_keys = keys.len();

        for chunk in keys.chunks(self.chunk_size) {
            report.chunks += 1;
            let mut loaded = match self.adapter.load_all(chunk).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    report.failed_chunks += 1;
                    tracing::warn!(
                        map = %self.map_name,
                        partition_id = self.partition_id,
                        chunk_len = chunk.len(),
                        error = %e,
                        "initial load chunk failed; keys stay lazily loadable"
                    );
                    continue;
                }
            };
            for key in chunk {
                match loaded.remove(key) {
                    Some(value) => {
                        if sink.apply_loaded(key, value) {
                            report.applied += 1;
                        } else {
                            report.skipped += 1;
                        }
                    }
                    None => {
                        sink.mark_absent(key);
                        report.absent += 1;
                    }
                }
            }
        }

        tracing::debug!(
            map = %self.map_name,
            partition_id = self.partition_id,
            applied = report.applied,
            chunks = report.chunks,
            failed_chunks = report.failed_chunks,
            "initial load finished"
        );
        report
    }
}
