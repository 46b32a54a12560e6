//! In-memory [`MapStore`] backend.
//!
//! [`InMemoryMapStore`] keeps its "persistent" state in a `BTreeMap` and
//! records every call it receives. It backs the demo binary and the test
//! suites, and can be configured to fail, stall, hold loads until released,
//! post-process values, or return a null `load_all` result.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use harbor_core::Value;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::traits::{Capabilities, MapStore, MapStoreContext};

type PostProcessor = Arc<dyn Fn(&mut Value) + Send + Sync>;

/// Snapshot of how many times each backend method was called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackendCalls {
    pub load: usize,
    pub load_all: usize,
    pub load_all_keys: usize,
    pub store: usize,
    pub store_all: usize,
    pub delete: usize,
    pub delete_all: usize,
    pub init: usize,
    pub destroy: usize,
}

/// One write observed by the backend, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendWrite {
    Store { key: String, value: Value },
    Delete { key: String },
}

impl BackendWrite {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Store { key, .. } | Self::Delete { key } => key,
        }
    }
}

#[derive(Default)]
struct CallCounters {
    load: AtomicUsize,
    load_all: AtomicUsize,
    load_all_keys: AtomicUsize,
    store: AtomicUsize,
    store_all: AtomicUsize,
    delete: AtomicUsize,
    delete_all: AtomicUsize,
    init: AtomicUsize,
    destroy: AtomicUsize,
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Recording in-memory backend.
pub struct InMemoryMapStore {
    entries: Mutex<BTreeMap<String, Value>>,
    capabilities: Capabilities,
    calls: CallCounters,
    store_counts: Mutex<HashMap<String, usize>>,
    history: Mutex<Vec<BackendWrite>>,
    load_all_sizes: Mutex<Vec<usize>>,
    fail_writes: AtomicBool,
    fail_loads: AtomicBool,
    null_load_all: bool,
    write_latency: Option<Duration>,
    /// `false` holds `load`/`load_all` calls until the gate opens.
    load_gate: Option<watch::Sender<bool>>,
    post_processor: Option<PostProcessor>,
}

impl Default for InMemoryMapStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMapStore {
    /// Empty backend with loader, keyset enumeration, and store support.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            capabilities: Capabilities::FULL,
            calls: CallCounters::default(),
            store_counts: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
            load_all_sizes: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            fail_loads: AtomicBool::new(false),
            null_load_all: false,
            write_latency: None,
            load_gate: None,
            post_processor: None,
        }
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Declares lifecycle support so `init`/`destroy` are called.
    #[must_use]
    pub fn with_lifecycle(mut self) -> Self {
        self.capabilities = self.capabilities.with_lifecycle();
        self
    }

    /// Disables keyset enumeration; only read-through loading remains.
    #[must_use]
    pub fn without_key_enumeration(mut self) -> Self {
        self.capabilities = self.capabilities.without_load_all_keys();
        self
    }

    /// Rewrites every stored value with `f` and declares post-processing.
    #[must_use]
    pub fn with_post_processor(mut self, f: impl Fn(&mut Value) + Send + Sync + 'static) -> Self {
        self.capabilities = self.capabilities.with_post_processing();
        self.post_processor = Some(Arc::new(f));
        self
    }

    /// `load_all` returns `Ok(None)` instead of a map.
    #[must_use]
    pub fn with_null_load_all(mut self) -> Self {
        self.null_load_all = true;
        self
    }

    /// Every write call sleeps for `latency` before completing.
    #[must_use]
    pub fn with_write_latency(mut self, latency: Duration) -> Self {
        self.write_latency = Some(latency);
        self
    }

    /// `load` and `load_all` block until [`open_load_gate`](Self::open_load_gate).
    /// Calls are counted before they block.
    #[must_use]
    pub fn with_load_gate(mut self) -> Self {
        self.load_gate = Some(watch::channel(false).0);
        self
    }

    /// Releases every held and future load call.
    pub fn open_load_gate(&self) {
        if let Some(gate) = &self.load_gate {
            gate.send_replace(true);
        }
    }

    /// Inserts entries directly, bypassing call recording.
    pub fn seed<K: Into<String>>(&self, entries: impl IntoIterator<Item = (K, Value)>) {
        let mut map = self.entries.lock();
        for (key, value) in entries {
            map.insert(key.into(), value);
        }
    }

    /// Makes write calls fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    /// Makes load calls fail (or succeed again).
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::Release);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().get(key).cloned()
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// How many times `key` was written by `store` or `store_all`.
    #[must_use]
    pub fn store_count(&self, key: &str) -> usize {
        self.store_counts.lock().get(key).copied().unwrap_or(0)
    }

    /// Total number of stored entries across all store calls.
    #[must_use]
    pub fn stored_entry_count(&self) -> usize {
        self.store_counts.lock().values().sum()
    }

    /// Every write in arrival order.
    #[must_use]
    pub fn history(&self) -> Vec<BackendWrite> {
        self.history.lock().clone()
    }

    /// Number of keys requested by each `load_all` call, in order.
    #[must_use]
    pub fn load_all_sizes(&self) -> Vec<usize> {
        self.load_all_sizes.lock().clone()
    }

    #[must_use]
    pub fn calls(&self) -> BackendCalls {
        let c = &self.calls;
        BackendCalls {
            load: c.load.load(Ordering::Relaxed),
            load_all: c.load_all.load(Ordering::Relaxed),
            load_all_keys: c.load_all_keys.load(Ordering::Relaxed),
            store: c.store.load(Ordering::Relaxed),
            store_all: c.store_all.load(Ordering::Relaxed),
            delete: c.delete.load(Ordering::Relaxed),
            delete_all: c.delete_all.load(Ordering::Relaxed),
            init: c.init.load(Ordering::Relaxed),
            destroy: c.destroy.load(Ordering::Relaxed),
        }
    }

    async fn before_write(&self) -> anyhow::Result<()> {
        if let Some(latency) = self.write_latency {
            tokio::time::sleep(latency).await;
        }
        if self.fail_writes.load(Ordering::Acquire) {
            anyhow::bail!("backend unavailable");
        }
        Ok(())
    }

    async fn pass_load_gate(&self) {
        if let Some(gate) = &self.load_gate {
            let mut open = gate.subscribe();
            // The sender lives in `self`, so the channel cannot close here.
            let _ = open.wait_for(|open| *open).await;
        }
    }

    fn check_loads(&self) -> anyhow::Result<()> {
        if self.fail_loads.load(Ordering::Acquire) {
            anyhow::bail!("backend unavailable");
        }
        Ok(())
    }

    fn apply_store(&self, key: &str, value: &mut Value) {
        if let Some(post) = &self.post_processor {
            post(value);
        }
        self.entries.lock().insert(key.to_string(), value.clone());
        *self.store_counts.lock().entry(key.to_string()).or_default() += 1;
        self.history.lock().push(BackendWrite::Store {
            key: key.to_string(),
            value: value.clone(),
        });
    }

    fn apply_delete(&self, key: &str) {
        self.entries.lock().remove(key);
        self.history.lock().push(BackendWrite::Delete {
            key: key.to_string(),
        });
    }
}

#[async_trait]
impl MapStore for InMemoryMapStore {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn init(&self, _ctx: &MapStoreContext) -> anyhow::Result<()> {
        bump(&self.calls.init);
        Ok(())
    }

    async fn destroy(&self) -> anyhow::Result<()> {
        bump(&self.calls.destroy);
        Ok(())
    }

    async fn load(&self, key: &str) -> anyhow::Result<Option<Value>> {
        bump(&self.calls.load);
        self.pass_load_gate().await;
        self.check_loads()?;
        Ok(self.get(key))
    }

    async fn load_all(&self, keys: &[String]) -> anyhow::Result<Option<HashMap<String, Value>>> {
        bump(&self.calls.load_all);
        self.load_all_sizes.lock().push(keys.len());
        self.pass_load_gate().await;
        self.check_loads()?;
        if self.null_load_all {
            return Ok(None);
        }
        let map = self.entries.lock();
        Ok(Some(
            keys.iter()
                .filter_map(|k| map.get(k).map(|v| (k.clone(), v.clone())))
                .collect(),
        ))
    }

    async fn load_all_keys(&self) -> anyhow::Result<Option<Vec<String>>> {
        bump(&self.calls.load_all_keys);
        self.check_loads()?;
        Ok(Some(self.entries.lock().keys().cloned().collect()))
    }

    async fn store(&self, key: &str, value: &mut Value) -> anyhow::Result<()> {
        bump(&self.calls.store);
        self.before_write().await?;
        self.apply_store(key, value);
        Ok(())
    }

    async fn store_all(&self, entries: &mut [(String, Value)]) -> anyhow::Result<()> {
        bump(&self.calls.store_all);
        self.before_write().await?;
        for (key, value) in entries.iter_mut() {
            self.apply_store(key, value);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        bump(&self.calls.delete);
        self.before_write().await?;
        self.apply_delete(key);
        Ok(())
    }

    async fn delete_all(&self, keys: &[String]) -> anyhow::Result<()> {
        bump(&self.calls.delete_all);
        self.before_write().await?;
        for key in keys {
            self.apply_delete(key);
        }
        Ok(())
    }
}
