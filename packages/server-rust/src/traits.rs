use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use harbor_core::Value;

/// Capability set a backend declares once, at activation.
///
/// The [`BackendAdapter`](crate::storage::mapstore::BackendAdapter) gates
/// every call site on these flags instead of probing the backend at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct Capabilities {
    /// `load` / `load_all` are implemented.
    pub loader: bool,
    /// `load_all_keys` enumerates the backend keyset (enables bulk preload).
    pub load_all_keys: bool,
    /// `store` / `store_all` / `delete` / `delete_all` are implemented.
    pub store: bool,
    /// `init` / `destroy` lifecycle hooks should be called.
    pub lifecycle: bool,
    /// The backend may rewrite values handed to `store`/`store_all`; the
    /// rewritten value is merged back into the in-memory record.
    pub post_processing: bool,
}

impl Capabilities {
    /// No capabilities: the map has no backend.
    pub const NONE: Self = Self {
        loader: false,
        load_all_keys: false,
        store: false,
        lifecycle: false,
        post_processing: false,
    };

    /// Read-only loader with keyset enumeration.
    pub const LOADER: Self = Self {
        loader: true,
        load_all_keys: true,
        store: false,
        lifecycle: false,
        post_processing: false,
    };

    /// Full loader + store with keyset enumeration.
    pub const FULL: Self = Self {
        loader: true,
        load_all_keys: true,
        store: true,
        lifecycle: false,
        post_processing: false,
    };

    /// Returns a copy with the lifecycle flag set.
    #[must_use]
    pub const fn with_lifecycle(mut self) -> Self {
        self.lifecycle = true;
        self
    }

    /// Returns a copy with the post-processing flag set.
    #[must_use]
    pub const fn with_post_processing(mut self) -> Self {
        self.post_processing = true;
        self
    }

    /// Returns a copy with keyset enumeration disabled (lazy-only loading).
    #[must_use]
    pub const fn without_load_all_keys(mut self) -> Self {
        self.load_all_keys = false;
        self
    }
}

/// Context handed to [`MapStore::init`].
#[derive(Debug, Clone, Default)]
pub struct MapStoreContext {
    /// Name of the map this backend serves.
    pub map_name: String,
    /// Identifier of the local node.
    pub node_id: String,
    /// Free-form properties from the map store configuration.
    pub properties: BTreeMap<String, String>,
}

/// User-supplied persistence backend for one map.
///
/// Implementations only override the methods their [`Capabilities`] declare.
/// Every call goes through the `BackendAdapter`, which normalizes results,
/// deduplicates stores, and wraps failures.
///
/// Used as `Arc<dyn MapStore>`.
#[async_trait]
pub trait MapStore: Send + Sync {
    /// Declares which operations this backend supports.
    fn capabilities(&self) -> Capabilities;

    /// One-time initialization, called once per map on first activation.
    async fn init(&self, _ctx: &MapStoreContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release resources; called once per map at shutdown.
    async fn destroy(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Load a single value. `None` if the key does not exist.
    async fn load(&self, _key: &str) -> anyhow::Result<Option<Value>> {
        Ok(None)
    }

    /// Load several values. Missing keys are simply absent from the result.
    ///
    /// Returning `Ok(None)` is allowed and treated as an empty result.
    async fn load_all(&self, keys: &[String]) -> anyhow::Result<Option<HashMap<String, Value>>> {
        let mut loaded = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.load(key).await? {
                loaded.insert(key.clone(), value);
            }
        }
        Ok(Some(loaded))
    }

    /// Enumerate every key in the backend. `None` disables bulk preloading.
    async fn load_all_keys(&self) -> anyhow::Result<Option<Vec<String>>> {
        Ok(None)
    }

    /// Store a single value. Post-processing backends may rewrite `value`.
    async fn store(&self, _key: &str, _value: &mut Value) -> anyhow::Result<()> {
        Ok(())
    }

    /// Store a batch. Post-processing backends may rewrite values in place.
    async fn store_all(&self, entries: &mut [(String, Value)]) -> anyhow::Result<()> {
        for (key, value) in entries.iter_mut() {
            self.store(key, value).await?;
        }
        Ok(())
    }

    /// Delete a single key.
    async fn delete(&self, _key: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Delete a batch of keys.
    async fn delete_all(&self, keys: &[String]) -> anyhow::Result<()> {
        for key in keys {
            self.delete(key).await?;
        }
        Ok(())
    }
}
