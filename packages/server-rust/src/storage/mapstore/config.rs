//! Per-map MapStore configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{MapStoreError, MapStoreResult};
use crate::traits::{Capabilities, MapStore};

/// When the initial bulk load gates map operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitialLoadMode {
    /// Every operation on a partition waits until its initial load finished.
    Eager,
    /// Keyed operations proceed immediately; only whole-map aggregates wait.
    #[default]
    Lazy,
}

/// What happens to an entry's due time when a newer mutation replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DueTimePolicy {
    /// Keep the first mutation's due time so a hot key is still persisted
    /// within one write delay of its first unflushed change.
    #[default]
    KeepOriginal,
    /// Restart the write delay on every mutation.
    Refresh,
}

/// Exponential backoff for re-queued write-behind entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Delay after the first failure.
    pub base_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(64),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based): `min(base * 2^attempt, max)`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        // 2^30 * base is far beyond any sane max_backoff
        const MAX_ATTEMPT: u32 = 30;
        let power = 2u32.saturating_pow(attempt.min(MAX_ATTEMPT));
        self.base_backoff
            .checked_mul(power)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Configuration of the persistence backend attached to one map.
#[derive(Clone)]
pub struct MapStoreConfig {
    /// Disabled configurations behave as if no backend were attached.
    pub enabled: bool,
    /// 0 selects write-through; a positive value selects write-behind with
    /// that delay. Negative values are rejected by [`validate`](Self::validate).
    pub write_delay_seconds: i64,
    pub initial_load_mode: InitialLoadMode,
    /// Maximum number of keys handed to a single `load_all` during the
    /// initial load.
    pub load_chunk_size: usize,
    pub due_time_policy: DueTimePolicy,
    pub retry: RetryConfig,
    /// Passed to the backend's `init` hook.
    pub properties: BTreeMap<String, String>,
    pub implementation: Option<Arc<dyn MapStore>>,
}

impl Default for MapStoreConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            write_delay_seconds: 0,
            initial_load_mode: InitialLoadMode::default(),
            load_chunk_size: 1000,
            due_time_policy: DueTimePolicy::default(),
            retry: RetryConfig::default(),
            properties: BTreeMap::new(),
            implementation: None,
        }
    }
}

impl fmt::Debug for MapStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapStoreConfig")
            .field("enabled", &self.enabled)
            .field("write_delay_seconds", &self.write_delay_seconds)
            .field("initial_load_mode", &self.initial_load_mode)
            .field("load_chunk_size", &self.load_chunk_size)
            .field("due_time_policy", &self.due_time_policy)
            .field("retry", &self.retry)
            .field("properties", &self.properties)
            .field("implementation", &self.implementation.is_some())
            .finish()
    }
}

impl MapStoreConfig {
    /// Enabled configuration around the given backend, write-through, lazy.
    #[must_use]
    pub fn with_store(store: Arc<dyn MapStore>) -> Self {
        Self {
            enabled: true,
            implementation: Some(store),
            ..Self::default()
        }
    }

    /// Sets the write delay in seconds.
    #[must_use]
    pub fn write_delay_seconds(mut self, seconds: i64) -> Self {
        self.write_delay_seconds = seconds;
        self
    }

    /// Sets the initial load mode.
    #[must_use]
    pub fn initial_load_mode(mut self, mode: InitialLoadMode) -> Self {
        self.initial_load_mode = mode;
        self
    }

    /// Sets the initial load chunk size.
    #[must_use]
    pub fn load_chunk_size(mut self, size: usize) -> Self {
        self.load_chunk_size = size;
        self
    }

    /// Sets the due time policy for coalesced entries.
    #[must_use]
    pub fn due_time_policy(mut self, policy: DueTimePolicy) -> Self {
        self.due_time_policy = policy;
        self
    }

    /// The backend, if this configuration is enabled and has one.
    #[must_use]
    pub fn active_store(&self) -> Option<&Arc<dyn MapStore>> {
        if self.enabled {
            self.implementation.as_ref()
        } else {
            None
        }
    }

    /// Write delay as a duration. Negative values clamp to zero.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn write_delay(&self) -> Duration {
        Duration::from_secs(self.write_delay_seconds.max(0) as u64)
    }

    /// Whether writes are deferred to the write-behind queue.
    #[must_use]
    pub fn is_write_behind(&self) -> bool {
        self.write_delay_seconds > 0
    }

    /// Validates the configuration against the backend's declared capabilities.
    ///
    /// Returns the capabilities in effect ([`Capabilities::NONE`] when no
    /// backend is active).
    ///
    /// # Errors
    ///
    /// Returns [`MapStoreError::Configuration`] when the settings are invalid
    /// or the backend's capabilities cannot serve them.
    pub fn validate(&self) -> MapStoreResult<Capabilities> {
        if self.write_delay_seconds < 0 {
            return Err(MapStoreError::Configuration(format!(
                "write_delay_seconds must not be negative, got {}",
                self.write_delay_seconds
            )));
        }
        if self.load_chunk_size == 0 {
            return Err(MapStoreError::Configuration(
                "load_chunk_size must be positive".to_string(),
            ));
        }
        if self.retry.base_backoff.is_zero() || self.retry.base_backoff > self.retry.max_backoff {
            return Err(MapStoreError::Configuration(format!(
                "retry backoff must satisfy 0 < base ({:?}) <= max ({:?})",
                self.retry.base_backoff, self.retry.max_backoff
            )));
        }

        let Some(store) = self.active_store() else {
            if self.enabled {
                return Err(MapStoreError::Configuration(
                    "map store is enabled but no implementation is configured".to_string(),
                ));
            }
            return Ok(Capabilities::NONE);
        };

        let caps = store.capabilities();
        if !caps.loader && !caps.store {
            return Err(MapStoreError::Configuration(
                "backend implements neither loading nor storing".to_string(),
            ));
        }
        if caps.load_all_keys && !caps.loader {
            return Err(MapStoreError::Configuration(
                "backend enumerates keys but cannot load them".to_string(),
            ));
        }
        if caps.post_processing && !caps.store {
            return Err(MapStoreError::Configuration(
                "post-processing requires a store-capable backend".to_string(),
            ));
        }
        if self.is_write_behind() && !caps.store {
            return Err(MapStoreError::Configuration(format!(
                "write-behind (write_delay_seconds = {}) requires a store-capable backend",
                self.write_delay_seconds
            )));
        }
        Ok(caps)
    }
}
