use std::time::Duration;

use harbor_core::DEFAULT_PARTITION_COUNT;

/// Node-level configuration shared by every map.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Unique identifier for this server node.
    pub node_id: String,
    /// Number of partitions. Configurable for testing; defaults to
    /// `harbor_core::DEFAULT_PARTITION_COUNT` (271) in production.
    pub partition_count: u32,
    /// Interval between write-behind flush ticks in milliseconds.
    pub flush_interval_ms: u64,
    /// Upper bound on the final flush during shutdown in milliseconds.
    pub shutdown_flush_timeout_ms: u64,
}

impl ServerConfig {
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    #[must_use]
    pub fn shutdown_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_flush_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            partition_count: DEFAULT_PARTITION_COUNT,
            flush_interval_ms: 1_000,
            shutdown_flush_timeout_ms: 30_000,
        }
    }
}
