//! MapStore integration: configuration, the backend adapter, the
//! write-behind queue and its flusher, the initial loader, and statistics.

pub mod adapter;
pub mod config;
pub mod flush;
pub mod loader;
pub mod stats;
pub mod write_behind;

pub use adapter::{BackendAdapter, ConfirmedEntry, FlushOutcome};
pub use config::{DueTimePolicy, InitialLoadMode, MapStoreConfig, RetryConfig};
pub use flush::{FlushScheduler, FlushTask, RecordStoreRegistry};
pub use loader::{InitialLoader, LoadReport, LoadSink};
pub use stats::{LocalMapStats, LocalMapStatsSnapshot};
pub use write_behind::{SequenceGenerator, WriteBehindEntry, WriteBehindQueue, WriteOperation};
