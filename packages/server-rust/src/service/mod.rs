//! Node-level services.
//!
//! - **Configuration** (`config`): node identity, partition count, flush cadence
//! - **Background workers** (`worker`): periodic and on-demand tasks (write-behind flushing)

pub mod config;
pub mod worker;

pub use config::ServerConfig;
pub use worker::{BackgroundRunnable, BackgroundWorker};
