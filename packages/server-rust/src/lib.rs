//! Harbor Server: partitioned in-memory maps backed by pluggable persistent
//! stores, with read-through loading, write-through and write-behind
//! persistence, and eager or lazy initial loading.

pub mod error;
pub mod service;
pub mod storage;
pub mod traits;

pub use error::{MapStoreError, MapStoreResult};
pub use service::ServerConfig;
pub use storage::mapstore::{InitialLoadMode, MapStoreConfig};
pub use storage::{MapProxy, MapService};
pub use traits::{Capabilities, MapStore, MapStoreContext};
