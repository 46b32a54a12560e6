//! Storage layers for the Harbor server.
//!
//! - **Layer 1** ([`StorageEngine`]): low-level in-memory key-value storage
//! - **Layer 2** ([`RecordStore`]): per-map-per-partition orchestration of
//!   memory and the persistence backend
//! - **Layer 3** ([`mapstore`]): backend adapter, write-behind queue and
//!   flusher, initial loader
//!
//! [`MapService`] activates record stores per owned partition and
//! [`MapProxy`] is the map-level facade over them. [`MutationObserver`]
//! reacts to record mutations; [`CompositeMutationObserver`] fans out to
//! several observers.

pub mod datastores;
pub mod engine;
pub mod engines;
pub mod factory;
pub mod impls;
pub mod map_container;
pub mod map_proxy;
pub mod map_service;
pub mod mapstore;
pub mod mutation_observer;
pub mod record;
pub mod record_store;

pub use engine::*;
pub use map_container::{MapContainer, WriteMode};
pub use map_proxy::MapProxy;
pub use map_service::MapService;
pub use mutation_observer::*;
pub use record::*;
pub use record_store::*;
