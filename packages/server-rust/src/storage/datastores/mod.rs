//! [`MapStore`](crate::traits::MapStore) backends shipped with the server.
//!
//! Currently includes [`InMemoryMapStore`], a recording backend used by the
//! demo binary and tests.

mod memory;

pub use memory::{BackendCalls, BackendWrite, InMemoryMapStore};
