//! Error taxonomy for the MapStore integration layer.

use std::fmt;

/// Backend call that produced a [`MapStoreError::Backend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendOperation {
    Load,
    LoadAll,
    LoadAllKeys,
    Store,
    StoreAll,
    Delete,
    DeleteAll,
    Init,
    Destroy,
}

impl BackendOperation {
    /// Stable lowercase name used in logs and metric labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::LoadAll => "load_all",
            Self::LoadAllKeys => "load_all_keys",
            Self::Store => "store",
            Self::StoreAll => "store_all",
            Self::Delete => "delete",
            Self::DeleteAll => "delete_all",
            Self::Init => "init",
            Self::Destroy => "destroy",
        }
    }
}

impl fmt::Display for BackendOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by record stores, the flush pipeline, and the map service.
#[derive(Debug, thiserror::Error)]
pub enum MapStoreError {
    /// The user-supplied backend failed. In-memory state is unaffected.
    #[error("backend {operation} failed for map '{map}': {source}")]
    Backend {
        map: String,
        operation: BackendOperation,
        source: anyhow::Error,
    },
    /// Invalid map store configuration, detected at activation.
    #[error("invalid map store configuration: {0}")]
    Configuration(String),
    /// The partition is not owned by this node.
    #[error("partition {partition_id} is not owned by this node")]
    NotOwned { partition_id: u32 },
    /// The map service is shutting down and rejects new work.
    #[error("map service is shutting down")]
    ShuttingDown,
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl MapStoreError {
    /// Returns `true` for [`MapStoreError::Backend`].
    #[must_use]
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, Self::Backend { .. })
    }

    /// Returns the failed backend operation, if this is a backend failure.
    #[must_use]
    pub fn backend_operation(&self) -> Option<BackendOperation> {
        match self {
            Self::Backend { operation, .. } => Some(*operation),
            _ => None,
        }
    }
}

/// Result alias used throughout the storage layer.
pub type MapStoreResult<T> = Result<T, MapStoreError>;
