//! Mesh network data model with pluggable persistence.
//!
//! This crate owns the [`MeshNetwork`] aggregate (keys, provisioners with their
//! allocated address ranges, nodes, groups and IV index state), the range
//! allocation rules shared by every provisioner, and the backends that persist
//! a network snapshot (in-memory, file-based).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod allocation;
pub mod backend;
pub mod model;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),
    /// Entry not found
    #[error("Entry not found")]
    NotFound,
    /// Invalid operation or broken invariant
    #[error("Invalid operation: {0}")]
    Invalid(String),
    /// Backend-specific error
    #[error("Backend error: {0}")]
    Backend(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Address range allocation error
    #[error("Allocation error: {0}")]
    Allocation(#[from] AllocationError),
}

/// Address range allocation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    /// Low bound above high bound
    #[error("invalid range {low:#06x}..={high:#06x}")]
    InvalidRange {
        /// Low bound
        low: u16,
        /// High bound
        high: u16,
    },
    /// Range outside the address space of its kind
    #[error("{kind} range {low:#06x}..={high:#06x} out of bounds")]
    OutOfBounds {
        /// Range kind
        kind: RangeKind,
        /// Low bound
        low: u16,
        /// High bound
        high: u16,
    },
    /// Range intersects one held by another provisioner
    #[error("{kind} range overlaps provisioner {other}")]
    Overlap {
        /// Range kind
        kind: RangeKind,
        /// Provisioner holding the conflicting range
        other: Uuid,
    },
    /// Provisioner not part of the network
    #[error("unknown provisioner {0}")]
    UnknownProvisioner(Uuid),
    /// No free block of addresses left
    #[error("no free unicast block for {element_count} elements")]
    AddressSpaceExhausted {
        /// Elements requested
        element_count: u8,
    },
}

/// Persistence for mesh network snapshots
#[async_trait]
pub trait NetworkStore: Send + Sync {
    /// Load a network by id
    async fn load(&self, id: Uuid) -> Result<MeshNetwork, StorageError>;

    /// Save a network, refusing one that fails validation
    async fn save(&self, network: &MeshNetwork) -> Result<(), StorageError>;

    /// Delete a network and everything it owns
    async fn delete(&self, id: Uuid) -> Result<(), StorageError>;

    /// Ids of all stored networks
    async fn list(&self) -> Result<Vec<Uuid>, StorageError>;
}

/// Storage backend configuration
#[derive(Clone, Debug, Default)]
pub enum StoreMode {
    /// In-memory storage (dev/tests only)
    #[default]
    InMemory,
    /// One file per network under a data directory
    File {
        /// Data directory path
        data_dir: PathBuf,
    },
}

// Re-export model and backend types
pub use backend::file::FileStore;
pub use backend::mem::MemoryStore;
pub use model::key::MeshKey;
pub use model::network::{
    ApplicationKey, Group, IvIndex, KeyRefreshPhase, MeshNetwork, NetworkKey, Node,
};
pub use model::provisioner::{Provisioner, DEFAULT_PROVISIONER_NAME};
pub use model::range::{AllocatedRange, RangeKind};

/// Create a store from configuration
pub async fn open_store(mode: StoreMode) -> Result<Arc<dyn NetworkStore>, StorageError> {
    match mode {
        StoreMode::InMemory => Ok(Arc::new(MemoryStore::new())),
        StoreMode::File { data_dir } => Ok(Arc::new(FileStore::new(data_dir).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_store_modes() {
        let store = open_store(StoreMode::default()).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());

        let temp_dir = tempfile::TempDir::new().unwrap();
        let store = open_store(StoreMode::File {
            data_dir: temp_dir.path().to_path_buf(),
        })
        .await
        .unwrap();
        let network = MeshNetwork::generate("Office", None);
        store.save(&network).await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec![network.id]);
    }

    #[test]
    fn test_allocation_error_converts() {
        let err: StorageError = AllocationError::UnknownProvisioner(Uuid::nil()).into();
        assert!(matches!(err, StorageError::Allocation(_)));
    }
}
