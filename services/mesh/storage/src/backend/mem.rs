//! In-memory storage backend for development and testing

use crate::{MeshNetwork, NetworkStore, StorageError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// In-memory network store
#[derive(Clone, Default)]
pub struct MemoryStore {
    /// Saved networks: id -> snapshot
    networks: Arc<DashMap<Uuid, MeshNetwork>>,
}

impl MemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            networks: Arc::new(DashMap::new()),
        }
    }
}

#[async_trait]
impl NetworkStore for MemoryStore {
    async fn load(&self, id: Uuid) -> Result<MeshNetwork, StorageError> {
        debug!("Memory store load network={}", id);
        self.networks
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(StorageError::NotFound)
    }

    async fn save(&self, network: &MeshNetwork) -> Result<(), StorageError> {
        network.validate()?;
        debug!(
            "Memory store save network={} nodes={}",
            network.id,
            network.nodes.len()
        );
        self.networks.insert(network.id, network.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StorageError> {
        debug!("Memory store delete network={}", id);
        // The snapshot owns its provisioners, nodes, keys and groups
        self.networks
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::NotFound)
    }

    async fn list(&self) -> Result<Vec<Uuid>, StorageError> {
        let mut ids: Vec<Uuid> = self.networks.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_basic() {
        let store = MemoryStore::new();
        let network = MeshNetwork::generate("Home", None);

        store.save(&network).await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec![network.id]);

        let loaded = store.load(network.id).await.unwrap();
        assert_eq!(loaded, network);
    }

    #[tokio::test]
    async fn test_memory_store_refuses_invalid() {
        let store = MemoryStore::new();
        let mut network = MeshNetwork::generate("Home", None);
        network.net_keys.clear();

        assert!(matches!(
            store.save(&network).await,
            Err(StorageError::Invalid(_))
        ));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_delete_cascades() {
        let store = MemoryStore::new();
        let network = MeshNetwork::generate("Home", None);
        store.save(&network).await.unwrap();

        store.delete(network.id).await.unwrap();
        assert!(matches!(
            store.load(network.id).await,
            Err(StorageError::NotFound)
        ));
        assert!(matches!(
            store.delete(network.id).await,
            Err(StorageError::NotFound)
        ));
    }
}
