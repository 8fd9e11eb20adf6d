//! File-based storage backend: one checksummed record per network

use crate::{MeshNetwork, NetworkStore, StorageError};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32fast::Hasher;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

const RECORD_EXTENSION: &str = "mesh";

/// Record header
#[derive(Debug)]
struct RecordHeader {
    len: u32,   // Body length (not including header)
    crc32: u32, // CRC32 over the JSON body
}

impl RecordHeader {
    const SIZE: usize = 4 + 4; // u32 + u32

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.len);
        buf.put_u32_le(self.crc32);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, StorageError> {
        if buf.remaining() < Self::SIZE {
            return Err(StorageError::Corruption(
                "Incomplete record header".to_string(),
            ));
        }

        Ok(Self {
            len: buf.get_u32_le(),
            crc32: buf.get_u32_le(),
        })
    }

    fn compute_crc(body: &[u8]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(body);
        hasher.finalize()
    }
}

/// File-based network store
pub struct FileStore {
    data_dir: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `data_dir`, creating the directory if needed
    pub async fn new(data_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(data_dir.join("networks"))?;
        info!("File store opened at {}", data_dir.display());
        Ok(Self { data_dir })
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.data_dir
            .join("networks")
            .join(format!("{}.{}", id, RECORD_EXTENSION))
    }

    fn encode_record(network: &MeshNetwork) -> Result<Bytes, StorageError> {
        let body = serde_json::to_vec_pretty(network)?;
        let header = RecordHeader {
            len: body.len() as u32,
            crc32: RecordHeader::compute_crc(&body),
        };

        let mut buf = BytesMut::with_capacity(RecordHeader::SIZE + body.len());
        header.encode(&mut buf);
        buf.extend_from_slice(&body);
        Ok(buf.freeze())
    }

    fn decode_record(path: &Path, raw: Vec<u8>) -> Result<MeshNetwork, StorageError> {
        let mut buf = Bytes::from(raw);
        let header = RecordHeader::decode(&mut buf)?;

        if buf.len() != header.len as usize {
            return Err(StorageError::Corruption(format!(
                "Record {} length {} does not match header {}",
                path.display(),
                buf.len(),
                header.len
            )));
        }
        if RecordHeader::compute_crc(&buf) != header.crc32 {
            return Err(StorageError::Corruption(format!(
                "Checksum mismatch in {}",
                path.display()
            )));
        }

        let network = serde_json::from_slice(&buf)?;
        Ok(network)
    }
}

#[async_trait]
impl NetworkStore for FileStore {
    async fn load(&self, id: Uuid) -> Result<MeshNetwork, StorageError> {
        let path = self.record_path(id);
        if !path.exists() {
            return Err(StorageError::NotFound);
        }

        let raw = std::fs::read(&path)?;
        debug!("File store load network={} bytes={}", id, raw.len());
        Self::decode_record(&path, raw)
    }

    async fn save(&self, network: &MeshNetwork) -> Result<(), StorageError> {
        network.validate()?;

        let record = Self::encode_record(network)?;
        let path = self.record_path(network.id);
        let tmp = path.with_extension("tmp");

        // Record replaced by rename, never written in place
        std::fs::write(&tmp, &record)?;
        std::fs::rename(&tmp, &path)?;

        debug!(
            "File store save network={} bytes={}",
            network.id,
            record.len()
        );
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StorageError> {
        let path = self.record_path(id);
        if !path.exists() {
            return Err(StorageError::NotFound);
        }
        std::fs::remove_file(&path)?;
        info!("File store deleted network={}", id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Uuid>, StorageError> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(self.data_dir.join("networks"))? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            match path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(Uuid::parse_str)
            {
                Some(Ok(id)) => ids.push(id),
                _ => warn!("Ignoring unexpected file {}", path.display()),
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path()).await.unwrap();
        let network = MeshNetwork::generate("Home", None);

        store.save(&network).await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec![network.id]);
        assert_eq!(store.load(network.id).await.unwrap(), network);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let network = MeshNetwork::generate("Home", None);
        {
            let store = FileStore::new(temp_dir.path()).await.unwrap();
            store.save(&network).await.unwrap();
        }

        let store = FileStore::new(temp_dir.path()).await.unwrap();
        let loaded = store.load(network.id).await.unwrap();
        assert_eq!(loaded.net_keys, network.net_keys);
    }

    #[tokio::test]
    async fn test_file_store_detects_corruption() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path()).await.unwrap();
        let network = MeshNetwork::generate("Home", None);
        store.save(&network).await.unwrap();

        let path = store.record_path(network.id);
        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 2;
        raw[last] ^= 0x20;
        std::fs::write(&path, raw).unwrap();

        assert!(matches!(
            store.load(network.id).await,
            Err(StorageError::Corruption(_))
        ));
    }

    #[tokio::test]
    async fn test_file_store_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path()).await.unwrap();
        let network = MeshNetwork::generate("Home", None);
        store.save(&network).await.unwrap();

        store.delete(network.id).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
        assert!(matches!(
            store.load(network.id).await,
            Err(StorageError::NotFound)
        ));
    }
}
