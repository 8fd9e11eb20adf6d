//! Configuration handling for the mesh tool.
//!
//! This module reads the shared config file and environment variables and
//! turns them into storage settings and an [`EngineConfig`].

use anyhow::Result;
use mesh_session::EngineConfig;
use mesh_storage::StoreMode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Mesh tool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Storage backend: "memory" or "file"
    pub storage_mode: String,
    /// Directory of the file backend
    pub data_dir: PathBuf,
    /// Network used when a command names none
    pub network_id: Option<String>,
    /// Default TTL of outgoing messages
    pub default_ttl: u8,
    /// Acknowledged message timeout (seconds)
    pub ack_timeout: u64,
    /// Provisioning step timeout (seconds)
    pub provisioning_timeout: u64,
    /// MTU of the simulated bearer
    pub mtu: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            storage_mode: "file".to_string(),
            data_dir: PathBuf::from("./meshdata"),
            network_id: None,
            default_ttl: 5,
            ack_timeout: 30,
            provisioning_timeout: 60,
            mtu: 23,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    mesh: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    args: Option<Vec<String>>,
    config: Option<HashMap<String, String>>,
}

impl MeshConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root_config) => {
                    config.apply_root_config(root_config);
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => warn!(
                    "Failed to parse config file {:?} ({}), using defaults",
                    config_path.as_ref(),
                    e
                ),
            },
            Err(_) => warn!(
                "Config file {:?} not found, using defaults",
                config_path.as_ref()
            ),
        }

        config.apply_environment_overrides();

        info!(
            "Final mesh configuration: storage={}, data_dir={:?}, ttl={}, mtu={}",
            config.storage_mode, config.data_dir, config.default_ttl, config.mtu
        );
        Ok(config)
    }

    fn apply_root_config(&mut self, root_config: RootConfig) {
        if let Some(mesh_service) = root_config.services.and_then(|s| s.mesh) {
            self.apply_service_config(mesh_service);
        }
    }

    fn apply_service_config(&mut self, service_config: ServiceConfig) {
        if let Some(args) = service_config.args {
            for arg in args {
                if let Some(dir) = arg.strip_prefix("--data-dir=") {
                    self.data_dir = PathBuf::from(dir);
                } else if let Some(mode) = arg.strip_prefix("--storage-mode=") {
                    self.storage_mode = mode.to_string();
                }
            }
        }

        if let Some(config_map) = service_config.config {
            for (key, value) in config_map {
                self.apply_value(&key, value);
            }
        }
    }

    fn apply_value(&mut self, key: &str, value: String) {
        match key {
            "services.mesh.storage_mode" => self.storage_mode = value,
            "services.mesh.data_dir" => self.data_dir = PathBuf::from(value),
            "services.mesh.network_id" => self.network_id = Some(value),
            "services.mesh.default_ttl" => {
                if let Ok(ttl) = value.parse::<u8>() {
                    self.default_ttl = ttl;
                }
            }
            "services.mesh.ack_timeout" => {
                if let Ok(secs) = value.parse::<u64>() {
                    self.ack_timeout = secs;
                }
            }
            "services.mesh.provisioning_timeout" => {
                if let Ok(secs) = value.parse::<u64>() {
                    self.provisioning_timeout = secs;
                }
            }
            "services.mesh.mtu" => {
                if let Ok(mtu) = value.parse::<usize>() {
                    self.mtu = mtu;
                }
            }
            _ => {
                // Ignore unknown configuration keys
            }
        }
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        if let Ok(mode) = std::env::var("MESH_STORAGE_MODE") {
            info!("Storage mode overridden by environment: {}", mode);
            self.storage_mode = mode;
        }

        if let Ok(dir) = std::env::var("MESH_DATA_DIR") {
            info!("Data directory overridden by environment: {}", dir);
            self.data_dir = PathBuf::from(dir);
        }

        if let Ok(id) = std::env::var("MESH_NETWORK_ID") {
            self.network_id = Some(id);
        }

        if let Ok(ttl) = std::env::var("MESH_DEFAULT_TTL") {
            if let Ok(ttl) = ttl.parse::<u8>() {
                self.default_ttl = ttl;
                info!("Default TTL overridden by environment: {}", ttl);
            }
        }
    }

    /// Storage backend selected by `storage_mode`
    pub fn store_mode(&self) -> Result<StoreMode> {
        match self.storage_mode.as_str() {
            "memory" => Ok(StoreMode::InMemory),
            "file" => Ok(StoreMode::File {
                data_dir: self.data_dir.clone(),
            }),
            other => anyhow::bail!("Invalid storage mode: {}. Use 'memory' or 'file'", other),
        }
    }

    /// Engine settings derived from this configuration
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let config = EngineConfig {
            default_ttl: self.default_ttl,
            acknowledged_message_timeout: Duration::from_secs(self.ack_timeout),
            provisioning_timeout: Duration::from_secs(self.provisioning_timeout),
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = MeshConfig::default();
        assert_eq!(config.storage_mode, "file");
        assert_eq!(config.default_ttl, 5);
        assert_eq!(config.mtu, 23);
        assert!(config.engine_config().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
services:
  mesh:
    enabled: true
    args:
      - --data-dir=/var/lib/btmesh
    config:
      services.mesh.storage_mode: "memory"
      services.mesh.default_ttl: "7"
      services.mesh.ack_timeout: "10"
      services.mesh.mtu: "64"
      services.mesh.unknown_key: "ignored"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = MeshConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/btmesh"));
        assert_eq!(config.storage_mode, "memory");
        assert_eq!(config.default_ttl, 7);
        assert_eq!(config.mtu, 64);
        assert!(matches!(config.store_mode().unwrap(), StoreMode::InMemory));

        let engine = config.engine_config().unwrap();
        assert_eq!(engine.default_ttl, 7);
        assert_eq!(engine.acknowledged_message_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_values() {
        let config = MeshConfig {
            storage_mode: "tape".to_string(),
            default_ttl: 200,
            ..Default::default()
        };
        assert!(config.store_mode().is_err());
        assert!(config.engine_config().is_err());
    }
}
