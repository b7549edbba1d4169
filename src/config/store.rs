//! Durable per-guild bridge settings.
//!
//! Settings live in a single JSON document keyed by guild id. Every
//! mutation rewrites the file through a temporary sibling and a rename so a
//! crash never leaves a half-written store behind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::common::error::StoreError;
use crate::common::BridgeId;
use crate::config::types::BridgeConfig;

pub struct ConfigStore {
    path: PathBuf,
    bridges: RwLock<HashMap<BridgeId, BridgeConfig>>,
}

impl ConfigStore {
    /// Open the store, starting empty if the file does not exist yet.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let bridges = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<HashMap<BridgeId, BridgeConfig>>(&bytes)
                .map_err(|source| StoreError::Corrupt {
                    path: path.display().to_string(),
                    source,
                })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No bridge store at {}, starting empty", path.display());
                HashMap::new()
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        debug!("Loaded {} bridge configs from {}", bridges.len(), path.display());
        Ok(Self {
            path,
            bridges: RwLock::new(bridges),
        })
    }

    #[cfg(test)]
    pub async fn get(&self, id: BridgeId) -> Option<BridgeConfig> {
        self.bridges.read().await.get(&id).cloned()
    }

    pub async fn all(&self) -> Vec<(BridgeId, BridgeConfig)> {
        self.bridges
            .read()
            .await
            .iter()
            .map(|(id, config)| (*id, config.clone()))
            .collect()
    }

    /// Replace the config for one bridge and persist.
    pub async fn put(&self, id: BridgeId, config: BridgeConfig) -> Result<(), StoreError> {
        let mut bridges = self.bridges.write().await;
        bridges.insert(id, config);
        self.persist(&bridges).await
    }

    /// Remove the config for one bridge and persist.
    pub async fn remove(&self, id: BridgeId) -> Result<Option<BridgeConfig>, StoreError> {
        let mut bridges = self.bridges.write().await;
        let removed = bridges.remove(&id);
        if removed.is_some() {
            self.persist(&bridges).await?;
        }
        Ok(removed)
    }

    async fn persist(&self, bridges: &HashMap<BridgeId, BridgeConfig>) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.display().to_string(),
            source,
        };

        let json = serde_json::to_vec_pretty(bridges).map_err(|source| StoreError::Corrupt {
            path: self.path.display().to_string(),
            source,
        })?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, json).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_opens_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bridges.json");
        let store = ConfigStore::open(&path).await.unwrap();
        assert!(store.all().await.is_empty());
        assert!(store.get(1).await.is_none());
    }

    #[tokio::test]
    async fn test_put_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bridges.json");
        let store = ConfigStore::open(&path).await.unwrap();

        let config = BridgeConfig {
            server_address: Some("10.0.0.1".to_string()),
            channel_id: Some(99),
            enabled: true,
            ..Default::default()
        };
        store.put(7, config.clone()).await.unwrap();

        let reopened = ConfigStore::open(&path).await.unwrap();
        assert_eq!(reopened.get(7).await, Some(config));

        assert!(reopened.remove(7).await.unwrap().is_some());
        let reopened = ConfigStore::open(&path).await.unwrap();
        assert!(reopened.get(7).await.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bridges.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();

        let result = ConfigStore::open(&path).await;
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
    }
}
