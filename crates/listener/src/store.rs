//! Access to the external listener configuration store.
//!
//! The listener never creates or deletes configurations. It reads the
//! active one back and writes [`ConfigurationUpdate`]s, which the store
//! applies only while their resource version is current.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use certgate_common::ConfigRef;
use certgate_config::{ConfigurationUpdate, ListenerConfiguration};

use crate::error::StoreError;

#[async_trait]
pub trait ListenerConfigStore: Send + Sync {
    async fn get(&self, target: &ConfigRef) -> Result<ListenerConfiguration, StoreError>;

    /// Apply `update` and return the stored result.
    async fn update(&self, update: ConfigurationUpdate)
        -> Result<ListenerConfiguration, StoreError>;
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    configs: RwLock<BTreeMap<ConfigRef, ListenerConfiguration>>,
    updates: AtomicUsize,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a configuration, recomputing its metadata and
    /// advancing its resource version.
    pub fn insert(&self, mut config: ListenerConfiguration) -> ListenerConfiguration {
        config.refresh_metadata();
        let mut configs = self.configs.write();
        if let Some(existing) = configs.get(&config.config_ref()) {
            config.resource_version = existing.resource_version.next();
        }
        configs.insert(config.config_ref(), config.clone());
        config
    }

    pub fn list(&self) -> Vec<ListenerConfiguration> {
        self.configs.read().values().cloned().collect()
    }

    /// Number of updates applied so far
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ListenerConfigStore for MemoryConfigStore {
    async fn get(&self, target: &ConfigRef) -> Result<ListenerConfiguration, StoreError> {
        self.configs
            .read()
            .get(target)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(target.to_string()))
    }

    async fn update(
        &self,
        update: ConfigurationUpdate,
    ) -> Result<ListenerConfiguration, StoreError> {
        let mut configs = self.configs.write();
        let current = configs
            .get(&update.target)
            .ok_or_else(|| StoreError::NotFound(update.target.to_string()))?;

        let updated = update.apply_to(current)?;
        configs.insert(update.target.clone(), updated.clone());
        self.updates.fetch_add(1, Ordering::AcqRel);

        debug!(
            config = %update.target,
            resource_version = %updated.resource_version,
            "Applied configuration update"
        );
        Ok(updated)
    }
}

/// Store backed by a JSON array of configurations on disk.
///
/// Every read goes to the file so edits made while the process runs are
/// picked up. Writes replace the file through a temporary sibling.
#[derive(Debug)]
pub struct FileConfigStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }

    /// Every stored configuration. A missing file is an empty store.
    pub async fn list(&self) -> Result<Vec<ListenerConfiguration>, StoreError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!(path = %self.path.display(), "Store file does not exist yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(self.io_error(e)),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    async fn write_all(&self, configs: &[ListenerConfiguration]) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(configs)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))
    }

    /// Add or replace a configuration, as an operator would.
    pub async fn insert(
        &self,
        mut config: ListenerConfiguration,
    ) -> Result<ListenerConfiguration, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut configs = self.list().await?;

        config.refresh_metadata();
        match configs
            .iter_mut()
            .find(|c| c.config_ref() == config.config_ref())
        {
            Some(existing) => {
                config.resource_version = existing.resource_version.next();
                *existing = config.clone();
            }
            None => configs.push(config.clone()),
        }

        self.write_all(&configs).await?;
        Ok(config)
    }
}

#[async_trait]
impl ListenerConfigStore for FileConfigStore {
    async fn get(&self, target: &ConfigRef) -> Result<ListenerConfiguration, StoreError> {
        self.list()
            .await?
            .into_iter()
            .find(|c| &c.config_ref() == target)
            .ok_or_else(|| StoreError::NotFound(target.to_string()))
    }

    async fn update(
        &self,
        update: ConfigurationUpdate,
    ) -> Result<ListenerConfiguration, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut configs = self.list().await?;

        let slot = configs
            .iter_mut()
            .find(|c| c.config_ref() == update.target)
            .ok_or_else(|| StoreError::NotFound(update.target.to_string()))?;
        let updated = update.apply_to(slot)?;
        *slot = updated.clone();

        self.write_all(&configs).await?;
        debug!(
            config = %update.target,
            resource_version = %updated.resource_version,
            path = %self.path.display(),
            "Persisted configuration update"
        );
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use certgate_config::ListenerMode;

    #[tokio::test]
    async fn test_memory_update_advances_version() {
        let store = MemoryConfigStore::new();
        let stored = store.insert(ListenerConfiguration::new("main", ListenerMode::StaticTls));

        let update = ConfigurationUpdate::for_config(&stored)
            .with_known_ips(vec!["10.0.0.1".to_string()]);
        let updated = store.update(update.clone()).await.unwrap();

        assert_eq!(updated.known_ips, vec!["10.0.0.1"]);
        assert_eq!(updated.resource_version, stored.resource_version.next());
        assert_eq!(store.update_count(), 1);

        // the same update is now stale
        assert!(matches!(
            store.update(update).await,
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(store.update_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_missing_config() {
        let store = MemoryConfigStore::new();
        assert!(matches!(
            store.get(&ConfigRef::cluster("absent")).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::new(dir.path().join("listen-configs.json"));
        assert!(store.list().await.unwrap().is_empty());

        let stored = store
            .insert(ListenerConfiguration::new("main", ListenerMode::Acme))
            .await
            .unwrap();

        let mut certs = BTreeMap::new();
        certs.insert("example.com".to_string(), "cert#key".to_string());
        let updated = store
            .update(ConfigurationUpdate::for_config(&stored).with_generated_certs(certs.clone()))
            .await
            .unwrap();

        let reread = FileConfigStore::new(store.path());
        let fetched = reread.get(&stored.config_ref()).await.unwrap();
        assert_eq!(fetched.generated_certs, certs);
        assert_eq!(fetched.resource_version, updated.resource_version);
        assert_eq!(fetched.mode, ListenerMode::Acme);
    }

    #[tokio::test]
    async fn test_file_store_rejects_stale_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::new(dir.path().join("listen-configs.json"));
        let stored = store
            .insert(ListenerConfiguration::new("main", ListenerMode::StaticTls))
            .await
            .unwrap();

        // operator edit bumps the version
        store.insert(stored.clone()).await.unwrap();

        let stale = ConfigurationUpdate::for_config(&stored).with_known_ips(Vec::new());
        assert!(matches!(
            store.update(stale).await,
            Err(StoreError::Conflict(_))
        ));
    }
}
