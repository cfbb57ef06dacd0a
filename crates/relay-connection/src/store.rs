//! Persistence for the relay endpoint config.
//!
//! The manager only sees the [`ConfigStore`] capability, so the record can
//! live in memory, in a JSON file, or anywhere else.

use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use tracing::{debug, warn};

use crate::types::RelayEndpointConfig;

/// Errors from config persistence.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Key-value storage for the single relay endpoint record.
pub trait ConfigStore: Send + Sync + 'static {
    /// Returns the stored config, if any.
    fn load(&self) -> Option<RelayEndpointConfig>;

    /// Replaces the stored config.
    fn save(&self, config: &RelayEndpointConfig) -> Result<(), StoreError>;

    /// Removes the stored config.
    fn clear(&self) -> Result<(), StoreError>;
}

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    config: RwLock<Option<RelayEndpointConfig>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `config`.
    pub fn with_config(config: RelayEndpointConfig) -> Self {
        Self {
            config: RwLock::new(Some(config)),
        }
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Option<RelayEndpointConfig> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn save(&self, config: &RelayEndpointConfig) -> Result<(), StoreError> {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Some(config.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

/// JSON file store.
///
/// The record is cached in memory and written through on every change.
/// An unreadable or corrupt file is treated as "no config".
#[derive(Debug)]
pub struct FileConfigStore {
    path: PathBuf,
    config: RwLock<Option<RelayEndpointConfig>>,
}

impl FileConfigStore {
    /// Opens the store, loading an existing record from disk.
    pub fn new(path: PathBuf) -> Self {
        let config = load_config(&path);
        Self {
            path,
            config: RwLock::new(config),
        }
    }

    /// Opens the store at [`default_config_path`].
    pub fn open_default() -> Option<Self> {
        default_config_path().map(Self::new)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Option<RelayEndpointConfig> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn save(&self, config: &RelayEndpointConfig) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(config)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, json)?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Some(config.clone());
        debug!("persisted relay config to {:?}", self.path);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = None;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Loads a config file, returning `None` if it is missing or unreadable.
fn load_config(path: &Path) -> Option<RelayEndpointConfig> {
    let data = match std::fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("failed to read relay config {:?}: {e}", path);
            return None;
        }
    };
    match serde_json::from_str(&data) {
        Ok(config) => {
            debug!("loaded relay config from {:?}", path);
            Some(config)
        }
        Err(e) => {
            warn!("ignoring corrupt relay config {:?}: {e}", path);
            None
        }
    }
}

/// Returns the default config path.
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("meshrelay").join("agentcore.json"))
}

/// Returns the platform-specific config directory.
fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".config"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CognitoLink, Credentials};

    fn sample() -> RelayEndpointConfig {
        RelayEndpointConfig {
            resource_id: "arn:aws:bedrock-agentcore:us-east-1:1:runtime/a".into(),
            region: "us-east-1".into(),
            credentials: Credentials {
                access_key_id: "AKID".into(),
                secret_access_key: "secret".into(),
                session_token: Some("tok".into()),
                expiration: Some(1_700_000_000),
            },
            cognito: Some(CognitoLink {
                identity_pool_id: "us-east-1:pool".into(),
                provider_name: "cognito-idp.us-east-1.amazonaws.com/us-east-1_x".into(),
            }),
            id_token: Some("jwt".into()),
        }
    }

    fn test_store() -> (tempfile::TempDir, FileConfigStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileConfigStore::new(tmp.path().join("agentcore.json"));
        (tmp, store)
    }

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryConfigStore::new();
        assert!(store.load().is_none());
        store.save(&sample()).unwrap();
        assert_eq!(store.load(), Some(sample()));
        store.clear().unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn new_file_store_empty() {
        let (_tmp, store) = test_store();
        assert!(store.load().is_none());
    }

    #[test]
    fn persist_and_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("agentcore.json");

        {
            let store = FileConfigStore::new(path.clone());
            store.save(&sample()).unwrap();
        }

        let reloaded = FileConfigStore::new(path);
        assert_eq!(reloaded.load(), Some(sample()));
    }

    #[test]
    fn save_replaces_whole_record() {
        let (_tmp, store) = test_store();
        store.save(&sample()).unwrap();

        let mut updated = sample();
        updated.credentials = Credentials {
            access_key_id: "AKID2".into(),
            secret_access_key: "secret2".into(),
            session_token: None,
            expiration: None,
        };
        store.save(&updated).unwrap();

        let reloaded = FileConfigStore::new(store.path().to_path_buf());
        let creds = reloaded.load().unwrap().credentials;
        assert_eq!(creds.access_key_id, "AKID2");
        assert!(creds.session_token.is_none());
    }

    #[test]
    fn clear_removes_file() {
        let (_tmp, store) = test_store();
        store.save(&sample()).unwrap();
        assert!(store.path().exists());
        store.clear().unwrap();
        assert!(!store.path().exists());
        assert!(store.load().is_none());
        // Clearing twice is fine.
        store.clear().unwrap();
    }

    #[test]
    fn corrupt_file_loads_as_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("agentcore.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = FileConfigStore::new(path);
        assert!(store.load().is_none());
    }

    #[test]
    fn file_uses_persisted_field_names() {
        let (_tmp, store) = test_store();
        store.save(&sample()).unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert!(raw.get("arn").is_some());
        assert!(raw.get("idToken").is_some());
        assert_eq!(raw["cognito"]["providerName"], sample().cognito.unwrap().provider_name);
    }
}
