//! Named configuration persistence.
//!
//! [`ConfigStore`] loads and saves a [`CacheConfig`] by name. Two stores ship
//! with the crate: [`FileConfigStore`] (one JSON document per name) and
//! [`MemoryConfigStore`] (process-local, mainly for tests and embedding).

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use dashmap::DashMap;
use std::path::{Path, PathBuf};

/// Load/save a cache configuration by name.
pub trait ConfigStore: Send + Sync {
    /// Load the configuration stored under `name`.
    ///
    /// # Returns
    /// - `Ok(Some(config))` - Configuration found
    /// - `Ok(None)` - Nothing stored under this name
    ///
    /// # Errors
    /// Returns `Err` if the stored document exists but cannot be read or parsed.
    fn load(&self, name: &str) -> Result<Option<CacheConfig>>;

    /// Persist `config` under `name`, replacing any previous document.
    ///
    /// # Errors
    /// Returns `Err` if the document cannot be written.
    fn save(&self, config: &CacheConfig, name: &str) -> Result<()>;

    /// Remove the document stored under `name`. No-op when absent.
    fn remove(&self, name: &str) -> Result<()>;
}

/// Directory-backed store: `<dir>/<name>.json`.
#[derive(Clone, Debug)]
pub struct FileConfigStore {
    dir: PathBuf,
}

impl FileConfigStore {
    /// Create a store rooted at `dir`. The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileConfigStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            && !name.starts_with('.');
        if !valid {
            return Err(Error::Configuration(format!(
                "invalid configuration name: {:?}",
                name
            )));
        }
        Ok(self.dir.join(format!("{}.json", name)))
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self, name: &str) -> Result<Option<CacheConfig>> {
        let path = self.path_for(name)?;
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                let config = CacheConfig::from_json(&content)?;
                debug!("✓ Loaded cache configuration {} from {}", name, path.display());
                Ok(Some(config))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, config: &CacheConfig, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        std::fs::create_dir_all(&self.dir)?;

        // Write-then-rename so readers never observe a half-written document.
        let staging = path.with_extension("json.tmp");
        std::fs::write(&staging, config.to_json()?)?;
        std::fs::rename(&staging, &path)?;

        debug!("✓ Saved cache configuration {} to {}", name, path.display());
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local store.
#[derive(Default)]
pub struct MemoryConfigStore {
    configs: DashMap<String, CacheConfig>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self, name: &str) -> Result<Option<CacheConfig>> {
        Ok(self.configs.get(name).map(|c| c.clone()))
    }

    fn save(&self, config: &CacheConfig, name: &str) -> Result<()> {
        self.configs.insert(name.to_string(), config.clone());
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.configs.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerEndpoint;

    fn sample() -> CacheConfig {
        CacheConfig {
            provider_name: "RedisProvider".to_string(),
            servers: vec![ServerEndpoint::new("localhost", 6379, 1)],
            ..Default::default()
        }
    }

    #[test]
    fn test_file_store_save_load() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = FileConfigStore::new(dir.path().join("configs"));

        store.save(&sample(), "Demo").expect("Failed to save");
        let loaded = store.load("Demo").expect("Failed to load");
        assert_eq!(loaded, Some(sample()));
    }

    #[test]
    fn test_file_store_missing() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = FileConfigStore::new(dir.path());
        assert_eq!(store.load("Nothing").expect("Failed to load"), None);
        store.remove("Nothing").expect("Remove of missing should succeed");
    }

    #[test]
    fn test_file_store_remove() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = FileConfigStore::new(dir.path());
        store.save(&sample(), "Demo").expect("Failed to save");
        store.remove("Demo").expect("Failed to remove");
        assert_eq!(store.load("Demo").expect("Failed to load"), None);
    }

    #[test]
    fn test_file_store_rejects_path_names() {
        let store = FileConfigStore::new("/tmp");
        assert!(store.load("../etc/passwd").is_err());
        assert!(store.load("").is_err());
        assert!(store.save(&sample(), ".hidden").is_err());
    }

    #[test]
    fn test_file_store_corrupt_document() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        std::fs::write(dir.path().join("Bad.json"), "{ not json").unwrap();
        let store = FileConfigStore::new(dir.path());
        assert!(matches!(store.load("Bad"), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryConfigStore::new();
        assert_eq!(store.load("Demo").unwrap(), None);
        store.save(&sample(), "Demo").unwrap();
        assert_eq!(store.load("Demo").unwrap(), Some(sample()));
        store.remove("Demo").unwrap();
        assert_eq!(store.load("Demo").unwrap(), None);
    }
}
