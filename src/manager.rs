//! Named registry of live cache clients.
//!
//! [`CacheManager`] owns every [`CacheClient`] it creates. Registration never
//! fails loudly: an unknown provider or a backend that cannot be reached is
//! logged and reported as `false`, so a process can start with whichever
//! caches happen to be available.
//!
//! ```
//! use cache_bridge::builder::CacheConfigBuilder;
//! use cache_bridge::manager::CacheManager;
//! use cache_bridge::registry::INMEMORY_PROVIDER;
//!
//! # #[tokio::main]
//! # async fn main() -> cache_bridge::Result<()> {
//! let config = CacheConfigBuilder::new()
//!     .provider_name(INMEMORY_PROVIDER)
//!     .server_builder()
//!     .address("local")
//!     .confirm()?
//!     .build();
//!
//! let manager = CacheManager::new();
//! assert!(manager.register("sessions", config).await);
//!
//! let sessions = manager.client("sessions").expect("registered above");
//! sessions.set("user:1", "alice").await?;
//! assert_eq!(sessions.get("user:1").await?, Some("alice".to_string()));
//!
//! manager.destroy_all().await;
//! # Ok(())
//! # }
//! ```

use crate::client::CacheClient;
use crate::config::CacheConfig;
use crate::observability::CacheMetrics;
use crate::registry::ProviderRegistry;
use crate::security::CredentialProtector;
use crate::store::ConfigStore;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Writer lock for one cache name. The lock entry is dropped from the map
/// once no task holds or waits on it.
struct NameGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    name: &'a str,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for NameGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(self.name, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Process-wide registry of named cache clients.
///
/// Names are trimmed at every entry point. Writers are serialized per name.
/// Readers (`client`, `registered`) never wait on a provider that is still
/// initializing.
pub struct CacheManager {
    registry: Arc<ProviderRegistry>,
    protector: Option<Arc<dyn CredentialProtector>>,
    metrics: Option<Arc<dyn CacheMetrics>>,
    clients: DashMap<String, Arc<CacheClient>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheManager {
    /// Manager over the built-in provider registry.
    pub fn new() -> Self {
        Self::with_registry(Arc::new(ProviderRegistry::with_builtin()))
    }

    pub fn with_registry(registry: Arc<ProviderRegistry>) -> Self {
        CacheManager {
            registry,
            protector: None,
            metrics: None,
            clients: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    /// Decrypt stored passwords with `protector` during registration.
    pub fn with_protector(mut self, protector: Arc<dyn CredentialProtector>) -> Self {
        self.protector = Some(protector);
        self
    }

    /// Attach `metrics` to every client registered afterwards.
    pub fn with_metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    async fn lock_name<'a>(&'a self, name: &'a str) -> NameGuard<'a> {
        let mut held = NameGuard {
            locks: &self.locks,
            name,
            guard: None,
        };
        let lock = Arc::clone(self.locks.entry(name.to_string()).or_default().value());
        held.guard = Some(lock.lock_owned().await);
        held
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Create a client for `config` and install it under `name`.
    ///
    /// An existing client under the same name is destroyed and replaced, but
    /// only once the new one is initialized.
    ///
    /// # Returns
    /// `false` if the name is blank, the provider is unknown, or the provider
    /// could not be initialized. The previous client, if any, stays in place.
    pub async fn register(&self, name: &str, config: CacheConfig) -> bool {
        let name = name.trim();
        if name.is_empty() {
            warn!("⚠ Cache registration skipped: blank cache name");
            return false;
        }

        let Some(descriptor) = self.registry.lookup(config.provider_name()) else {
            error!(
                "✗ Cache {} not registered: provider {:?} is unknown",
                name,
                config.provider_name()
            );
            return false;
        };

        let _guard = self.lock_name(name).await;

        let client = match CacheClient::connect(
            name,
            &descriptor,
            &config,
            self.protector.as_deref(),
        )
        .await
        {
            Ok(client) => client,
            Err(e) => {
                error!("✗ Cache {} not registered: {}", name, e);
                return false;
            }
        };
        let client = match &self.metrics {
            Some(metrics) => client.with_metrics(Arc::clone(metrics)),
            None => client,
        };

        if let Some((_, previous)) = self.clients.remove(name) {
            debug!("Cache {} replaced, destroying previous client", name);
            previous.destroy().await;
        }
        self.clients.insert(name.to_string(), Arc::new(client));

        info!("✓ Cache {} registered ({})", name, descriptor.name());
        true
    }

    /// Load the configuration stored under `name` and register it.
    pub async fn register_from_store(&self, name: &str, store: &dyn ConfigStore) -> bool {
        let name = name.trim();
        match store.load(name) {
            Ok(Some(config)) => self.register(name, config).await,
            Ok(None) => {
                warn!("⚠ Cache {} not registered: no stored configuration", name);
                false
            }
            Err(e) => {
                error!("✗ Cache {} not registered: {}", name, e);
                false
            }
        }
    }

    pub fn registered(&self, name: &str) -> bool {
        self.clients.contains_key(name.trim())
    }

    /// Shared handle to the client registered under `name`.
    pub fn client(&self, name: &str) -> Option<Arc<CacheClient>> {
        self.clients
            .get(name.trim())
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Names of all live clients, sorted.
    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Remove and destroy the client under `name`. No-op when absent.
    pub async fn deregister(&self, name: &str) {
        let name = name.trim();
        let _guard = self.lock_name(name).await;

        if let Some((_, client)) = self.clients.remove(name) {
            client.destroy().await;
            info!("✓ Cache {} deregistered", name);
        }
    }

    /// Destroy every client and empty the registry.
    pub async fn destroy_all(&self) {
        let names = self.registered_names();
        for name in &names {
            self.deregister(name).await;
        }
        info!("✓ All caches destroyed ({} clients)", names.len());
    }
}

#[cfg(all(test, feature = "inmemory"))]
mod tests {
    use super::*;
    use crate::builder::CacheConfigBuilder;
    use crate::registry::INMEMORY_PROVIDER;
    use crate::store::MemoryConfigStore;

    fn config() -> CacheConfig {
        CacheConfigBuilder::new()
            .provider_name(INMEMORY_PROVIDER)
            .server_builder()
            .address("local")
            .confirm()
            .expect("Failed to confirm server")
            .build()
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let manager = CacheManager::new();
        assert!(manager.register("users", config()).await);
        assert!(manager.registered("users"));
        assert!(manager.client("users").is_some());
        assert_eq!(manager.registered_names(), vec!["users".to_string()]);
    }

    #[tokio::test]
    async fn test_register_rejects_blank_name() {
        let manager = CacheManager::new();
        assert!(!manager.register("  ", config()).await);
        assert!(manager.registered_names().is_empty());
    }

    #[tokio::test]
    async fn test_register_rejects_unknown_provider() {
        let manager = CacheManager::new();
        let cfg = CacheConfigBuilder::from_config(config())
            .provider_name("NoSuchProvider")
            .build();
        assert!(!manager.register("users", cfg).await);
        assert!(!manager.registered("users"));
    }

    #[tokio::test]
    async fn test_register_replaces_and_destroys_previous() {
        let manager = CacheManager::new();
        assert!(manager.register("users", config()).await);
        let first = manager.client("users").expect("Failed to get client");

        assert!(manager.register("users", config()).await);
        let second = manager.client("users").expect("Failed to get client");

        assert!(first.is_destroyed());
        assert!(!second.is_destroyed());
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_failed_register_keeps_previous() {
        let manager = CacheManager::new();
        assert!(manager.register("users", config()).await);

        let broken = CacheConfigBuilder::from_config(config())
            .remove_server("local", 0)
            .build();
        assert!(!manager.register("users", broken).await);

        let client = manager.client("users").expect("Failed to get client");
        assert!(!client.is_destroyed());
    }

    #[tokio::test]
    async fn test_deregister_twice_is_noop() {
        let manager = CacheManager::new();
        assert!(manager.register("users", config()).await);
        let client = manager.client("users").expect("Failed to get client");

        manager.deregister("users").await;
        manager.deregister("users").await;

        assert!(!manager.registered("users"));
        assert!(manager.client("users").is_none());
        assert!(client.is_destroyed());
    }

    #[tokio::test]
    async fn test_destroy_all() {
        let manager = CacheManager::new();
        assert!(manager.register("a", config()).await);
        assert!(manager.register("b", config()).await);
        let a = manager.client("a").expect("Failed to get client");

        manager.destroy_all().await;

        assert!(manager.registered_names().is_empty());
        assert!(a.is_destroyed());
    }

    #[tokio::test]
    async fn test_names_are_trimmed_everywhere() {
        let manager = CacheManager::new();
        assert!(manager.register(" Demo ", config()).await);

        assert!(manager.registered("Demo"));
        assert!(manager.registered("\tDemo  "));
        assert!(manager.client(" Demo").is_some());
        assert_eq!(manager.registered_names(), vec!["Demo".to_string()]);

        manager.deregister(" Demo ").await;
        assert!(!manager.registered("Demo"));
        assert!(manager.registered_names().is_empty());
    }

    #[tokio::test]
    async fn test_lock_entries_are_released() {
        let manager = Arc::new(CacheManager::new());
        assert!(manager.register("a", config()).await);
        assert!(manager.register("b", config()).await);

        let broken = CacheConfigBuilder::from_config(config())
            .remove_server("local", 0)
            .build();
        assert!(!manager.register("c", broken).await);
        manager.deregister("a").await;
        manager.deregister("never-registered").await;
        assert_eq!(manager.lock_count(), 0);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    let name = format!("cache-{}", i % 4);
                    manager.register(&name, config()).await;
                    manager.deregister(&name).await;
                })
            })
            .collect();
        for handle in handles {
            handle.await.expect("task panicked");
        }

        assert_eq!(manager.lock_count(), 0);
        assert_eq!(manager.registered_names(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_register_from_store() {
        let store = MemoryConfigStore::new();
        store.save(&config(), "users").expect("Failed to save");

        let manager = CacheManager::new();
        assert!(manager.register_from_store("users", &store).await);
        assert!(manager.register_from_store(" users ", &store).await);
        assert!(!manager.register_from_store("missing", &store).await);
    }
}
