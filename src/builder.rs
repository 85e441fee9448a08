//! Fluent construction of [`CacheConfig`] values.
//!
//! Setters never fail on cosmetic misconfiguration: a non-positive count or
//! timeout resets the field to its documented default, a blank provider name
//! is ignored. The only hard failure is confirming a server entry without an
//! address.
//!
//! # Example
//!
//! ```
//! use cache_bridge::builder::CacheConfigBuilder;
//! use cache_bridge::config::ClusterMode;
//!
//! # fn main() -> cache_bridge::Result<()> {
//! let config = CacheConfigBuilder::new()
//!     .provider_name("MemcachedProvider")
//!     .client_pool_size(0) // resets to the default (5)
//!     .cluster_mode(ClusterMode::Cluster)
//!     .server_builder()
//!     .server("cache1", 11211)
//!     .weight(2)
//!     .confirm()?
//!     .server_builder()
//!     .address("cache2") // provider default port
//!     .confirm()?
//!     .build();
//!
//! assert_eq!(config.client_pool_size(), 5);
//! assert_eq!(config.servers().len(), 2);
//! # Ok(())
//! # }
//! ```

use crate::config::{
    CacheConfig, ClusterMode, ServerEndpoint, DEFAULT_CLIENT_POOL_SIZE, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_EXPIRE_TIME, DEFAULT_MAXIMUM_CLIENT, DEFAULT_RETRY_COUNT, DEFAULT_SERVER_WEIGHT,
    UNSET_PORT,
};
use crate::error::{Error, Result};
use crate::security::{CredentialProtector, SchemeConfig};
use crate::store::ConfigStore;
use std::sync::Arc;

/// Accept `value` when positive, otherwise fall back to `default`.
fn positive_or(value: i32, default: u32) -> u32 {
    if value > 0 {
        value as u32
    } else {
        default
    }
}

/// Builder for [`CacheConfig`].
pub struct CacheConfigBuilder {
    config: CacheConfig,
    protector: Option<Arc<dyn CredentialProtector>>,
    /// Scheme this builder registered through `secure_config`, released on switch.
    owned_scheme: Option<String>,
}

impl Default for CacheConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheConfigBuilder {
    /// Start from a default configuration.
    pub fn new() -> Self {
        Self::from_config(CacheConfig::default())
    }

    /// Start from an existing configuration.
    pub fn from_config(config: CacheConfig) -> Self {
        CacheConfigBuilder {
            config,
            protector: None,
            owned_scheme: None,
        }
    }

    /// Start from the configuration stored under `name`, or defaults when none is stored.
    ///
    /// # Errors
    /// Returns `Err` if a stored document exists but cannot be read.
    pub fn load(store: &dyn ConfigStore, name: &str) -> Result<Self> {
        let config = store.load(name)?.unwrap_or_default();
        Ok(Self::from_config(config))
    }

    /// Attach the credential protector used for password encryption.
    pub fn with_protector(mut self, protector: Arc<dyn CredentialProtector>) -> Self {
        self.protector = Some(protector);
        self
    }

    /// Current state of the configuration being built.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Set the provider name. Blank names are ignored.
    pub fn provider_name(mut self, name: &str) -> Self {
        if !name.trim().is_empty() {
            self.config.provider_name = name.trim().to_string();
        }
        self
    }

    /// Connect timeout in seconds; non-positive resets to the default.
    pub fn connect_timeout(mut self, seconds: i32) -> Self {
        self.config.connect_timeout = positive_or(seconds, DEFAULT_CONNECT_TIMEOUT);
        self
    }

    /// Default expiry in seconds; non-positive resets to the default (never expire).
    pub fn expire_time(mut self, seconds: i32) -> Self {
        self.config.expire_time = if seconds > 0 {
            seconds
        } else {
            DEFAULT_EXPIRE_TIME
        };
        self
    }

    /// Idle clients per pool; non-positive resets to the default.
    pub fn client_pool_size(mut self, size: i32) -> Self {
        self.config.client_pool_size = positive_or(size, DEFAULT_CLIENT_POOL_SIZE);
        self
    }

    /// Maximum live clients per pool; non-positive resets to the default.
    pub fn maximum_client(mut self, max: i32) -> Self {
        self.config.maximum_client = positive_or(max, DEFAULT_MAXIMUM_CLIENT);
        self
    }

    /// Connect attempts; non-positive resets to the default.
    pub fn retry_count(mut self, count: i32) -> Self {
        self.config.retry_count = positive_or(count, DEFAULT_RETRY_COUNT);
        self
    }

    pub fn cluster_mode(mut self, mode: ClusterMode) -> Self {
        self.config.cluster_mode = mode;
        self
    }

    pub fn master_name(mut self, name: &str) -> Self {
        self.config.master_name = name.to_string();
        self
    }

    /// Set the credential pair.
    ///
    /// With an active scheme (`secure_name` set) the password is stored
    /// encrypted under it. An empty password clears the stored one. If the
    /// password cannot be protected, the previous credentials are kept and a
    /// warning is logged.
    pub fn authorization(mut self, username: &str, password: &str) -> Self {
        if password.is_empty() {
            self.config.username = username.to_string();
            self.config.password = String::new();
            return self;
        }

        let scheme = self.config.secure_name.clone();
        let stored = if scheme.is_empty() {
            Ok(password.to_string())
        } else {
            match &self.protector {
                Some(protector) => protector.encrypt(&scheme, password),
                None => Err(Error::Credential(format!(
                    "no credential protector available for scheme {}",
                    scheme
                ))),
            }
        };

        match stored {
            Ok(stored) => {
                self.config.username = username.to_string();
                self.config.password = stored;
            }
            Err(e) => warn!("⚠ Credentials not updated: {}", e),
        }
        self
    }

    /// Switch the protection scheme, re-encrypting the stored password.
    ///
    /// The switch is all-or-nothing: if the password cannot be moved to the
    /// new scheme, neither the scheme name nor the password changes. A scheme
    /// previously registered by [`CacheConfigBuilder::secure_config`] is
    /// deregistered once the switch succeeds. An empty name stores the
    /// password as plaintext.
    pub fn secure_name(mut self, name: &str) -> Self {
        let target = name.trim().to_string();
        if target == self.config.secure_name {
            return self;
        }

        let rekeyed = if self.config.password.is_empty() {
            Ok(String::new())
        } else {
            match &self.protector {
                Some(protector) => {
                    protector.rekey(&self.config.password, &self.config.secure_name, &target)
                }
                None => Err(Error::Credential(
                    "no credential protector available".to_string(),
                )),
            }
        };

        match rekeyed {
            Ok(password) => {
                self.config.password = password;
                self.config.secure_name = target;
                self.release_owned_scheme();
            }
            Err(e) => warn!("⚠ Credential scheme not switched to {:?}: {}", name, e),
        }
        self
    }

    /// Register a new scheme and move the stored password under it.
    ///
    /// All-or-nothing like [`CacheConfigBuilder::secure_name`]; on failure the
    /// new scheme is deregistered again.
    pub fn secure_config(mut self, name: &str, scheme: SchemeConfig) -> Self {
        let name = name.trim();
        let protector = match &self.protector {
            Some(p) if !name.is_empty() => Arc::clone(p),
            _ => {
                warn!("⚠ Credential scheme {:?} not configured", name);
                return self;
            }
        };

        let plaintext = if self.config.password.is_empty() || self.config.secure_name.is_empty()
        {
            Ok(self.config.password.clone())
        } else {
            protector.decrypt(&self.config.secure_name, &self.config.password)
        };
        let plaintext = match plaintext {
            Ok(p) => p,
            Err(e) => {
                warn!("⚠ Credential scheme {} not configured: {}", name, e);
                return self;
            }
        };

        if !protector.register_scheme(name, scheme) {
            warn!("⚠ Credential scheme {} rejected by protector", name);
            return self;
        }

        let password = if plaintext.is_empty() {
            Ok(String::new())
        } else {
            protector.encrypt(name, &plaintext)
        };

        match password {
            Ok(password) => {
                self.config.password = password;
                if self.config.secure_name != name {
                    self.release_owned_scheme();
                }
                self.config.secure_name = name.to_string();
                self.owned_scheme = Some(name.to_string());
            }
            Err(e) => {
                protector.deregister_scheme(name);
                warn!("⚠ Credential scheme {} not configured: {}", name, e);
            }
        }
        self
    }

    fn release_owned_scheme(&mut self) {
        if let (Some(owned), Some(protector)) = (self.owned_scheme.take(), &self.protector) {
            protector.deregister_scheme(&owned);
        }
    }

    /// Open a server sub-builder seeded with a blank endpoint.
    pub fn server_builder(self) -> ServerBuilder {
        ServerBuilder {
            parent: self,
            endpoint: ServerEndpoint::default(),
            origin: None,
        }
    }

    /// Open a server sub-builder seeded with the entry matching `address`/`port`,
    /// or a blank endpoint when there is none.
    pub fn server_builder_for(self, address: &str, port: u16) -> ServerBuilder {
        let existing = self.config.server(address, port).cloned();
        let origin = existing
            .as_ref()
            .map(|e| (e.address().to_string(), e.port()));
        ServerBuilder {
            parent: self,
            endpoint: existing.unwrap_or_default(),
            origin,
        }
    }

    /// Merge an endpoint into the server list, replacing a matching entry in place.
    ///
    /// # Errors
    /// Returns `Error::Configuration` if the endpoint address is empty.
    pub fn upsert_server(mut self, endpoint: ServerEndpoint) -> Result<Self> {
        self.merge_server(None, endpoint)?;
        Ok(self)
    }

    fn merge_server(
        &mut self,
        origin: Option<(String, u16)>,
        endpoint: ServerEndpoint,
    ) -> Result<()> {
        if endpoint.address().trim().is_empty() {
            return Err(Error::Configuration(
                "server address not configured".to_string(),
            ));
        }

        let servers = &mut self.config.servers;
        let target = servers
            .iter()
            .position(|s| s.same_entry(&endpoint))
            .or_else(|| {
                origin.and_then(|(address, port)| {
                    servers.iter().position(|s| s.matches(&address, port))
                })
            });

        match target {
            Some(index) => servers[index] = endpoint,
            None => servers.push(endpoint),
        }
        Ok(())
    }

    /// Remove the first entry matching `address`/`port`. No-op when absent.
    pub fn remove_server(mut self, address: &str, port: u16) -> Self {
        if let Some(index) = self
            .config
            .servers
            .iter()
            .position(|s| s.matches(address, port))
        {
            self.config.servers.remove(index);
        }
        self
    }

    /// Persist the configuration under `name`.
    ///
    /// # Errors
    /// Returns `Err` if the store fails to write.
    pub fn save(&self, store: &dyn ConfigStore, name: &str) -> Result<()> {
        store.save(&self.config, name)
    }

    /// Finish building.
    pub fn build(self) -> CacheConfig {
        self.config
    }
}

/// Nested builder for one server endpoint.
///
/// Owns its parent; [`ServerBuilder::confirm`] merges the endpoint and hands the
/// parent back.
pub struct ServerBuilder {
    parent: CacheConfigBuilder,
    endpoint: ServerEndpoint,
    origin: Option<(String, u16)>,
}

impl ServerBuilder {
    /// Set the address and leave the port to the provider default.
    pub fn address(self, address: &str) -> Self {
        self.server(address, UNSET_PORT)
    }

    /// Set address and port.
    pub fn server(mut self, address: &str, port: u16) -> Self {
        self.endpoint.set_address(address.trim().to_string());
        self.endpoint.set_port(port);
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.endpoint.set_port(port);
        self
    }

    /// Distribution weight; values below 1 reset to the default weight.
    pub fn weight(mut self, weight: i32) -> Self {
        self.endpoint
            .set_weight(positive_or(weight, DEFAULT_SERVER_WEIGHT));
        self
    }

    /// Merge the endpoint into the parent configuration.
    ///
    /// # Errors
    /// Returns `Error::Configuration("server address not configured")` when no
    /// address was set.
    pub fn confirm(self) -> Result<CacheConfigBuilder> {
        let ServerBuilder {
            mut parent,
            endpoint,
            origin,
        } = self;
        parent.merge_server(origin, endpoint)?;
        Ok(parent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_SERVER_WEIGHT, NEVER_EXPIRE};
    use crate::security::KeyedProtector;
    use crate::store::MemoryConfigStore;

    fn protector() -> Arc<KeyedProtector> {
        let protector = Arc::new(KeyedProtector::new());
        protector.register_scheme("SchemeA", SchemeConfig::new("alpha"));
        protector.register_scheme("SchemeB", SchemeConfig::new("bravo"));
        protector
    }

    #[test]
    fn test_invalid_values_reset_to_defaults() {
        let config = CacheConfigBuilder::new()
            .connect_timeout(0)
            .expire_time(-5)
            .client_pool_size(0)
            .maximum_client(-1)
            .retry_count(0)
            .build();

        assert_eq!(config.connect_timeout(), DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.expire_time(), NEVER_EXPIRE);
        assert_eq!(config.client_pool_size(), 5);
        assert_eq!(config.maximum_client(), DEFAULT_MAXIMUM_CLIENT);
        assert_eq!(config.retry_count(), DEFAULT_RETRY_COUNT);
    }

    #[test]
    fn test_valid_values_accepted() {
        let config = CacheConfigBuilder::new()
            .connect_timeout(5)
            .expire_time(600)
            .client_pool_size(8)
            .maximum_client(64)
            .retry_count(2)
            .build();

        assert_eq!(config.connect_timeout(), 5);
        assert_eq!(config.expire_time(), 600);
        assert_eq!(config.client_pool_size(), 8);
        assert_eq!(config.maximum_client(), 64);
        assert_eq!(config.retry_count(), 2);
    }

    #[test]
    fn test_blank_provider_name_ignored() {
        let config = CacheConfigBuilder::new()
            .provider_name("RedisProvider")
            .provider_name("   ")
            .build();
        assert_eq!(config.provider_name(), "RedisProvider");
    }

    #[test]
    fn test_server_upsert_replaces_in_place() {
        let config = CacheConfigBuilder::new()
            .server_builder()
            .server("host", 11211)
            .weight(1)
            .confirm()
            .unwrap()
            .server_builder()
            .server("host", 11211)
            .weight(2)
            .confirm()
            .unwrap()
            .build();

        assert_eq!(config.servers().len(), 1);
        assert_eq!(config.servers()[0].weight(), 2);
    }

    #[test]
    fn test_server_upsert_case_insensitive() {
        let config = CacheConfigBuilder::new()
            .server_builder()
            .server("Cache.Local", 6379)
            .confirm()
            .unwrap()
            .server_builder()
            .server("cache.local", 6379)
            .weight(3)
            .confirm()
            .unwrap()
            .build();

        assert_eq!(config.servers().len(), 1);
        assert_eq!(config.servers()[0].address(), "cache.local");
    }

    #[test]
    fn test_server_builder_for_existing_entry() {
        let config = CacheConfigBuilder::new()
            .server_builder()
            .server("first", 11211)
            .confirm()
            .unwrap()
            .server_builder()
            .server("second", 11211)
            .confirm()
            .unwrap()
            .server_builder_for("second", 11211)
            .weight(5)
            .confirm()
            .unwrap()
            .build();

        assert_eq!(config.servers().len(), 2);
        assert_eq!(config.servers()[1].address(), "second");
        assert_eq!(config.servers()[1].weight(), 5);
    }

    #[test]
    fn test_server_builder_for_retargeted_entry_keeps_position() {
        let config = CacheConfigBuilder::new()
            .server_builder()
            .server("first", 11211)
            .confirm()
            .unwrap()
            .server_builder()
            .server("second", 11211)
            .confirm()
            .unwrap()
            .server_builder_for("first", 11211)
            .port(11311)
            .confirm()
            .unwrap()
            .build();

        assert_eq!(config.servers().len(), 2);
        assert!(config.servers()[0].matches("first", 11311));
    }

    #[test]
    fn test_server_builder_for_missing_entry_is_blank() {
        let result = CacheConfigBuilder::new()
            .server_builder_for("nowhere", 1)
            .confirm();
        assert!(result.is_err());
    }

    #[test]
    fn test_confirm_without_address_fails() {
        let result = CacheConfigBuilder::new().server_builder().weight(2).confirm();
        match result {
            Err(Error::Configuration(msg)) => assert_eq!(msg, "server address not configured"),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("confirm should fail without an address"),
        }
    }

    #[test]
    fn test_address_only_uses_unset_port_and_default_weight() {
        let config = CacheConfigBuilder::new()
            .server_builder()
            .address("onlyAddress")
            .weight(0)
            .confirm()
            .unwrap()
            .build();

        assert_eq!(config.servers()[0].port(), UNSET_PORT);
        assert_eq!(config.servers()[0].weight(), DEFAULT_SERVER_WEIGHT);
    }

    #[test]
    fn test_remove_server() {
        let builder = CacheConfigBuilder::new()
            .server_builder()
            .server("ServerAddress", 11211)
            .confirm()
            .unwrap()
            .server_builder()
            .server("ServerAddress1", 11211)
            .confirm()
            .unwrap()
            .remove_server("ServerAddress1", 11211)
            .remove_server("absent", 1);

        assert_eq!(builder.config().servers().len(), 1);
        assert_eq!(builder.config().servers()[0].address(), "ServerAddress");
    }

    #[test]
    fn test_authorization_plaintext_without_scheme() {
        let config = CacheConfigBuilder::new()
            .authorization("userName", "passWord")
            .build();
        assert_eq!(config.username(), "userName");
        assert_eq!(config.password(), "passWord");
    }

    #[test]
    fn test_authorization_empty_password_clears() {
        let config = CacheConfigBuilder::new()
            .authorization("userName", "passWord")
            .authorization("userName", "")
            .build();
        assert_eq!(config.password(), "");
    }

    #[test]
    fn test_authorization_encrypts_under_active_scheme() {
        let protector = protector();
        let config = CacheConfigBuilder::new()
            .with_protector(protector.clone())
            .secure_name("SchemeA")
            .authorization("userName", "passWord")
            .build();

        assert_ne!(config.password(), "passWord");
        assert_eq!(
            protector.decrypt("SchemeA", config.password()).unwrap(),
            "passWord"
        );
    }

    #[test]
    fn test_secure_name_switch_reencrypts() {
        let protector = protector();
        let config = CacheConfigBuilder::new()
            .with_protector(protector.clone())
            .secure_name("SchemeA")
            .authorization("userName", "passWord")
            .secure_name("SchemeB")
            .build();

        assert_eq!(config.secure_name(), "SchemeB");
        assert_eq!(
            protector.decrypt("SchemeB", config.password()).unwrap(),
            "passWord"
        );
    }

    #[test]
    fn test_secure_name_switch_is_atomic() {
        let protector = protector();
        let before = CacheConfigBuilder::new()
            .with_protector(protector.clone())
            .secure_name("SchemeA")
            .authorization("userName", "passWord");
        let stored = before.config().password().to_string();

        let after = before.secure_name("Unregistered").build();
        assert_eq!(after.secure_name(), "SchemeA");
        assert_eq!(after.password(), stored);
    }

    #[test]
    fn test_secure_name_without_protector_keeps_plaintext() {
        let config = CacheConfigBuilder::new()
            .authorization("userName", "passWord")
            .secure_name("SchemeA")
            .build();
        assert_eq!(config.secure_name(), "");
        assert_eq!(config.password(), "passWord");
    }

    #[test]
    fn test_secure_config_registers_and_encrypts() {
        let protector = protector();
        let config = CacheConfigBuilder::new()
            .with_protector(protector.clone())
            .authorization("userName", "passWord")
            .secure_config("Custom", SchemeConfig::new("custom-secret"))
            .build();

        assert_eq!(config.secure_name(), "Custom");
        assert!(protector.is_registered("Custom"));
        assert_eq!(
            protector.decrypt("Custom", config.password()).unwrap(),
            "passWord"
        );
    }

    #[test]
    fn test_switch_away_from_owned_scheme_deregisters_it() {
        let protector = protector();
        let config = CacheConfigBuilder::new()
            .with_protector(protector.clone())
            .authorization("userName", "passWord")
            .secure_config("Custom", SchemeConfig::new("custom-secret"))
            .secure_name("SchemeA")
            .build();

        assert!(!protector.is_registered("Custom"));
        assert!(protector.is_registered("SchemeA"));
        assert_eq!(
            protector.decrypt("SchemeA", config.password()).unwrap(),
            "passWord"
        );
    }

    #[test]
    fn test_save_and_load() {
        let store = MemoryConfigStore::new();
        CacheConfigBuilder::new()
            .provider_name("RedisProvider")
            .server_builder()
            .server("localhost", 6379)
            .confirm()
            .unwrap()
            .save(&store, "Demo")
            .unwrap();

        let loaded = CacheConfigBuilder::load(&store, "Demo").unwrap().build();
        assert_eq!(loaded.provider_name(), "RedisProvider");
        assert_eq!(loaded.servers().len(), 1);

        let fresh = CacheConfigBuilder::load(&store, "Other").unwrap().build();
        assert_eq!(fresh, CacheConfig::default());
    }
}
