//! Cache configuration model.
//!
//! A [`CacheConfig`] describes one cache's complete connection policy: which
//! provider to use, pooling/timeout/retry limits, default expiry, topology and
//! credentials, plus the ordered list of [`ServerEndpoint`]s.
//!
//! Values are immutable by convention. Use [`crate::builder::CacheConfigBuilder`]
//! to construct or mutate one; the builder enforces the fallback-to-default rules.
//!
//! # Wire format
//!
//! ```
//! use cache_bridge::config::{CacheConfig, ClusterMode};
//!
//! let json = r#"{
//!     "provider_name": "MemcachedProvider",
//!     "expire_time": 300,
//!     "cluster_mode": "Cluster",
//!     "server_config": [
//!         { "server_address": "cache1", "server_port": 11211, "server_weight": 2 },
//!         { "server_address": "cache2" }
//!     ]
//! }"#;
//!
//! let config = CacheConfig::from_json(json).unwrap();
//! assert_eq!(config.cluster_mode(), ClusterMode::Cluster);
//! assert_eq!(config.client_pool_size(), 5);
//! assert_eq!(config.servers()[1].port(), 0);
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default connect timeout, in seconds.
pub const DEFAULT_CONNECT_TIMEOUT: u32 = 1;
/// Default number of connect attempts.
pub const DEFAULT_RETRY_COUNT: u32 = 3;
/// Expiry value meaning "never expire". Passed through to the backend unchanged.
pub const NEVER_EXPIRE: i32 = -1;
/// Default expiry applied when an operation does not specify one.
pub const DEFAULT_EXPIRE_TIME: i32 = NEVER_EXPIRE;
/// Default number of idle clients kept per pool.
pub const DEFAULT_CLIENT_POOL_SIZE: u32 = 5;
/// Default upper bound of live clients per pool.
pub const DEFAULT_MAXIMUM_CLIENT: u32 = 500;
/// Default endpoint weight for weighted distribution.
pub const DEFAULT_SERVER_WEIGHT: u32 = 1;
/// Endpoint port meaning "use the provider's declared default port".
pub const UNSET_PORT: u16 = 0;
/// Operation expiry meaning "use the configuration's default expiry".
pub const UNSET_EXPIRY: i32 = 0;
/// Counter result returned when `incr`/`decr` did not reach the backend.
pub const NOOP_COUNTER: i64 = -1;
/// Credential scheme consulted when a configuration names none.
pub const DEFAULT_SECURE_NAME: &str = "Cache_Secure";
/// Name used for the default persisted configuration.
pub const DEFAULT_CACHE_NAME: &str = "Default_Cache";

/// Multi-server connection strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ClusterMode {
    /// One server. Also the declared mode of most single-endpoint configurations.
    #[default]
    Singleton,
    /// Endpoints are sentinel nodes monitoring the master group named by `master_name`.
    Sentinel,
    /// Endpoint whose address equals `master_name` takes writes, the others serve reads.
    #[serde(rename = "Master_Slave", alias = "MasterSlave")]
    MasterSlave,
    /// Endpoints are cluster seed nodes; the client discovers slots itself.
    Cluster,
}

impl fmt::Display for ClusterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterMode::Singleton => write!(f, "Singleton"),
            ClusterMode::Sentinel => write!(f, "Sentinel"),
            ClusterMode::MasterSlave => write!(f, "Master_Slave"),
            ClusterMode::Cluster => write!(f, "Cluster"),
        }
    }
}

impl FromStr for ClusterMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Singleton" => Ok(ClusterMode::Singleton),
            "Sentinel" => Ok(ClusterMode::Sentinel),
            "Master_Slave" | "MasterSlave" => Ok(ClusterMode::MasterSlave),
            "Cluster" => Ok(ClusterMode::Cluster),
            other => Err(Error::Configuration(format!(
                "unknown cluster mode: {}",
                other
            ))),
        }
    }
}

/// One backend network target.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    #[serde(rename = "server_address")]
    address: String,
    #[serde(rename = "server_port", default)]
    port: u16,
    #[serde(rename = "server_weight", default = "default_weight")]
    weight: u32,
}

fn default_weight() -> u32 {
    DEFAULT_SERVER_WEIGHT
}

impl Default for ServerEndpoint {
    fn default() -> Self {
        ServerEndpoint {
            address: String::new(),
            port: UNSET_PORT,
            weight: DEFAULT_SERVER_WEIGHT,
        }
    }
}

impl ServerEndpoint {
    /// Create an endpoint. A weight below 1 is raised to the default weight.
    pub fn new(address: impl Into<String>, port: u16, weight: u32) -> Self {
        ServerEndpoint {
            address: address.into(),
            port,
            weight: if weight >= 1 {
                weight
            } else {
                DEFAULT_SERVER_WEIGHT
            },
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Configured port; [`UNSET_PORT`] defers to the provider default.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn weight(&self) -> u32 {
        self.weight.max(DEFAULT_SERVER_WEIGHT)
    }

    /// Entry identity: address compared case-insensitively, port exactly.
    pub fn matches(&self, address: &str, port: u16) -> bool {
        self.address.eq_ignore_ascii_case(address) && self.port == port
    }

    /// Same entry as `other` under the identity rule of [`ServerEndpoint::matches`].
    pub fn same_entry(&self, other: &ServerEndpoint) -> bool {
        self.matches(&other.address, other.port)
    }

    pub(crate) fn set_address(&mut self, address: String) {
        self.address = address;
    }

    pub(crate) fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    pub(crate) fn set_weight(&mut self, weight: u32) {
        self.weight = weight;
    }
}

/// One cache's complete connection policy.
///
/// The password is held in its protected form: encrypted under `secure_name`
/// when a credential scheme is active, plaintext otherwise.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub(crate) provider_name: String,
    pub(crate) secure_name: String,
    pub(crate) connect_timeout: u32,
    pub(crate) retry_count: u32,
    pub(crate) expire_time: i32,
    pub(crate) client_pool_size: u32,
    pub(crate) maximum_client: u32,
    pub(crate) cluster_mode: ClusterMode,
    pub(crate) master_name: String,
    pub(crate) username: String,
    pub(crate) password: String,
    #[serde(rename = "server_config")]
    pub(crate) servers: Vec<ServerEndpoint>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            provider_name: String::new(),
            secure_name: String::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry_count: DEFAULT_RETRY_COUNT,
            expire_time: DEFAULT_EXPIRE_TIME,
            client_pool_size: DEFAULT_CLIENT_POOL_SIZE,
            maximum_client: DEFAULT_MAXIMUM_CLIENT,
            cluster_mode: ClusterMode::Singleton,
            master_name: String::new(),
            username: String::new(),
            password: String::new(),
            servers: Vec::new(),
        }
    }
}

// Keeps the stored password out of logs.
impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("provider_name", &self.provider_name)
            .field("secure_name", &self.secure_name)
            .field("connect_timeout", &self.connect_timeout)
            .field("retry_count", &self.retry_count)
            .field("expire_time", &self.expire_time)
            .field("client_pool_size", &self.client_pool_size)
            .field("maximum_client", &self.maximum_client)
            .field("cluster_mode", &self.cluster_mode)
            .field("master_name", &self.master_name)
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .field("servers", &self.servers)
            .finish()
    }
}

impl CacheConfig {
    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    /// Credential scheme protecting the stored password (empty = none chosen).
    pub fn secure_name(&self) -> &str {
        &self.secure_name
    }

    /// Connect timeout in seconds.
    pub fn connect_timeout(&self) -> u32 {
        self.connect_timeout
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Default expiry in seconds, [`NEVER_EXPIRE`] for no expiry.
    pub fn expire_time(&self) -> i32 {
        self.expire_time
    }

    pub fn client_pool_size(&self) -> u32 {
        self.client_pool_size
    }

    pub fn maximum_client(&self) -> u32 {
        self.maximum_client
    }

    pub fn cluster_mode(&self) -> ClusterMode {
        self.cluster_mode
    }

    pub fn master_name(&self) -> &str {
        &self.master_name
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Stored (protected) password.
    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn servers(&self) -> &[ServerEndpoint] {
        &self.servers
    }

    /// Find the endpoint matching `address`/`port`.
    pub fn server(&self, address: &str, port: u16) -> Option<&ServerEndpoint> {
        self.servers.iter().find(|s| s.matches(address, port))
    }

    /// Parse a configuration from its JSON form. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Render the configuration as pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check the structural invariants needed before a provider can be initialized.
    ///
    /// # Errors
    /// Returns `Error::Configuration` when:
    /// - The provider name is blank
    /// - No server endpoint is configured
    /// - Two endpoints are the same entry
    /// - A multi-server Sentinel topology has no master name
    /// - A multi-server MasterSlave topology's master name does not match exactly one endpoint
    pub fn validate(&self) -> Result<()> {
        if self.provider_name.trim().is_empty() {
            return Err(Error::Configuration("provider name not configured".into()));
        }
        if self.servers.is_empty() {
            return Err(Error::Configuration("no server configured".into()));
        }
        for (i, server) in self.servers.iter().enumerate() {
            if server.address.trim().is_empty() {
                return Err(Error::Configuration(
                    "server address not configured".into(),
                ));
            }
            if self.servers[i + 1..].iter().any(|s| s.same_entry(server)) {
                return Err(Error::Configuration(format!(
                    "duplicate server entry {}:{}",
                    server.address, server.port
                )));
            }
        }

        if self.servers.len() > 1 {
            match self.cluster_mode {
                ClusterMode::Sentinel if self.master_name.trim().is_empty() => {
                    return Err(Error::Configuration(
                        "sentinel mode requires a master name".into(),
                    ));
                }
                ClusterMode::MasterSlave => {
                    let masters = self
                        .servers
                        .iter()
                        .filter(|s| s.address.eq_ignore_ascii_case(&self.master_name))
                        .count();
                    if masters != 1 {
                        return Err(Error::Configuration(format!(
                            "master name '{}' matches {} servers, expected exactly one",
                            self.master_name, masters
                        )));
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }
}
