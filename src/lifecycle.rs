//! Provider lifecycle: from a [`CacheConfig`] to one live connection strategy.
//!
//! Initialization is a one-way transition. [`resolve_topology`] decides the
//! branch from the endpoint count and cluster mode, [`Credentials::resolve`]
//! recovers the plaintext password once, and [`initialize`] drives a freshly
//! constructed provider through the matching hook with bounded retry.

use crate::config::{
    CacheConfig, ClusterMode, ServerEndpoint, DEFAULT_SECURE_NAME, UNSET_EXPIRY, UNSET_PORT,
};
use crate::error::{Error, Result};
use crate::provider::CacheProvider;
use crate::registry::ProviderDescriptor;
use crate::security::CredentialProtector;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// First retry delay; each later one doubles.
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Longest single retry delay.
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Resolved defaults shared by every provider implementation.
///
/// Providers keep a copy of the context they were initialized with and use it
/// for port and expiry fallback instead of re-reading the configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderContext {
    default_port: u16,
    default_expiry: i32,
    connect_timeout: Duration,
    retry_count: u32,
    client_pool_size: u32,
    maximum_client: u32,
    cluster_mode: ClusterMode,
}

impl ProviderContext {
    /// Capture the defaults of `config` for a provider whose default port is `default_port`.
    ///
    /// A multi-server configuration declared `Singleton` is carried as `Cluster`.
    pub fn new(config: &CacheConfig, default_port: u16) -> Self {
        let cluster_mode = match config.cluster_mode() {
            ClusterMode::Singleton if config.servers().len() > 1 => ClusterMode::Cluster,
            mode => mode,
        };
        ProviderContext {
            default_port,
            default_expiry: config.expire_time(),
            connect_timeout: Duration::from_secs(u64::from(config.connect_timeout().max(1))),
            retry_count: config.retry_count().max(1),
            client_pool_size: config.client_pool_size().max(1),
            maximum_client: config.maximum_client().max(1),
            cluster_mode,
        }
    }

    /// Port to dial for `endpoint`: its own port, or the provider default when unset.
    pub fn server_port(&self, endpoint: &ServerEndpoint) -> u16 {
        if endpoint.port() == UNSET_PORT {
            self.default_port
        } else {
            endpoint.port()
        }
    }

    /// `host:port` for `endpoint` with the port fallback applied.
    pub fn server_address(&self, endpoint: &ServerEndpoint) -> String {
        format!("{}:{}", endpoint.address(), self.server_port(endpoint))
    }

    /// Operation expiry with the default substituted for [`UNSET_EXPIRY`].
    pub fn expiry_time(&self, expiry: i32) -> i32 {
        if expiry == UNSET_EXPIRY {
            self.default_expiry
        } else {
            expiry
        }
    }

    pub fn default_port(&self) -> u16 {
        self.default_port
    }

    pub fn default_expiry(&self) -> i32 {
        self.default_expiry
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
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
}

/// Connection strategy chosen for a configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Topology {
    Singleton(ServerEndpoint),
    Sentinel {
        sentinels: Vec<ServerEndpoint>,
        master_name: String,
    },
    MasterSlave {
        master: ServerEndpoint,
        replicas: Vec<ServerEndpoint>,
    },
    Cluster(Vec<ServerEndpoint>),
}

impl Topology {
    pub fn is_singleton(&self) -> bool {
        matches!(self, Topology::Singleton(_))
    }

    /// Cluster mode the topology was resolved to.
    pub fn mode(&self) -> ClusterMode {
        match self {
            Topology::Singleton(_) => ClusterMode::Singleton,
            Topology::Sentinel { .. } => ClusterMode::Sentinel,
            Topology::MasterSlave { .. } => ClusterMode::MasterSlave,
            Topology::Cluster(_) => ClusterMode::Cluster,
        }
    }
}

/// Split `endpoints` into the master (address equal to `master_name`) and the replicas.
///
/// # Errors
/// Returns `Error::Configuration` unless exactly one endpoint matches.
pub fn split_master(
    endpoints: &[ServerEndpoint],
    master_name: &str,
) -> Result<(ServerEndpoint, Vec<ServerEndpoint>)> {
    let (masters, replicas): (Vec<_>, Vec<_>) = endpoints
        .iter()
        .cloned()
        .partition(|e| e.address().eq_ignore_ascii_case(master_name));

    match <[ServerEndpoint; 1]>::try_from(masters) {
        Ok([master]) => Ok((master, replicas)),
        Err(found) => Err(Error::Configuration(format!(
            "master name '{}' matches {} servers, expected exactly one",
            master_name,
            found.len()
        ))),
    }
}

/// Decide the connection strategy for `config`.
///
/// Pure: depends only on the endpoint list, the cluster mode and the master name.
///
/// # Errors
/// Returns `Error::Configuration("no server configured")` for an empty endpoint
/// list, and the topology errors of [`split_master`] / missing sentinel master.
pub fn resolve_topology(config: &CacheConfig) -> Result<Topology> {
    let servers = config.servers();
    match servers {
        [] => Err(Error::Configuration("no server configured".to_string())),
        [only] => Ok(Topology::Singleton(only.clone())),
        _ => match config.cluster_mode() {
            ClusterMode::Sentinel => {
                if config.master_name().trim().is_empty() {
                    return Err(Error::Configuration(
                        "sentinel mode requires a master name".to_string(),
                    ));
                }
                Ok(Topology::Sentinel {
                    sentinels: servers.to_vec(),
                    master_name: config.master_name().to_string(),
                })
            }
            ClusterMode::MasterSlave => {
                let (master, replicas) = split_master(servers, config.master_name())?;
                Ok(Topology::MasterSlave { master, replicas })
            }
            ClusterMode::Cluster | ClusterMode::Singleton => {
                Ok(Topology::Cluster(servers.to_vec()))
            }
        },
    }
}

/// Plaintext credential pair handed to a provider's initialization hook.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .finish()
    }
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Recover the plaintext credentials of `config`.
    ///
    /// The stored password is decrypted under the configuration's scheme, or
    /// [`DEFAULT_SECURE_NAME`] when none is named. When no scheme was named and
    /// the default one is not registered, the stored value is already plaintext.
    ///
    /// # Errors
    /// Returns `Error::Credential` if decryption fails or an explicitly named
    /// scheme is unavailable.
    pub fn resolve(
        config: &CacheConfig,
        protector: Option<&dyn CredentialProtector>,
    ) -> Result<Self> {
        let stored = config.password();
        if stored.is_empty() {
            return Ok(Credentials::new(config.username(), ""));
        }

        let explicit = !config.secure_name().is_empty();
        let scheme = if explicit {
            config.secure_name()
        } else {
            DEFAULT_SECURE_NAME
        };

        match protector {
            Some(protector) if protector.is_registered(scheme) => {
                let password = protector.decrypt(scheme, stored).map_err(|e| match e {
                    Error::Credential(msg) => Error::Credential(msg),
                    other => Error::Credential(other.to_string()),
                })?;
                Ok(Credentials::new(config.username(), password))
            }
            _ if explicit => Err(Error::Credential(format!(
                "credential scheme {} is not registered",
                scheme
            ))),
            _ => Ok(Credentials::new(config.username(), stored)),
        }
    }

    /// Username, `None` when blank.
    pub fn username(&self) -> Option<&str> {
        Some(self.username.as_str()).filter(|u| !u.is_empty())
    }

    /// Plaintext password, `None` when blank.
    pub fn password(&self) -> Option<&str> {
        Some(self.password.as_str()).filter(|p| !p.is_empty())
    }
}

/// A provider that completed initialization, with the context it was built for.
pub struct ActiveProvider {
    pub(crate) provider: Box<dyn CacheProvider>,
    pub(crate) context: ProviderContext,
    pub(crate) topology: Topology,
}

impl ActiveProvider {
    pub fn context(&self) -> &ProviderContext {
        &self.context
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }
}

async fn connect(
    provider: &mut dyn CacheProvider,
    context: &ProviderContext,
    topology: &Topology,
    master_name: &str,
    credentials: &Credentials,
) -> Result<()> {
    match topology {
        Topology::Singleton(endpoint) => {
            provider
                .initialize_singleton(context, endpoint, credentials)
                .await
        }
        Topology::Sentinel { sentinels, .. } => {
            provider
                .initialize_cluster(context, sentinels, master_name, credentials)
                .await
        }
        Topology::MasterSlave { master, replicas } => {
            let mut endpoints = Vec::with_capacity(replicas.len() + 1);
            endpoints.push(master.clone());
            endpoints.extend(replicas.iter().cloned());
            provider
                .initialize_cluster(context, &endpoints, master_name, credentials)
                .await
        }
        Topology::Cluster(seeds) => {
            provider
                .initialize_cluster(context, seeds, master_name, credentials)
                .await
        }
    }
}

/// Delay before retry number `attempt` (1-based): 100ms, 200ms, 400ms, ... up to [`MAX_BACKOFF`].
pub(crate) fn backoff(attempt: u32) -> Duration {
    2_u32
        .checked_pow(attempt.saturating_sub(1))
        .and_then(|factor| INITIAL_BACKOFF.checked_mul(factor))
        .map_or(MAX_BACKOFF, |delay| delay.min(MAX_BACKOFF))
}

/// Construct and initialize the provider described by `descriptor` for `config`.
///
/// Failed attempts are retried up to `retry_count` times in total with
/// exponential backoff. Attempts and backoff delays share one budget of
/// `connect_timeout × retry_count`: an attempt is cut short at the end of the
/// budget, and no retry starts when its delay would not fit. The
/// provider of a failed attempt is destroyed before the next attempt or
/// before the error is returned.
///
/// # Errors
/// - `Error::Configuration` if the configuration has no usable topology
/// - `Error::Credential` if the password cannot be recovered
/// - `Error::ConnectionInit` if every connect attempt failed
pub async fn initialize(
    descriptor: &ProviderDescriptor,
    config: &CacheConfig,
    protector: Option<&dyn CredentialProtector>,
) -> Result<ActiveProvider> {
    config.validate()?;
    let topology = resolve_topology(config)?;
    let credentials = Credentials::resolve(config, protector)?;
    let context = ProviderContext::new(config, descriptor.default_port());
    let max_attempts = context.retry_count();
    let deadline = Instant::now() + context.connect_timeout().saturating_mul(max_attempts);

    let mut attempts = 0;
    loop {
        attempts += 1;
        let attempt_timeout = context
            .connect_timeout()
            .min(deadline.saturating_duration_since(Instant::now()));

        let mut provider = descriptor.create();
        let attempt = tokio::time::timeout(
            attempt_timeout,
            connect(
                provider.as_mut(),
                &context,
                &topology,
                config.master_name(),
                &credentials,
            ),
        )
        .await;

        let error = match attempt {
            Ok(Ok(())) => {
                info!(
                    "✓ {} initialized ({} topology, {} server(s))",
                    descriptor.name(),
                    topology.mode(),
                    config.servers().len()
                );
                return Ok(ActiveProvider {
                    provider,
                    context,
                    topology,
                });
            }
            Ok(Err(e)) => e,
            Err(_) => Error::Timeout(format!(
                "connect attempt exceeded {:?}",
                attempt_timeout
            )),
        };

        provider.destroy().await;

        let fatal = matches!(error, Error::Configuration(_) | Error::Credential(_));
        let delay = backoff(attempts);
        let remaining = deadline.saturating_duration_since(Instant::now());
        if fatal || attempts >= max_attempts || delay >= remaining {
            return Err(match error {
                Error::Configuration(_) | Error::Credential(_) | Error::ConnectionInit(_) => error,
                other => Error::ConnectionInit(other.to_string()),
            });
        }

        debug!(
            "{} initialization failed (attempt {}/{}): {}, retrying...",
            descriptor.name(),
            attempts,
            max_attempts,
            error
        );

        tokio::time::sleep(delay).await;
    }
}
