//! Redis provider.
//!
//! Pools come from deadpool-redis. The topology decides which pools exist:
//!
//! | Topology | Pools |
//! |---|---|
//! | Singleton | one pool to the single endpoint |
//! | Sentinel | one sentinel pool; every new connection asks the sentinels for the current master |
//! | MasterSlave | a write pool to the master, read pools to every replica |
//! | Cluster | one cluster pool seeded with every endpoint |

use super::CacheProvider;
use crate::config::{ClusterMode, ServerEndpoint};
use crate::error::{Error, Result};
use crate::lifecycle::{split_master, Credentials, ProviderContext};
use async_trait::async_trait;
use deadpool_redis::redis::{Cmd, FromRedisValue, RedisError};
use deadpool_redis::{
    cluster, sentinel, Config as PoolConfig, ConnectionAddr, ConnectionInfo, Pool, PoolError,
    RedisConnectionInfo, Runtime,
};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Port of a stock Redis server.
pub const DEFAULT_PORT: u16 = 6379;

/// Which side of a replicated topology a command may run on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Route {
    Read,
    Write,
}

enum Pools {
    Uninitialized,
    Standalone(Pool),
    Replicated {
        master: Pool,
        replicas: Vec<Pool>,
        cursor: AtomicUsize,
    },
    Sentinel(sentinel::Pool),
    Cluster(cluster::Pool),
}

/// Authentication and database settings for `credentials`.
fn redis_info(credentials: &Credentials) -> RedisConnectionInfo {
    RedisConnectionInfo {
        username: credentials.username().map(str::to_string),
        password: credentials.password().map(str::to_string),
        ..Default::default()
    }
}

/// Connection settings for `host:port`. IPv6 literals need no bracketing.
pub fn connection_info(host: &str, port: u16, credentials: &Credentials) -> ConnectionInfo {
    ConnectionInfo {
        addr: ConnectionAddr::Tcp(host.to_string(), port),
        redis: redis_info(credentials),
    }
}

fn endpoint_info(
    context: &ProviderContext,
    endpoint: &ServerEndpoint,
    credentials: &Credentials,
) -> ConnectionInfo {
    connection_info(endpoint.address(), context.server_port(endpoint), credentials)
}

fn pool_error(e: PoolError) -> Error {
    match e {
        PoolError::Timeout(kind) => {
            Error::Timeout(format!("Redis connection wait timed out ({:?})", kind))
        }
        other => Error::Backend(format!("Failed to get Redis connection: {}", other)),
    }
}

fn command_error(command: &str, e: RedisError) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("Redis {} timed out: {}", command, e))
    } else {
        Error::Backend(format!("Redis {} failed: {}", command, e))
    }
}

fn pool_config(context: &ProviderContext) -> deadpool_redis::PoolConfig {
    let mut pool = deadpool_redis::PoolConfig::new(context.maximum_client() as usize);
    pool.timeouts.wait = Some(context.connect_timeout());
    pool.timeouts.create = Some(context.connect_timeout());
    pool.timeouts.recycle = Some(context.connect_timeout());
    pool
}

fn create_pool(info: ConnectionInfo, context: &ProviderContext) -> Result<Pool> {
    let mut cfg = PoolConfig::from_connection_info(info);
    cfg.pool = Some(pool_config(context));
    cfg.create_pool(Some(Runtime::Tokio1))
        .map_err(|e| Error::ConnectionInit(format!("Failed to create Redis pool: {}", e)))
}

async fn ping(pool: &Pool, target: &str) -> Result<()> {
    let mut conn = pool.get().await.map_err(|e| {
        Error::ConnectionInit(format!("Failed to connect to Redis at {}: {}", target, e))
    })?;
    let pong: String = deadpool_redis::redis::cmd("PING")
        .query_async(&mut *conn)
        .await
        .map_err(|e| Error::ConnectionInit(format!("Redis PING to {} failed: {}", target, e)))?;
    if pong.contains("PONG") {
        Ok(())
    } else {
        Err(Error::ConnectionInit(format!(
            "Unexpected PING reply from {}: {}",
            target, pong
        )))
    }
}

/// Sentinel pool settings: sentinels are contacted without credentials, the
/// resolved master with `credentials`.
fn sentinel_config(
    context: &ProviderContext,
    sentinels: &[ServerEndpoint],
    master_name: &str,
    credentials: &Credentials,
) -> sentinel::Config {
    let mut cfg = sentinel::Config::from_urls(
        Vec::<String>::new(),
        master_name.to_string(),
        sentinel::SentinelServerType::Master,
    );
    cfg.urls = None;
    cfg.connections = Some(
        sentinels
            .iter()
            .map(|s| endpoint_info(context, s, &Credentials::default()))
            .collect(),
    );
    cfg.sentinel_connection_info = Some(sentinel::SentinelNodeConnectionInfo {
        tls_mode: None,
        redis_connection_info: Some(redis_info(credentials)),
    });
    cfg.pool = Some(pool_config(context));
    cfg
}

fn cluster_config(
    context: &ProviderContext,
    seeds: &[ServerEndpoint],
    credentials: &Credentials,
) -> cluster::Config {
    let mut cfg = cluster::Config::from_urls(Vec::<String>::new());
    cfg.urls = None;
    cfg.connections = Some(
        seeds
            .iter()
            .map(|e| endpoint_info(context, e, credentials))
            .collect(),
    );
    cfg.pool = Some(pool_config(context));
    cfg
}

/// Redis provider with connection pooling.
///
/// # Example
///
/// ```no_run
/// use cache_bridge::builder::CacheConfigBuilder;
/// use cache_bridge::manager::CacheManager;
///
/// # async fn example() -> cache_bridge::Result<()> {
/// let config = CacheConfigBuilder::new()
///     .provider_name("RedisProvider")
///     .server_builder()
///     .address("localhost")
///     .confirm()?
///     .build();
///
/// let manager = CacheManager::new();
/// if manager.register("sessions", config).await {
///     let client = manager.client("sessions").expect("registered");
///     client.set("token", "abc").await?;
/// }
/// # Ok(())
/// # }
/// ```
pub struct RedisProvider {
    pools: Pools,
}

impl Default for RedisProvider {
    fn default() -> Self {
        RedisProvider {
            pools: Pools::Uninitialized,
        }
    }
}

impl RedisProvider {
    pub fn new() -> Self {
        Self::default()
    }

    async fn run<T: FromRedisValue>(&self, route: Route, name: &str, cmd: &Cmd) -> Result<T> {
        match &self.pools {
            Pools::Uninitialized => Err(Error::Backend(
                "Redis provider is not initialized".to_string(),
            )),
            Pools::Standalone(pool) => Self::run_on(pool, name, cmd).await,
            Pools::Replicated {
                master,
                replicas,
                cursor,
            } => {
                let pool = if route == Route::Read && !replicas.is_empty() {
                    &replicas[cursor.fetch_add(1, Ordering::Relaxed) % replicas.len()]
                } else {
                    master
                };
                Self::run_on(pool, name, cmd).await
            }
            Pools::Sentinel(pool) => {
                let mut conn = pool.get().await.map_err(pool_error)?;
                match cmd.query_async(&mut *conn).await {
                    Ok(value) => Ok(value),
                    Err(e) => {
                        // Idle connections may point at a demoted master; new ones re-resolve it.
                        drop(conn);
                        let purged = pool.retain(|_, _| false).removed.len();
                        warn!(
                            "⚠ Redis {} failed via sentinel, dropped {} pooled connection(s)",
                            name, purged
                        );
                        Err(command_error(name, e))
                    }
                }
            }
            Pools::Cluster(pool) => {
                let mut conn = pool.get().await.map_err(pool_error)?;
                cmd.query_async(&mut *conn)
                    .await
                    .map_err(|e| command_error(name, e))
            }
        }
    }

    async fn run_on<T: FromRedisValue>(pool: &Pool, name: &str, cmd: &Cmd) -> Result<T> {
        let mut conn = pool.get().await.map_err(pool_error)?;
        cmd.query_async(&mut *conn)
            .await
            .map_err(|e| command_error(name, e))
    }

    async fn store(
        &self,
        name: &str,
        key: &str,
        value: &str,
        expiry: i32,
        condition: Option<&str>,
    ) -> Result<bool> {
        let mut cmd = deadpool_redis::redis::cmd("SET");
        cmd.arg(key).arg(value);
        if expiry > 0 {
            cmd.arg("EX").arg(expiry);
        }
        if let Some(condition) = condition {
            cmd.arg(condition);
        }
        let reply: Option<String> = self.run(Route::Write, name, &cmd).await?;
        Ok(reply.is_some())
    }
}

#[async_trait]
impl CacheProvider for RedisProvider {
    fn default_port(&self) -> u16 {
        DEFAULT_PORT
    }

    async fn initialize_singleton(
        &mut self,
        context: &ProviderContext,
        endpoint: &ServerEndpoint,
        credentials: &Credentials,
    ) -> Result<()> {
        let address = context.server_address(endpoint);
        let pool = create_pool(endpoint_info(context, endpoint, credentials), context)?;
        ping(&pool, &address).await?;

        info!(
            "✓ Redis provider initialized: {} (max clients: {})",
            address,
            context.maximum_client()
        );
        self.pools = Pools::Standalone(pool);
        Ok(())
    }

    async fn initialize_cluster(
        &mut self,
        context: &ProviderContext,
        endpoints: &[ServerEndpoint],
        master_name: &str,
        credentials: &Credentials,
    ) -> Result<()> {
        match context.cluster_mode() {
            ClusterMode::Sentinel => {
                let pool = sentinel_config(context, endpoints, master_name, credentials)
                    .create_pool(Some(Runtime::Tokio1))
                    .map_err(|e| {
                        Error::ConnectionInit(format!("Failed to create Redis sentinel pool: {}", e))
                    })?;

                let mut conn = pool.get().await.map_err(|e| {
                    Error::ConnectionInit(format!(
                        "No sentinel could resolve master {}: {}",
                        master_name, e
                    ))
                })?;
                let _: String = deadpool_redis::redis::cmd("PING")
                    .query_async(&mut *conn)
                    .await
                    .map_err(|e| {
                        Error::ConnectionInit(format!(
                            "Redis PING to master {} failed: {}",
                            master_name, e
                        ))
                    })?;
                drop(conn);

                info!(
                    "✓ Redis provider initialized via {} sentinel(s): master {}",
                    endpoints.len(),
                    master_name
                );
                self.pools = Pools::Sentinel(pool);
            }
            ClusterMode::MasterSlave => {
                let (master, replicas) = split_master(endpoints, master_name)?;
                let master_address = context.server_address(&master);
                let master_pool =
                    create_pool(endpoint_info(context, &master, credentials), context)?;
                ping(&master_pool, &master_address).await?;

                let replica_pools = replicas
                    .iter()
                    .map(|r| create_pool(endpoint_info(context, r, credentials), context))
                    .collect::<Result<Vec<_>>>()?;

                info!(
                    "✓ Redis provider initialized: master {} with {} replica(s)",
                    master_address,
                    replica_pools.len()
                );
                self.pools = Pools::Replicated {
                    master: master_pool,
                    replicas: replica_pools,
                    cursor: AtomicUsize::new(0),
                };
            }
            ClusterMode::Cluster | ClusterMode::Singleton => {
                let pool = cluster_config(context, endpoints, credentials)
                    .create_pool(Some(Runtime::Tokio1))
                    .map_err(|e| {
                        Error::ConnectionInit(format!("Failed to create Redis cluster pool: {}", e))
                    })?;

                let mut conn = pool.get().await.map_err(|e| {
                    Error::ConnectionInit(format!("Failed to connect to Redis cluster: {}", e))
                })?;
                let _: String = deadpool_redis::redis::cmd("PING")
                    .query_async(&mut *conn)
                    .await
                    .map_err(|e| {
                        Error::ConnectionInit(format!("Redis cluster PING failed: {}", e))
                    })?;
                drop(conn);

                info!(
                    "✓ Redis provider initialized: cluster of {} seed node(s)",
                    endpoints.len()
                );
                self.pools = Pools::Cluster(pool);
            }
        }
        Ok(())
    }

    async fn set(&self, key: &str, value: &str, expiry: i32) -> Result<()> {
        self.store("SET", key, value, expiry, None).await?;
        debug!("✓ Redis SET {} (expiry: {})", key, expiry);
        Ok(())
    }

    async fn add(&self, key: &str, value: &str, expiry: i32) -> Result<()> {
        let stored = self.store("SET NX", key, value, expiry, Some("NX")).await?;
        debug!("✓ Redis ADD {} -> {}", key, if stored { "STORED" } else { "EXISTS" });
        Ok(())
    }

    async fn replace(&self, key: &str, value: &str, expiry: i32) -> Result<()> {
        let stored = self.store("SET XX", key, value, expiry, Some("XX")).await?;
        debug!("✓ Redis REPLACE {} -> {}", key, if stored { "STORED" } else { "MISSING" });
        Ok(())
    }

    async fn expire(&self, key: &str, expiry: i32) -> Result<()> {
        let _: i64 = if expiry > 0 {
            let mut cmd = deadpool_redis::redis::cmd("EXPIRE");
            cmd.arg(key).arg(expiry);
            self.run(Route::Write, "EXPIRE", &cmd).await?
        } else {
            let mut cmd = deadpool_redis::redis::cmd("PERSIST");
            cmd.arg(key);
            self.run(Route::Write, "PERSIST", &cmd).await?
        };
        debug!("✓ Redis EXPIRE {} -> {}", key, expiry);
        Ok(())
    }

    async fn touch(&self, keys: &[&str]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }

        // Keys of one TOUCH must share a hash slot on a cluster.
        if matches!(self.pools, Pools::Cluster(_)) {
            let commands: Vec<_> = keys
                .iter()
                .map(|key| {
                    let mut cmd = deadpool_redis::redis::cmd("TOUCH");
                    cmd.arg(*key);
                    cmd
                })
                .collect();
            futures::future::try_join_all(
                commands
                    .iter()
                    .map(|cmd| self.run::<i64>(Route::Write, "TOUCH", cmd)),
            )
            .await?;
        } else {
            let mut cmd = deadpool_redis::redis::cmd("TOUCH");
            cmd.arg(keys);
            let _: i64 = self.run(Route::Write, "TOUCH", &cmd).await?;
        }

        debug!("✓ Redis TOUCH {} keys", keys.len());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut cmd = deadpool_redis::redis::cmd("DEL");
        cmd.arg(key);
        let _: i64 = self.run(Route::Write, "DEL", &cmd).await?;
        debug!("✓ Redis DELETE {}", key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut cmd = deadpool_redis::redis::cmd("GET");
        cmd.arg(key);
        let value: Option<String> = self.run(Route::Read, "GET", &cmd).await?;

        if value.is_some() {
            debug!("✓ Redis GET {} -> HIT", key);
        } else {
            debug!("✓ Redis GET {} -> MISS", key);
        }
        Ok(value)
    }

    async fn incr(&self, key: &str, step: i64) -> Result<i64> {
        let mut cmd = deadpool_redis::redis::cmd("INCRBY");
        cmd.arg(key).arg(step);
        let value: i64 = self.run(Route::Write, "INCRBY", &cmd).await?;
        debug!("✓ Redis INCRBY {} {} -> {}", key, step, value);
        Ok(value)
    }

    async fn decr(&self, key: &str, step: i64) -> Result<i64> {
        let mut cmd = deadpool_redis::redis::cmd("DECRBY");
        cmd.arg(key).arg(step);
        let value: i64 = self.run(Route::Write, "DECRBY", &cmd).await?;
        debug!("✓ Redis DECRBY {} {} -> {}", key, step, value);
        Ok(value)
    }

    async fn destroy(&mut self) {
        match std::mem::replace(&mut self.pools, Pools::Uninitialized) {
            Pools::Uninitialized => {}
            Pools::Standalone(pool) => pool.close(),
            Pools::Replicated {
                master, replicas, ..
            } => {
                master.close();
                replicas.iter().for_each(|p| p.close());
            }
            Pools::Sentinel(pool) => pool.close(),
            Pools::Cluster(pool) => pool.close(),
        }
        debug!("✓ Redis provider destroyed");
    }
}
