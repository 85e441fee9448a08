//! Backend provider implementations.
//!
//! A provider adapts one wire protocol to the uniform key-value contract. The
//! lifecycle constructs a provider through its [`crate::registry::ProviderDescriptor`]
//! factory, calls exactly one initialization hook, and from then on only the
//! operation methods are used.

use crate::config::ServerEndpoint;
use crate::error::Result;
use crate::lifecycle::{Credentials, ProviderContext};
use async_trait::async_trait;

#[cfg(feature = "inmemory")]
pub mod inmemory;
#[cfg(feature = "memcached")]
pub mod memcached;
#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "inmemory")]
pub use inmemory::InMemoryProvider;
#[cfg(feature = "memcached")]
pub use memcached::MemcachedProvider;
#[cfg(feature = "redis")]
pub use redis::RedisProvider;

/// Trait for cache provider implementations.
///
/// All operation methods take `&self` so one initialized provider can serve
/// concurrent callers; implementations keep their pools behind interior
/// mutability or cheap clones.
///
/// Expiry values reaching a provider are already resolved: a positive number
/// of seconds, or [`crate::config::NEVER_EXPIRE`].
#[async_trait]
pub trait CacheProvider: Send + Sync {
    /// Port substituted for endpoints configured without one.
    fn default_port(&self) -> u16;

    /// Connect to a single server.
    ///
    /// # Errors
    /// Returns `Error::ConnectionInit` (or `Error::Timeout`) if the server cannot be reached.
    async fn initialize_singleton(
        &mut self,
        context: &ProviderContext,
        endpoint: &ServerEndpoint,
        credentials: &Credentials,
    ) -> Result<()>;

    /// Connect to a multi-server topology selected by `context.cluster_mode()`.
    ///
    /// # Errors
    /// Returns `Error::ConnectionInit` (or `Error::Timeout`) if the topology cannot be reached.
    async fn initialize_cluster(
        &mut self,
        context: &ProviderContext,
        endpoints: &[ServerEndpoint],
        master_name: &str,
        credentials: &Credentials,
    ) -> Result<()>;

    /// Store `value` unconditionally.
    async fn set(&self, key: &str, value: &str, expiry: i32) -> Result<()>;

    /// Store `value` only if `key` is absent.
    async fn add(&self, key: &str, value: &str, expiry: i32) -> Result<()>;

    /// Store `value` only if `key` is present.
    async fn replace(&self, key: &str, value: &str, expiry: i32) -> Result<()>;

    /// Change the expiry of an existing key.
    async fn expire(&self, key: &str, expiry: i32) -> Result<()>;

    /// Refresh the given keys.
    async fn touch(&self, keys: &[&str]) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// # Returns
    /// - `Ok(Some(value))` - Key found
    /// - `Ok(None)` - Cache miss
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Add `step` to the counter at `key`, returning the new value.
    async fn incr(&self, key: &str, step: i64) -> Result<i64>;

    /// Subtract `step` from the counter at `key`, returning the new value.
    async fn decr(&self, key: &str, step: i64) -> Result<i64>;

    /// Release every connection held by the provider. Safe to call on a
    /// provider whose initialization failed or never ran.
    async fn destroy(&mut self);
}
