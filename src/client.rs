//! Cache client facade.
//!
//! [`CacheClient`] is the type application code calls for cache operations.
//! It wraps exactly one initialized provider and applies the shared rules:
//!
//! - Two-argument writes use the configuration's default expiry
//! - `get` on a blank key is a miss, `incr`/`decr` on a blank key return
//!   [`NOOP_COUNTER`]; neither reaches the backend
//! - Backend timeouts propagate as retryable [`Error::Timeout`]; any other
//!   backend failure is logged, reported to metrics and degraded to the
//!   operation's no-op result
//! - `destroy` is idempotent

use crate::config::{CacheConfig, NOOP_COUNTER, UNSET_EXPIRY};
use crate::error::{Error, Result};
use crate::lifecycle::{self, ActiveProvider, ProviderContext, Topology};
use crate::observability::{CacheMetrics, NoOpMetrics};
use crate::provider::CacheProvider;
use crate::registry::ProviderDescriptor;
use crate::security::CredentialProtector;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{RwLock, RwLockReadGuard};

/// Live client bound to one initialized provider.
pub struct CacheClient {
    name: String,
    provider: RwLock<Option<Box<dyn CacheProvider>>>,
    context: ProviderContext,
    topology: Topology,
    metrics: Arc<dyn CacheMetrics>,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for CacheClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheClient")
            .field("name", &self.name)
            .field("topology", &self.topology.mode())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl CacheClient {
    /// Initialize the provider described by `descriptor` and wrap it.
    ///
    /// # Errors
    /// Propagates the lifecycle errors of [`lifecycle::initialize`].
    pub async fn connect(
        name: &str,
        descriptor: &ProviderDescriptor,
        config: &CacheConfig,
        protector: Option<&dyn CredentialProtector>,
    ) -> Result<Self> {
        let active = lifecycle::initialize(descriptor, config, protector).await?;
        Ok(Self::from_active(name, active))
    }

    pub(crate) fn from_active(name: &str, active: ActiveProvider) -> Self {
        let ActiveProvider {
            provider,
            context,
            topology,
        } = active;
        CacheClient {
            name: name.to_string(),
            provider: RwLock::new(Some(provider)),
            context,
            topology,
            metrics: Arc::new(NoOpMetrics),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Attach a metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolved defaults the client was initialized with.
    pub fn context(&self) -> &ProviderContext {
        &self.context
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    async fn active(&self) -> Option<RwLockReadGuard<'_, dyn CacheProvider>> {
        RwLockReadGuard::try_map(self.provider.read().await, |p| p.as_deref()).ok()
    }

    fn destroyed_error(&self) -> Error {
        Error::Backend(format!("cache client {} is destroyed", self.name))
    }

    /// Apply the failure policy: timeouts propagate, anything else degrades to `fallback`.
    fn degrade<T>(&self, operation: &str, key: &str, error: Error, fallback: T) -> Result<T> {
        self.metrics.record_error(key, &error.to_string());
        match error {
            Error::Timeout(_) => Err(error),
            other => {
                warn!(
                    "⚠ Cache {} {} {} failed, returning no-op result: {}",
                    self.name, operation, key, other
                );
                Ok(fallback)
            }
        }
    }

    /// Store `value` with the default expiry.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.set_with_expiry(key, value, UNSET_EXPIRY).await
    }

    /// Store `value` with `expiry` seconds ([`UNSET_EXPIRY`] = default, `-1` = never).
    pub async fn set_with_expiry(&self, key: &str, value: &str, expiry: i32) -> Result<()> {
        let Some(provider) = self.active().await else {
            return self.degrade("SET", key, self.destroyed_error(), ());
        };
        let started = Instant::now();
        match provider
            .set(key, value, self.context.expiry_time(expiry))
            .await
        {
            Ok(()) => {
                self.metrics.record_set(key, started.elapsed());
                Ok(())
            }
            Err(e) => self.degrade("SET", key, e, ()),
        }
    }

    /// Store `value` if `key` is absent, with the default expiry.
    pub async fn add(&self, key: &str, value: &str) -> Result<()> {
        self.add_with_expiry(key, value, UNSET_EXPIRY).await
    }

    pub async fn add_with_expiry(&self, key: &str, value: &str, expiry: i32) -> Result<()> {
        let Some(provider) = self.active().await else {
            return self.degrade("ADD", key, self.destroyed_error(), ());
        };
        let started = Instant::now();
        match provider
            .add(key, value, self.context.expiry_time(expiry))
            .await
        {
            Ok(()) => {
                self.metrics.record_set(key, started.elapsed());
                Ok(())
            }
            Err(e) => self.degrade("ADD", key, e, ()),
        }
    }

    /// Overwrite `key` if present, with the default expiry.
    pub async fn replace(&self, key: &str, value: &str) -> Result<()> {
        self.replace_with_expiry(key, value, UNSET_EXPIRY).await
    }

    pub async fn replace_with_expiry(&self, key: &str, value: &str, expiry: i32) -> Result<()> {
        let Some(provider) = self.active().await else {
            return self.degrade("REPLACE", key, self.destroyed_error(), ());
        };
        let started = Instant::now();
        match provider
            .replace(key, value, self.context.expiry_time(expiry))
            .await
        {
            Ok(()) => {
                self.metrics.record_set(key, started.elapsed());
                Ok(())
            }
            Err(e) => self.degrade("REPLACE", key, e, ()),
        }
    }

    /// Change the expiry of `key`.
    pub async fn expire(&self, key: &str, expiry: i32) -> Result<()> {
        let Some(provider) = self.active().await else {
            return self.degrade("EXPIRE", key, self.destroyed_error(), ());
        };
        let started = Instant::now();
        match provider.expire(key, self.context.expiry_time(expiry)).await {
            Ok(()) => {
                self.metrics.record_set(key, started.elapsed());
                Ok(())
            }
            Err(e) => self.degrade("EXPIRE", key, e, ()),
        }
    }

    /// Refresh `keys`.
    pub async fn touch(&self, keys: &[&str]) -> Result<()> {
        let label = keys.join(",");
        let Some(provider) = self.active().await else {
            return self.degrade("TOUCH", &label, self.destroyed_error(), ());
        };
        let started = Instant::now();
        match provider.touch(keys).await {
            Ok(()) => {
                self.metrics.record_set(&label, started.elapsed());
                Ok(())
            }
            Err(e) => self.degrade("TOUCH", &label, e, ()),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let Some(provider) = self.active().await else {
            return self.degrade("DELETE", key, self.destroyed_error(), ());
        };
        let started = Instant::now();
        match provider.delete(key).await {
            Ok(()) => {
                self.metrics.record_delete(key, started.elapsed());
                Ok(())
            }
            Err(e) => self.degrade("DELETE", key, e, ()),
        }
    }

    /// Read `key`.
    ///
    /// # Returns
    /// - `Ok(Some(value))` - Key found
    /// - `Ok(None)` - Miss, blank key, or a degraded backend failure
    ///
    /// # Errors
    /// Returns `Error::Timeout` if the backend timed out.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        if key.trim().is_empty() {
            return Ok(None);
        }

        let Some(provider) = self.active().await else {
            return self.degrade("GET", key, self.destroyed_error(), None);
        };
        let started = Instant::now();
        match provider.get(key).await {
            Ok(Some(value)) => {
                self.metrics.record_hit(key, started.elapsed());
                Ok(Some(value))
            }
            Ok(None) => {
                self.metrics.record_miss(key, started.elapsed());
                Ok(None)
            }
            Err(e) => self.degrade("GET", key, e, None),
        }
    }

    /// Add `step` to the counter at `key`.
    ///
    /// Returns [`NOOP_COUNTER`] for a blank key or a degraded backend failure.
    pub async fn incr(&self, key: &str, step: i64) -> Result<i64> {
        if key.trim().is_empty() {
            return Ok(NOOP_COUNTER);
        }

        let Some(provider) = self.active().await else {
            return self.degrade("INCR", key, self.destroyed_error(), NOOP_COUNTER);
        };
        let started = Instant::now();
        match provider.incr(key, step).await {
            Ok(value) => {
                self.metrics.record_set(key, started.elapsed());
                Ok(value)
            }
            Err(e) => self.degrade("INCR", key, e, NOOP_COUNTER),
        }
    }

    /// Subtract `step` from the counter at `key`.
    ///
    /// Returns [`NOOP_COUNTER`] for a blank key or a degraded backend failure.
    pub async fn decr(&self, key: &str, step: i64) -> Result<i64> {
        if key.trim().is_empty() {
            return Ok(NOOP_COUNTER);
        }

        let Some(provider) = self.active().await else {
            return self.degrade("DECR", key, self.destroyed_error(), NOOP_COUNTER);
        };
        let started = Instant::now();
        match provider.decr(key, step).await {
            Ok(value) => {
                self.metrics.record_set(key, started.elapsed());
                Ok(value)
            }
            Err(e) => self.degrade("DECR", key, e, NOOP_COUNTER),
        }
    }

    /// Release the provider's connections. Later calls are no-ops.
    ///
    /// Waits for in-flight operations to finish.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        let provider = self.provider.write().await.take();
        if let Some(mut provider) = provider {
            provider.destroy().await;
        }
        info!("✓ Cache client {} destroyed", self.name);
    }
}

#[cfg(all(test, feature = "inmemory"))]
mod tests {
    use super::*;
    use crate::builder::CacheConfigBuilder;
    use crate::config::ServerEndpoint;
    use crate::lifecycle::Credentials;
    use crate::registry::{ProviderDescriptor, INMEMORY_PROVIDER};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    fn config(expire_time: i32) -> CacheConfig {
        CacheConfigBuilder::new()
            .provider_name(INMEMORY_PROVIDER)
            .expire_time(expire_time)
            .server_builder()
            .address("local")
            .confirm()
            .expect("Failed to confirm server")
            .build()
    }

    async fn client(expire_time: i32) -> CacheClient {
        let descriptor = ProviderDescriptor::of::<crate::provider::InMemoryProvider>(
            INMEMORY_PROVIDER,
            0,
        );
        CacheClient::connect("Test", &descriptor, &config(expire_time), None)
            .await
            .expect("Failed to connect")
    }

    /// Records the expiry passed to the backend and fails on demand.
    #[derive(Default)]
    struct RecordingProvider {
        last_expiry: Arc<Mutex<Option<i32>>>,
        failure: Option<Error>,
        calls: Arc<AtomicUsize>,
    }

    impl RecordingProvider {
        fn outcome(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.failure {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl CacheProvider for RecordingProvider {
        fn default_port(&self) -> u16 {
            1
        }
        async fn initialize_singleton(
            &mut self,
            _context: &ProviderContext,
            _endpoint: &ServerEndpoint,
            _credentials: &Credentials,
        ) -> Result<()> {
            Ok(())
        }
        async fn initialize_cluster(
            &mut self,
            _context: &ProviderContext,
            _endpoints: &[ServerEndpoint],
            _master_name: &str,
            _credentials: &Credentials,
        ) -> Result<()> {
            Ok(())
        }
        async fn set(&self, _key: &str, _value: &str, expiry: i32) -> Result<()> {
            *self.last_expiry.lock().unwrap() = Some(expiry);
            self.outcome()
        }
        async fn add(&self, _key: &str, _value: &str, expiry: i32) -> Result<()> {
            *self.last_expiry.lock().unwrap() = Some(expiry);
            self.outcome()
        }
        async fn replace(&self, _key: &str, _value: &str, expiry: i32) -> Result<()> {
            *self.last_expiry.lock().unwrap() = Some(expiry);
            self.outcome()
        }
        async fn expire(&self, _key: &str, expiry: i32) -> Result<()> {
            *self.last_expiry.lock().unwrap() = Some(expiry);
            self.outcome()
        }
        async fn touch(&self, _keys: &[&str]) -> Result<()> {
            self.outcome()
        }
        async fn delete(&self, _key: &str) -> Result<()> {
            self.outcome()
        }
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            self.outcome().map(|_| Some("value".to_string()))
        }
        async fn incr(&self, _key: &str, step: i64) -> Result<i64> {
            self.outcome().map(|_| step)
        }
        async fn decr(&self, _key: &str, step: i64) -> Result<i64> {
            self.outcome().map(|_| -step)
        }
        async fn destroy(&mut self) {}
    }

    fn recording_client(
        expire_time: i32,
        failure: Option<Error>,
    ) -> (CacheClient, Arc<Mutex<Option<i32>>>, Arc<AtomicUsize>) {
        let recorder = RecordingProvider {
            failure,
            ..Default::default()
        };
        let last_expiry = Arc::clone(&recorder.last_expiry);
        let calls = Arc::clone(&recorder.calls);
        let cfg = config(expire_time);
        let active = ActiveProvider {
            provider: Box::new(recorder),
            context: ProviderContext::new(&cfg, 1),
            topology: Topology::Singleton(cfg.servers()[0].clone()),
        };
        (CacheClient::from_active("Recording", active), last_expiry, calls)
    }

    #[tokio::test]
    async fn test_client_set_get_delete() {
        let client = client(-1).await;
        client.set("key", "value").await.expect("Failed to set");
        assert_eq!(
            client.get("key").await.expect("Failed to get"),
            Some("value".to_string())
        );
        client.delete("key").await.expect("Failed to delete");
        assert_eq!(client.get("key").await.expect("Failed to get"), None);
    }

    #[tokio::test]
    async fn test_client_two_argument_forms_use_default_expiry() {
        let (client, last_expiry, _) = recording_client(120, None);

        client.set("k", "v").await.unwrap();
        assert_eq!(*last_expiry.lock().unwrap(), Some(120));

        client.add("k", "v").await.unwrap();
        assert_eq!(*last_expiry.lock().unwrap(), Some(120));

        client.replace("k", "v").await.unwrap();
        assert_eq!(*last_expiry.lock().unwrap(), Some(120));

        client.set_with_expiry("k", "v", 30).await.unwrap();
        assert_eq!(*last_expiry.lock().unwrap(), Some(30));
    }

    #[tokio::test]
    async fn test_client_never_expire_passes_through() {
        let (client, last_expiry, _) = recording_client(120, None);
        client.set_with_expiry("k", "v", -1).await.unwrap();
        assert_eq!(*last_expiry.lock().unwrap(), Some(-1));

        client.expire("k", UNSET_EXPIRY).await.unwrap();
        assert_eq!(*last_expiry.lock().unwrap(), Some(120));
    }

    #[tokio::test]
    async fn test_client_blank_keys_skip_backend() {
        let (client, _, calls) = recording_client(-1, None);

        assert_eq!(client.get("").await.unwrap(), None);
        assert_eq!(client.get("   ").await.unwrap(), None);
        assert_eq!(client.incr("", 1).await.unwrap(), NOOP_COUNTER);
        assert_eq!(client.decr(" ", 1).await.unwrap(), NOOP_COUNTER);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_client_backend_failure_degrades() {
        let (client, _, calls) = recording_client(-1, Some(Error::Backend("down".into())));

        assert_eq!(client.get("key").await.unwrap(), None);
        assert_eq!(client.incr("key", 1).await.unwrap(), NOOP_COUNTER);
        assert_eq!(client.decr("key", 1).await.unwrap(), NOOP_COUNTER);
        client.set("key", "v").await.unwrap();
        client.delete("key").await.unwrap();
        client.touch(&["a", "b"]).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_client_timeout_propagates() {
        let (client, _, _) = recording_client(-1, Some(Error::Timeout("slow".into())));

        let err = client.get("key").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(client.incr("key", 1).await, Err(Error::Timeout(_))));
        assert!(matches!(client.set("key", "v").await, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_client_destroy_is_idempotent() {
        let client = client(-1).await;
        client.set("key", "value").await.expect("Failed to set");

        client.destroy().await;
        client.destroy().await;
        assert!(client.is_destroyed());
        assert_eq!(client.get("key").await.expect("Failed to get"), None);
        assert_eq!(client.incr("key", 1).await.expect("Failed to incr"), NOOP_COUNTER);
    }

    #[tokio::test]
    async fn test_client_counters() {
        let client = client(-1).await;
        assert_eq!(client.incr("counter", 3).await.expect("Failed to incr"), 3);
        assert_eq!(client.decr("counter", 1).await.expect("Failed to decr"), 2);
    }

    #[tokio::test]
    async fn test_client_default_expiry_applies() {
        let client = client(1).await;
        client.set("short", "lived").await.expect("Failed to set");
        assert!(client.get("short").await.expect("Failed to get").is_some());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(client.get("short").await.expect("Failed to get").is_none());
    }

    #[tokio::test]
    async fn test_client_metrics_receive_hits_and_misses() {
        #[derive(Default)]
        struct Counting {
            hits: AtomicUsize,
            misses: AtomicUsize,
        }
        impl CacheMetrics for Counting {
            fn record_hit(&self, _key: &str, _duration: Duration) {
                self.hits.fetch_add(1, Ordering::SeqCst);
            }
            fn record_miss(&self, _key: &str, _duration: Duration) {
                self.misses.fetch_add(1, Ordering::SeqCst);
            }
        }

        let metrics = Arc::new(Counting::default());
        let client = client(-1).await.with_metrics(metrics.clone());
        client.set("key", "value").await.unwrap();
        client.get("key").await.unwrap();
        client.get("missing").await.unwrap();

        assert_eq!(metrics.hits.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.misses.load(Ordering::SeqCst), 1);
    }
}
