//! Process-local provider.
//!
//! Uses DashMap for concurrent access with per-key sharding. Expired entries
//! are dropped lazily on access. Every topology is accepted; the endpoints are
//! only logged.

use super::CacheProvider;
use crate::config::{ServerEndpoint, NEVER_EXPIRE};
use crate::error::{Error, Result};
use crate::lifecycle::{Credentials, ProviderContext};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The in-memory provider listens nowhere.
pub const DEFAULT_PORT: u16 = 0;

struct StoredValue {
    data: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(data: String, expiry: i32) -> Self {
        StoredValue {
            data,
            expires_at: deadline(expiry),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() >= exp)
    }
}

/// Positive expiries are seconds from now; anything else never expires.
fn deadline(expiry: i32) -> Option<Instant> {
    u64::try_from(expiry)
        .ok()
        .filter(|secs| *secs > 0)
        .map(|secs| Instant::now() + Duration::from_secs(secs))
}

/// Thread-safe in-memory provider.
///
/// # Example
///
/// ```
/// use cache_bridge::provider::{CacheProvider, InMemoryProvider};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> cache_bridge::Result<()> {
/// let provider = InMemoryProvider::new();
/// provider.set("greeting", "hello", -1).await?;
/// assert_eq!(provider.get("greeting").await?, Some("hello".to_string()));
/// assert_eq!(provider.incr("hits", 2).await?, 2);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryProvider {
    store: Arc<DashMap<String, StoredValue>>,
    context: Option<ProviderContext>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included until next access.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    fn touch_expiry(&self) -> i32 {
        self.context
            .as_ref()
            .map(|c| c.default_expiry())
            .unwrap_or(NEVER_EXPIRE)
    }

    fn adjust(&self, key: &str, delta: i64) -> Result<i64> {
        match self.store.entry(key.to_string()) {
            Entry::Occupied(mut entry) if !entry.get().is_expired() => {
                let current: i64 = entry.get().data.trim().parse().map_err(|_| {
                    Error::Backend(format!("value of {} is not a counter", key))
                })?;
                let next = current.checked_add(delta).ok_or_else(|| {
                    Error::Backend(format!("counter {} overflowed", key))
                })?;
                entry.get_mut().data = next.to_string();
                Ok(next)
            }
            Entry::Occupied(mut entry) => {
                entry.insert(StoredValue::new(delta.to_string(), NEVER_EXPIRE));
                Ok(delta)
            }
            Entry::Vacant(entry) => {
                entry.insert(StoredValue::new(delta.to_string(), NEVER_EXPIRE));
                Ok(delta)
            }
        }
    }
}

#[async_trait]
impl CacheProvider for InMemoryProvider {
    fn default_port(&self) -> u16 {
        DEFAULT_PORT
    }

    async fn initialize_singleton(
        &mut self,
        context: &ProviderContext,
        endpoint: &ServerEndpoint,
        _credentials: &Credentials,
    ) -> Result<()> {
        self.context = Some(context.clone());
        debug!(
            "✓ InMemory provider ready (singleton {})",
            context.server_address(endpoint)
        );
        Ok(())
    }

    async fn initialize_cluster(
        &mut self,
        context: &ProviderContext,
        endpoints: &[ServerEndpoint],
        _master_name: &str,
        _credentials: &Credentials,
    ) -> Result<()> {
        self.context = Some(context.clone());
        debug!(
            "✓ InMemory provider ready ({} over {} endpoints)",
            context.cluster_mode(),
            endpoints.len()
        );
        Ok(())
    }

    async fn set(&self, key: &str, value: &str, expiry: i32) -> Result<()> {
        self.store
            .insert(key.to_string(), StoredValue::new(value.to_string(), expiry));
        debug!("✓ InMemory SET {} (expiry: {})", key, expiry);
        Ok(())
    }

    async fn add(&self, key: &str, value: &str, expiry: i32) -> Result<()> {
        match self.store.entry(key.to_string()) {
            Entry::Occupied(mut entry) if entry.get().is_expired() => {
                entry.insert(StoredValue::new(value.to_string(), expiry));
            }
            Entry::Occupied(_) => {
                debug!("InMemory ADD {} skipped, key exists", key);
                return Ok(());
            }
            Entry::Vacant(entry) => {
                entry.insert(StoredValue::new(value.to_string(), expiry));
            }
        }
        debug!("✓ InMemory ADD {} (expiry: {})", key, expiry);
        Ok(())
    }

    async fn replace(&self, key: &str, value: &str, expiry: i32) -> Result<()> {
        match self.store.get_mut(key) {
            Some(mut entry) if !entry.is_expired() => {
                *entry = StoredValue::new(value.to_string(), expiry);
                debug!("✓ InMemory REPLACE {} (expiry: {})", key, expiry);
            }
            _ => debug!("InMemory REPLACE {} skipped, key missing", key),
        }
        Ok(())
    }

    async fn expire(&self, key: &str, expiry: i32) -> Result<()> {
        if let Some(mut entry) = self.store.get_mut(key) {
            if !entry.is_expired() {
                entry.expires_at = deadline(expiry);
                debug!("✓ InMemory EXPIRE {} -> {}", key, expiry);
            }
        }
        Ok(())
    }

    async fn touch(&self, keys: &[&str]) -> Result<()> {
        let expiry = self.touch_expiry();
        for key in keys {
            if let Some(mut entry) = self.store.get_mut(*key) {
                if !entry.is_expired() {
                    entry.expires_at = deadline(expiry);
                }
            }
        }
        debug!("✓ InMemory TOUCH {} keys", keys.len());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store.remove(key);
        debug!("✓ InMemory DELETE {}", key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(entry) = self.store.get(key) {
            if !entry.is_expired() {
                debug!("✓ InMemory GET {} -> HIT", key);
                return Ok(Some(entry.data.clone()));
            }
        }

        self.store.remove_if(key, |_, v| v.is_expired());
        debug!("✓ InMemory GET {} -> MISS", key);
        Ok(None)
    }

    async fn incr(&self, key: &str, step: i64) -> Result<i64> {
        let value = self.adjust(key, step)?;
        debug!("✓ InMemory INCR {} by {} -> {}", key, step, value);
        Ok(value)
    }

    async fn decr(&self, key: &str, step: i64) -> Result<i64> {
        let delta = step
            .checked_neg()
            .ok_or_else(|| Error::Backend(format!("invalid step {}", step)))?;
        let value = self.adjust(key, delta)?;
        debug!("✓ InMemory DECR {} by {} -> {}", key, step, value);
        Ok(value)
    }

    async fn destroy(&mut self) {
        self.store.clear();
        self.context = None;
        debug!("✓ InMemory provider destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    fn context(expire_time: i32) -> ProviderContext {
        let config = CacheConfig {
            expire_time,
            ..Default::default()
        };
        ProviderContext::new(&config, DEFAULT_PORT)
    }

    #[tokio::test]
    async fn test_inmemory_set_get() {
        let provider = InMemoryProvider::new();
        provider
            .set("key1", "value1", NEVER_EXPIRE)
            .await
            .expect("Failed to set");

        let result = provider.get("key1").await.expect("Failed to get");
        assert_eq!(result, Some("value1".to_string()));
    }

    #[tokio::test]
    async fn test_inmemory_miss() {
        let provider = InMemoryProvider::new();
        assert_eq!(provider.get("nonexistent").await.expect("Failed to get"), None);
    }

    #[tokio::test]
    async fn test_inmemory_add_only_when_absent() {
        let provider = InMemoryProvider::new();
        provider.add("key", "first", -1).await.expect("Failed to add");
        provider.add("key", "second", -1).await.expect("Failed to add");
        assert_eq!(
            provider.get("key").await.expect("Failed to get"),
            Some("first".to_string())
        );
    }

    #[tokio::test]
    async fn test_inmemory_replace_only_when_present() {
        let provider = InMemoryProvider::new();
        provider
            .replace("key", "ignored", -1)
            .await
            .expect("Failed to replace");
        assert_eq!(provider.get("key").await.expect("Failed to get"), None);

        provider.set("key", "old", -1).await.expect("Failed to set");
        provider
            .replace("key", "new", -1)
            .await
            .expect("Failed to replace");
        assert_eq!(
            provider.get("key").await.expect("Failed to get"),
            Some("new".to_string())
        );
    }

    #[tokio::test]
    async fn test_inmemory_delete() {
        let provider = InMemoryProvider::new();
        provider.set("key", "value", -1).await.expect("Failed to set");
        provider.delete("key").await.expect("Failed to delete");
        assert!(provider.is_empty());
    }

    #[tokio::test]
    async fn test_inmemory_expiry() {
        let provider = InMemoryProvider::new();
        provider.set("key", "value", 1).await.expect("Failed to set");
        assert!(provider.get("key").await.expect("Failed to get").is_some());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(provider.get("key").await.expect("Failed to get").is_none());
        assert!(provider.is_empty());
    }

    #[tokio::test]
    async fn test_inmemory_expire_makes_key_persistent() {
        let provider = InMemoryProvider::new();
        provider.set("key", "value", 1).await.expect("Failed to set");
        provider
            .expire("key", NEVER_EXPIRE)
            .await
            .expect("Failed to expire");

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(provider.get("key").await.expect("Failed to get").is_some());
    }

    #[tokio::test]
    async fn test_inmemory_touch_applies_default_expiry() {
        let mut provider = InMemoryProvider::new();
        provider
            .initialize_singleton(
                &context(NEVER_EXPIRE),
                &ServerEndpoint::new("local", 0, 1),
                &Credentials::default(),
            )
            .await
            .expect("Failed to initialize");

        provider.set("key", "value", 1).await.expect("Failed to set");
        provider.touch(&["key", "missing"]).await.expect("Failed to touch");

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(provider.get("key").await.expect("Failed to get").is_some());
    }

    #[tokio::test]
    async fn test_inmemory_counters() {
        let provider = InMemoryProvider::new();
        assert_eq!(provider.incr("counter", 5).await.expect("Failed to incr"), 5);
        assert_eq!(provider.incr("counter", 2).await.expect("Failed to incr"), 7);
        assert_eq!(provider.decr("counter", 10).await.expect("Failed to decr"), -3);
        assert_eq!(
            provider.get("counter").await.expect("Failed to get"),
            Some("-3".to_string())
        );
    }

    #[tokio::test]
    async fn test_inmemory_counter_on_text_fails() {
        let provider = InMemoryProvider::new();
        provider.set("text", "abc", -1).await.expect("Failed to set");
        assert!(matches!(
            provider.incr("text", 1).await,
            Err(Error::Backend(_))
        ));
    }

    #[tokio::test]
    async fn test_inmemory_destroy_clears() {
        let mut provider = InMemoryProvider::new();
        provider.set("key", "value", -1).await.expect("Failed to set");
        provider.destroy().await;
        assert!(provider.is_empty());
        provider.destroy().await;
    }

    #[tokio::test]
    async fn test_inmemory_concurrent_writers() {
        let provider = Arc::new(InMemoryProvider::new());
        let mut handles = vec![];

        for i in 0..10 {
            let provider = Arc::clone(&provider);
            handles.push(tokio::spawn(async move {
                provider
                    .set(&format!("key_{}", i), &format!("value_{}", i), -1)
                    .await
                    .expect("Failed to set");
                provider.incr("shared", 1).await.expect("Failed to incr");
            }));
        }

        for handle in handles {
            handle.await.expect("Task failed");
        }

        assert_eq!(provider.len(), 11);
        assert_eq!(
            provider.get("shared").await.expect("Failed to get"),
            Some("10".to_string())
        );
    }
}
