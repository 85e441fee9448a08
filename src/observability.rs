//! Metrics hooks for cache client operations.
//!
//! Implement [`CacheMetrics`] to feed hits, misses, writes and degraded
//! operations into your monitoring system, then attach it with
//! [`crate::manager::CacheManager::with_metrics`]:
//!
//! ```
//! use cache_bridge::manager::CacheManager;
//! use cache_bridge::observability::CacheMetrics;
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[derive(Default)]
//! struct HitCounter(AtomicU64);
//!
//! impl CacheMetrics for HitCounter {
//!     fn record_hit(&self, _key: &str, _duration: Duration) {
//!         self.0.fetch_add(1, Ordering::Relaxed);
//!     }
//! }
//!
//! let manager = CacheManager::new().with_metrics(Arc::new(HitCounter::default()));
//! ```
//!
//! Methods left unimplemented fall back to `log` output. Clients created
//! without metrics use [`NoOpMetrics`].

use std::time::Duration;

/// Trait for cache metrics collection.
pub trait CacheMetrics: Send + Sync {
    /// Record a cache hit.
    fn record_hit(&self, key: &str, duration: Duration) {
        debug!("Cache HIT: {} took {:?}", key, duration);
    }

    /// Record a cache miss.
    fn record_miss(&self, key: &str, duration: Duration) {
        debug!("Cache MISS: {} took {:?}", key, duration);
    }

    /// Record a write (`set`, `add`, `replace`, `expire`, `touch`, counters).
    fn record_set(&self, key: &str, duration: Duration) {
        debug!("Cache SET: {} took {:?}", key, duration);
    }

    /// Record a cache delete operation.
    fn record_delete(&self, key: &str, duration: Duration) {
        debug!("Cache DELETE: {} took {:?}", key, duration);
    }

    /// Record an operation that failed at the backend.
    fn record_error(&self, key: &str, error: &str) {
        warn!("Cache ERROR for {}: {}", key, error);
    }
}

/// Default metrics implementation (no-op).
#[derive(Clone, Default)]
pub struct NoOpMetrics;

impl CacheMetrics for NoOpMetrics {
    fn record_hit(&self, _key: &str, _duration: Duration) {}
    fn record_miss(&self, _key: &str, _duration: Duration) {}
    fn record_set(&self, _key: &str, _duration: Duration) {}
    fn record_delete(&self, _key: &str, _duration: Duration) {}
    fn record_error(&self, _key: &str, _error: &str) {}
}
