//! # cache-bridge
//!
//! A provider-agnostic cache access layer for Rust.
//!
//! ## Features
//!
//! - **Pluggable Providers:** In-memory, Redis and Memcached adapters behind one async trait,
//!   discovered through a [`ProviderRegistry`]
//! - **Topology Aware:** Singleton, sentinel, master/slave and cluster deployments resolved
//!   from a plain server list plus a cluster mode
//! - **Fluent Configuration:** [`CacheConfigBuilder`] with nested server sub-builders and
//!   at-rest password protection
//! - **Named Instances:** [`CacheManager`] owns every live client and tears them down cleanly
//! - **Degrade, Don't Crash:** Backend failures become empty/no-op results; only timeouts
//!   propagate
//!
//! ## Quick Start
//!
//! ```
//! use cache_bridge::{CacheConfigBuilder, CacheManager, ClusterMode};
//! use cache_bridge::registry::INMEMORY_PROVIDER;
//!
//! # #[tokio::main]
//! # async fn main() -> cache_bridge::Result<()> {
//! // 1. Describe the cache
//! let config = CacheConfigBuilder::new()
//!     .provider_name(INMEMORY_PROVIDER)
//!     .cluster_mode(ClusterMode::Singleton)
//!     .expire_time(300)
//!     .server_builder()
//!     .address("local")
//!     .confirm()?
//!     .build();
//!
//! // 2. Register it under a name
//! let manager = CacheManager::new();
//! assert!(manager.register("catalog", config).await);
//!
//! // 3. Use the client
//! let catalog = manager.client("catalog").expect("registered above");
//! catalog.set("sku:42", "blue widget").await?;
//! assert_eq!(catalog.incr("views:42", 1).await?, 1);
//!
//! // 4. Tear everything down on shutdown
//! manager.destroy_all().await;
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate log;

pub mod builder;
pub mod client;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod observability;
pub mod provider;
pub mod registry;
pub mod security;
pub mod store;

// Re-exports for convenience
pub use builder::{CacheConfigBuilder, ServerBuilder};
pub use client::CacheClient;
pub use config::{CacheConfig, ClusterMode, ServerEndpoint};
pub use error::{Error, Result};
pub use manager::CacheManager;
pub use provider::CacheProvider;
pub use registry::{ProviderDescriptor, ProviderRegistry};
pub use security::{CredentialProtector, KeyedProtector, SchemeConfig};
pub use store::{ConfigStore, FileConfigStore, MemoryConfigStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
