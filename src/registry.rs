//! Provider registry: provider name → factory and default port.
//!
//! Built-in providers come from a static registration table compiled in
//! according to the enabled features. Applications may add or shadow entries
//! with [`ProviderRegistry::register_manually`].

use crate::provider::CacheProvider;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::fmt;

/// Provider name of the process-local provider.
pub const INMEMORY_PROVIDER: &str = "InMemoryProvider";
/// Provider name of the Redis provider.
pub const REDIS_PROVIDER: &str = "RedisProvider";
/// Provider name of the Memcached provider.
pub const MEMCACHED_PROVIDER: &str = "MemcachedProvider";

/// Constructor of an uninitialized provider.
pub type ProviderFactory = fn() -> Box<dyn CacheProvider>;

fn construct<P>() -> Box<dyn CacheProvider>
where
    P: CacheProvider + Default + 'static,
{
    Box::new(P::default())
}

/// Metadata binding a provider name to its implementation.
#[derive(Clone)]
pub struct ProviderDescriptor {
    name: String,
    default_port: u16,
    factory: ProviderFactory,
}

impl fmt::Debug for ProviderDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderDescriptor")
            .field("name", &self.name)
            .field("default_port", &self.default_port)
            .finish()
    }
}

impl ProviderDescriptor {
    pub fn new(name: impl Into<String>, default_port: u16, factory: ProviderFactory) -> Self {
        ProviderDescriptor {
            name: name.into(),
            default_port,
            factory,
        }
    }

    /// Descriptor for a provider type constructed through `Default`.
    pub fn of<P>(name: impl Into<String>, default_port: u16) -> Self
    where
        P: CacheProvider + Default + 'static,
    {
        Self::new(name, default_port, construct::<P>)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_port(&self) -> u16 {
        self.default_port
    }

    /// Construct a fresh, uninitialized provider.
    pub fn create(&self) -> Box<dyn CacheProvider> {
        (self.factory)()
    }
}

fn builtin_table() -> Vec<ProviderDescriptor> {
    let mut table = Vec::new();

    #[cfg(feature = "inmemory")]
    table.push(ProviderDescriptor::of::<crate::provider::InMemoryProvider>(
        INMEMORY_PROVIDER,
        crate::provider::inmemory::DEFAULT_PORT,
    ));

    #[cfg(feature = "redis")]
    table.push(ProviderDescriptor::of::<crate::provider::RedisProvider>(
        REDIS_PROVIDER,
        crate::provider::redis::DEFAULT_PORT,
    ));

    #[cfg(feature = "memcached")]
    table.push(ProviderDescriptor::of::<crate::provider::MemcachedProvider>(
        MEMCACHED_PROVIDER,
        crate::provider::memcached::DEFAULT_PORT,
    ));

    table
}

/// Name-indexed provider descriptors.
///
/// Lookups never block behind writers of other names.
pub struct ProviderRegistry {
    descriptors: DashMap<String, ProviderDescriptor>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl ProviderRegistry {
    /// Registry with no providers.
    pub fn empty() -> Self {
        ProviderRegistry {
            descriptors: DashMap::new(),
        }
    }

    /// Registry populated with every provider compiled into the crate.
    pub fn with_builtin() -> Self {
        let registry = Self::empty();
        for descriptor in builtin_table() {
            debug!(
                "Provider {} registered (default port {})",
                descriptor.name(),
                descriptor.default_port()
            );
            registry
                .descriptors
                .insert(descriptor.name().to_string(), descriptor);
        }
        registry
    }

    /// All known provider names, sorted.
    pub fn registered_provider_names(&self) -> BTreeSet<String> {
        self.descriptors.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.descriptors.contains_key(name)
    }

    pub fn lookup(&self, name: &str) -> Option<ProviderDescriptor> {
        self.descriptors.get(name).map(|d| d.value().clone())
    }

    /// Add a provider. An existing entry with the same name is replaced.
    pub fn register_manually(&self, descriptor: ProviderDescriptor) {
        let name = descriptor.name().to_string();
        if let Some(previous) = self.descriptors.insert(name.clone(), descriptor) {
            warn!(
                "⚠ Provider {} overridden (previous default port {})",
                name,
                previous.default_port()
            );
        } else {
            debug!("Provider {} registered manually", name);
        }
    }
}
