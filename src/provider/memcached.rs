//! Memcached provider.
//!
//! One deadpool-memcached pool per endpoint. With several endpoints, keys are
//! spread over a weighted consistent-hash ring regardless of the declared
//! cluster mode; Memcached has no notion of masters or sentinels.
//!
//! The ASCII protocol has no `replace`-with-expiry or `touch` in the client
//! used here, so those operations read the current value and write it back.

use super::CacheProvider;
use crate::config::{ServerEndpoint, NEVER_EXPIRE};
use crate::error::{Error, Result};
use crate::lifecycle::{Credentials, ProviderContext};
use async_memcached::{AsciiProtocol, Client, Status};
use async_trait::async_trait;
use deadpool_memcached::{Manager, Pool};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Port of a stock Memcached server.
pub const DEFAULT_PORT: u16 = 11211;

/// Ring points contributed per unit of endpoint weight.
const POINTS_PER_WEIGHT: u64 = 160;

/// Largest weight a node keeps on the ring; heavier sets are scaled down proportionally.
const MAX_WEIGHT_UNITS: u64 = 64;

const HEALTH_CHECK_KEY: &str = "__cache_bridge_health__";

fn hash32(data: &[u8], slot: usize) -> u32 {
    let digest = Sha256::digest(data);
    let offset = slot * 4;
    u32::from_be_bytes([
        digest[offset],
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ])
}

/// Ring weight of each node: zero counts as one, and a set whose heaviest
/// node exceeds [`MAX_WEIGHT_UNITS`] is scaled so that node lands on the cap.
fn weight_units(weights: &[u32]) -> Vec<u64> {
    let heaviest = u64::from(weights.iter().copied().max().unwrap_or(1).max(1));
    weights
        .iter()
        .map(|weight| {
            let weight = u64::from((*weight).max(1));
            if heaviest <= MAX_WEIGHT_UNITS {
                weight
            } else {
                (weight.saturating_mul(MAX_WEIGHT_UNITS) / heaviest).max(1)
            }
        })
        .collect()
}

/// Weighted consistent-hash ring over node indexes.
#[derive(Debug, Clone)]
pub(crate) struct HashRing {
    points: Vec<(u32, usize)>,
}

impl HashRing {
    /// Build a ring from `(label, weight)` pairs. Node `i` owns points derived from label `i`.
    pub(crate) fn new(nodes: &[(String, u32)]) -> Self {
        let weights: Vec<u32> = nodes.iter().map(|(_, weight)| *weight).collect();
        let mut points = Vec::new();
        for (index, ((label, _), units)) in nodes.iter().zip(weight_units(&weights)).enumerate() {
            // Each digest yields four points.
            let digests = POINTS_PER_WEIGHT.saturating_mul(units) / 4;
            for replica in 0..digests {
                let seed = format!("{}-{}", label, replica);
                for slot in 0..4 {
                    points.push((hash32(seed.as_bytes(), slot), index));
                }
            }
        }
        points.sort_unstable();
        HashRing { points }
    }

    /// Index of the node owning `key`.
    pub(crate) fn locate(&self, key: &str) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        let hash = hash32(key.as_bytes(), 0);
        let position = self.points.partition_point(|(point, _)| *point < hash);
        let (_, index) = self.points[position % self.points.len()];
        Some(index)
    }
}

struct Node {
    address: String,
    pool: Pool,
}

/// Seconds for the wire, `None` for never.
fn ttl(expiry: i32) -> Option<i64> {
    if expiry > 0 {
        Some(i64::from(expiry))
    } else {
        None
    }
}

fn is_status(e: &async_memcached::Error, status: Status) -> bool {
    matches!(e, async_memcached::Error::Protocol(reply) if *reply == status)
}

async fn step(
    client: &mut Client,
    key: &str,
    delta: i64,
) -> std::result::Result<u64, async_memcached::Error> {
    if delta >= 0 {
        client.increment(key, delta.unsigned_abs()).await
    } else {
        client.decrement(key, delta.unsigned_abs()).await
    }
}

fn counter_value(key: &str, value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| Error::Backend(format!("Memcached counter {} exceeds i64", key)))
}

fn counter_error(key: &str, e: async_memcached::Error) -> Error {
    Error::Backend(format!("Memcached counter update failed for key {}: {}", key, e))
}

/// Check out a connection for `$node`, returning early on failure.
macro_rules! checkout {
    ($self:ident, $node:expr) => {{
        let node: &Node = $node;
        match tokio::time::timeout($self.wait_timeout, node.pool.get()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                return Err(Error::Backend(format!(
                    "Failed to get Memcached connection to {}: {}",
                    node.address, e
                )))
            }
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "Memcached connection wait to {} timed out",
                    node.address
                )))
            }
        }
    }};
}

/// Memcached provider with per-endpoint connection pools.
pub struct MemcachedProvider {
    nodes: Vec<Node>,
    ring: Option<HashRing>,
    default_expiry: i32,
    wait_timeout: Duration,
}

impl Default for MemcachedProvider {
    fn default() -> Self {
        MemcachedProvider {
            nodes: Vec::new(),
            ring: None,
            default_expiry: NEVER_EXPIRE,
            wait_timeout: Duration::from_secs(1),
        }
    }
}

impl MemcachedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    async fn open_node(context: &ProviderContext, endpoint: &ServerEndpoint) -> Result<Node> {
        let address = context.server_address(endpoint);
        let pool = Pool::builder(Manager::new(address.clone()))
            .max_size(context.client_pool_size() as usize)
            .build()
            .map_err(|e| {
                Error::ConnectionInit(format!(
                    "Failed to create Memcached pool for {}: {}",
                    address, e
                ))
            })?;

        let mut conn = pool.get().await.map_err(|e| {
            Error::ConnectionInit(format!("Failed to connect to Memcached at {}: {}", address, e))
        })?;
        match conn.get(HEALTH_CHECK_KEY).await {
            Ok(_) => {}
            Err(e) if is_status(&e, Status::NotFound) => {}
            Err(e) => {
                return Err(Error::ConnectionInit(format!(
                    "Memcached at {} did not answer: {}",
                    address, e
                )))
            }
        }
        drop(conn);

        Ok(Node { address, pool })
    }

    fn warn_on_credentials(credentials: &Credentials) {
        if credentials.username().is_some() || credentials.password().is_some() {
            warn!("⚠ Memcached ASCII protocol has no authentication, credentials ignored");
        }
    }

    fn adopt(&mut self, context: &ProviderContext, nodes: Vec<Node>, ring: Option<HashRing>) {
        self.nodes = nodes;
        self.ring = ring;
        self.default_expiry = context.default_expiry();
        self.wait_timeout = context.connect_timeout();
    }

    fn node_for(&self, key: &str) -> Result<&Node> {
        let index = match &self.ring {
            Some(ring) => ring.locate(key).unwrap_or(0),
            None => 0,
        };
        self.nodes.get(index).ok_or_else(|| {
            Error::Backend("Memcached provider is not initialized".to_string())
        })
    }

    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let node = self.node_for(key)?;
        let mut conn = checkout!(self, node);
        match conn.get(key).await {
            Ok(Some(value)) => Ok(value.data),
            Ok(None) => Ok(None),
            Err(e) if is_status(&e, Status::NotFound) => Ok(None),
            Err(e) => Err(Error::Backend(format!(
                "Memcached GET failed for key {}: {}",
                key, e
            ))),
        }
    }

    async fn write(&self, key: &str, value: &[u8], expiry: i32) -> Result<()> {
        let node = self.node_for(key)?;
        let mut conn = checkout!(self, node);
        conn.set(key, value, ttl(expiry), None)
            .await
            .map_err(|e| Error::Backend(format!("Memcached SET failed for key {}: {}", key, e)))
    }

    async fn adjust(&self, key: &str, delta: i64) -> Result<i64> {
        let node = self.node_for(key)?;
        let mut conn = checkout!(self, node);

        match step(&mut conn, key, delta).await {
            Ok(value) => counter_value(key, value),
            Err(e) if is_status(&e, Status::NotFound) => {
                // Seed a missing counter; a decrement of a new counter floors at 0.
                let initial = delta.max(0);
                match conn.add(key, initial.to_string().as_bytes(), None, None).await {
                    Ok(()) => Ok(initial),
                    Err(e) if is_status(&e, Status::NotStored) => {
                        // Another client seeded the counter first.
                        let value = step(&mut conn, key, delta)
                            .await
                            .map_err(|e| counter_error(key, e))?;
                        counter_value(key, value)
                    }
                    Err(e) => Err(Error::Backend(format!(
                        "Memcached counter seed failed for {}: {}",
                        key, e
                    ))),
                }
            }
            Err(e) => Err(counter_error(key, e)),
        }
    }
}

#[async_trait]
impl CacheProvider for MemcachedProvider {
    fn default_port(&self) -> u16 {
        DEFAULT_PORT
    }

    async fn initialize_singleton(
        &mut self,
        context: &ProviderContext,
        endpoint: &ServerEndpoint,
        credentials: &Credentials,
    ) -> Result<()> {
        Self::warn_on_credentials(credentials);
        let node = Self::open_node(context, endpoint).await?;

        info!(
            "✓ Memcached provider initialized with server: {} (pool size: {})",
            node.address,
            context.client_pool_size()
        );
        self.adopt(context, vec![node], None);
        Ok(())
    }

    async fn initialize_cluster(
        &mut self,
        context: &ProviderContext,
        endpoints: &[ServerEndpoint],
        _master_name: &str,
        credentials: &Credentials,
    ) -> Result<()> {
        Self::warn_on_credentials(credentials);

        let mut nodes = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            match Self::open_node(context, endpoint).await {
                Ok(node) => nodes.push(node),
                Err(e) => {
                    nodes.iter().for_each(|n: &Node| n.pool.close());
                    return Err(e);
                }
            }
        }

        let ring = HashRing::new(
            &nodes
                .iter()
                .zip(endpoints)
                .map(|(node, endpoint)| (node.address.clone(), endpoint.weight()))
                .collect::<Vec<_>>(),
        );

        info!(
            "✓ Memcached provider initialized: {} servers ({} mode, weighted distribution)",
            nodes.len(),
            context.cluster_mode()
        );
        self.adopt(context, nodes, Some(ring));
        Ok(())
    }

    async fn set(&self, key: &str, value: &str, expiry: i32) -> Result<()> {
        self.write(key, value.as_bytes(), expiry).await?;
        debug!("✓ Memcached SET {} (expiry: {})", key, expiry);
        Ok(())
    }

    async fn add(&self, key: &str, value: &str, expiry: i32) -> Result<()> {
        let node = self.node_for(key)?;
        let mut conn = checkout!(self, node);
        match conn.add(key, value.as_bytes(), ttl(expiry), None).await {
            Ok(()) => debug!("✓ Memcached ADD {} (expiry: {})", key, expiry),
            Err(e) if is_status(&e, Status::NotStored) => {
                debug!("Memcached ADD {} skipped, key exists", key)
            }
            Err(e) => {
                return Err(Error::Backend(format!(
                    "Memcached ADD failed for key {}: {}",
                    key, e
                )))
            }
        }
        Ok(())
    }

    async fn replace(&self, key: &str, value: &str, expiry: i32) -> Result<()> {
        if self.fetch(key).await?.is_some() {
            self.write(key, value.as_bytes(), expiry).await?;
            debug!("✓ Memcached REPLACE {} (expiry: {})", key, expiry);
        } else {
            debug!("Memcached REPLACE {} skipped, key missing", key);
        }
        Ok(())
    }

    async fn expire(&self, key: &str, expiry: i32) -> Result<()> {
        if let Some(data) = self.fetch(key).await? {
            self.write(key, &data, expiry).await?;
            debug!("✓ Memcached EXPIRE {} -> {}", key, expiry);
        }
        Ok(())
    }

    async fn touch(&self, keys: &[&str]) -> Result<()> {
        futures::future::try_join_all(
            keys.iter().map(|key| self.expire(key, self.default_expiry)),
        )
        .await?;
        debug!("✓ Memcached TOUCH {} keys", keys.len());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let node = self.node_for(key)?;
        let mut conn = checkout!(self, node);
        match conn.delete(key).await {
            Ok(()) => {}
            Err(e) if is_status(&e, Status::NotFound) => {}
            Err(e) => {
                return Err(Error::Backend(format!(
                    "Memcached DELETE failed for key {}: {}",
                    key, e
                )))
            }
        }
        debug!("✓ Memcached DELETE {}", key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.fetch(key).await? {
            Some(data) => {
                debug!("✓ Memcached GET {} -> HIT", key);
                String::from_utf8(data).map(Some).map_err(|e| {
                    Error::Backend(format!("Memcached value of {} is not UTF-8: {}", key, e))
                })
            }
            None => {
                debug!("✓ Memcached GET {} -> MISS", key);
                Ok(None)
            }
        }
    }

    async fn incr(&self, key: &str, step: i64) -> Result<i64> {
        let value = self.adjust(key, step).await?;
        debug!("✓ Memcached INCR {} by {} -> {}", key, step, value);
        Ok(value)
    }

    async fn decr(&self, key: &str, step: i64) -> Result<i64> {
        let delta = step
            .checked_neg()
            .ok_or_else(|| Error::Backend(format!("invalid step {}", step)))?;
        let value = self.adjust(key, delta).await?;
        debug!("✓ Memcached DECR {} by {} -> {}", key, step, value);
        Ok(value)
    }

    async fn destroy(&mut self) {
        for node in self.nodes.drain(..) {
            node.pool.close();
        }
        self.ring = None;
        debug!("✓ Memcached provider destroyed");
    }
}
