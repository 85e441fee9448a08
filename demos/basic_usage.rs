//! Basic usage example of the cache access layer.
//!
//! Builds a configuration, persists it, registers it with a manager and runs
//! a few operations against the in-memory provider.
//!
//! Run with: cargo run --example basic_usage

use cache_bridge::registry::INMEMORY_PROVIDER;
use cache_bridge::{
    error::Result, CacheConfigBuilder, CacheManager, ClusterMode, FileConfigStore, KeyedProtector,
    SchemeConfig,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    println!("=== Cache Bridge: Basic Usage ===\n");

    // Credential protection
    let protector = Arc::new(KeyedProtector::from_env());

    // 1. Describe the cache
    println!("1. Building configuration");
    let builder = CacheConfigBuilder::new()
        .with_protector(protector.clone())
        .provider_name(INMEMORY_PROVIDER)
        .cluster_mode(ClusterMode::Singleton)
        .expire_time(300)
        .secure_config("Demo_Secure", SchemeConfig::new("demo-secret"))
        .authorization("app", "hunter2")
        .server_builder()
        .address("local")
        .confirm()?;
    println!("   {:?}\n", builder.config());

    // 2. Persist it
    let dir = std::env::temp_dir().join("cache-bridge-demo");
    std::fs::create_dir_all(&dir)?;
    let store = FileConfigStore::new(&dir);
    builder.save(&store, "catalog")?;
    println!("2. Saved configuration to {}\n", dir.display());

    // 3. Register from the store
    let manager = CacheManager::new().with_protector(protector);
    if !manager.register_from_store("catalog", &store).await {
        println!("   Registration failed, see logs");
        return Ok(());
    }
    println!("3. Registered caches: {:?}\n", manager.registered_names());

    // 4. Use the client
    let catalog = manager
        .client("catalog")
        .ok_or_else(|| cache_bridge::Error::Other("catalog missing".to_string()))?;

    println!("4. Operations");
    catalog.set("sku:42", "blue widget").await?;
    println!("   get sku:42      -> {:?}", catalog.get("sku:42").await?);
    println!("   get sku:43      -> {:?}", catalog.get("sku:43").await?);
    println!("   incr views:42   -> {}", catalog.incr("views:42", 1).await?);
    println!("   incr views:42   -> {}", catalog.incr("views:42", 1).await?);
    println!("   get \"\"          -> {:?}", catalog.get("").await?);

    // 5. Shutdown
    manager.destroy_all().await;
    println!("\n5. All caches destroyed");

    Ok(())
}
