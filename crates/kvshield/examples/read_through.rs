use kvshield::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Product {
    id: u64,
    name: String,
    price_cents: u64,
}

// Simulated database query
async fn query_products(filters: &HashMap<&str, &str>) -> Result<Vec<Product>> {
    println!("  -> querying database with {filters:?}");
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(vec![
        Product { id: 1, name: "Trail shoe".into(), price_cents: 8900 },
        Product { id: 2, name: "Road shoe".into(), price_cents: 12900 },
    ])
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kvshield=debug")),
        )
        .init();

    let store = Arc::new(MemoryStore::new(MemoryConfig::default()));
    let reader = CacheAsideReader::with_config(
        store.clone(),
        ReaderConfig::with_ttl(Duration::from_secs(300)).namespace("shop"),
    );
    let invalidator = CacheInvalidator::new(store.clone());

    let mut filters = HashMap::new();
    filters.insert("category", "shoes");
    filters.insert("page", "1");
    let key = build_key("products", filters.clone());

    for round in 1..=2 {
        println!("{round}. listing products ({key})");
        let products: Vec<Product> = reader
            .get_cached(
                key.as_str(),
                || query_products(&filters),
                None,
                FailurePolicy::FailOpen,
            )
            .await?;
        println!("   got {} products", products.len());
    }

    println!("3. updating a product, then invalidating the listing");
    let report = invalidator
        .after_mutation(&Ok::<_, KvError>(()), &["shop:products:*"])
        .await;
    println!("   {:?}", report.map(|r| r.deleted()));

    let cached: Option<Vec<Product>> = reader.get(key.as_str()).await?;
    println!("4. cached after invalidation: {}", cached.is_some());

    Ok(())
}
