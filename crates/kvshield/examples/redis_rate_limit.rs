use kvshield::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // REDIS_URL, or REDIS_HOST / REDIS_PORT / REDIS_PASSWORD
    let config = RedisConfig::from_env().pool_size(5).prefix("example");

    let store = match RedisStore::connect(config).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("Failed to connect to Redis: {e}");
            println!("Make sure Redis is running at 127.0.0.1:6379 or set REDIS_URL");
            return Ok(());
        }
    };
    store.ping().await?;

    let limiter = RateLimiter::with_config(
        store.clone(),
        RateLimiterConfig::default().prefix("api"),
    );
    limiter.reset("client-42").await?;

    for request in 1..=7 {
        match limiter.check("client-42", 5, Duration::from_secs(10)).await {
            Ok(status) => println!(
                "request {request}: allowed, {} left, window resets in {:?}",
                status.remaining, status.reset
            ),
            Err(e @ KvError::RateLimitExceeded { .. }) => {
                let public = e.to_public();
                println!("request {request}: HTTP {} {public}", public.status_code());
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}
