//! Configuration for the Redis store

use std::time::Duration;

const DEFAULT_URL: &str = "redis://127.0.0.1:6379";

/// Configuration for Redis store connection and behavior
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub url: String,

    /// Connection pool size
    pub pool_size: u32,

    /// Time allowed to obtain a pooled connection
    pub connection_timeout: Duration,

    /// Upper bound for a single command round trip
    pub command_timeout: Duration,

    /// Optional key prefix for all keys (e.g., "myapp")
    pub key_prefix: Option<String>,

    /// `COUNT` hint passed to `SCAN`
    pub scan_count: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            pool_size: 10,
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(2),
            key_prefix: None,
            scan_count: 1000,
        }
    }
}

impl RedisConfig {
    /// Create new config with URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Build a config from `REDIS_URL`, or from `REDIS_HOST`, `REDIS_PORT`
    /// and `REDIS_PASSWORD` when no URL is given.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty("REDIS_URL") {
            return Self::new(url);
        }

        let host = non_empty("REDIS_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port = non_empty("REDIS_PORT")
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(6379);
        let url = match non_empty("REDIS_PASSWORD") {
            Some(password) => format!("redis://:{password}@{host}:{port}"),
            None => format!("redis://{host}:{port}"),
        };
        Self::new(url)
    }

    /// Set pool size
    pub fn pool_size(mut self, size: u32) -> Self {
        self.pool_size = size;
        self
    }

    /// Set key prefix
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Set the per-command timeout
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }
}
