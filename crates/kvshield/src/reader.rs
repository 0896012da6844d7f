//! Cache-aside reads over an injected key-value store

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;

use kvshield_core::{
    CacheKey, Component, Event, EventSink, FailurePolicy, JsonSerializer, KeyValueStore, KvError,
    Outcome, Result, Serializer, TracingSink,
};

/// Configuration for [`CacheAsideReader`]
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// TTL used when a call does not pass one
    pub default_ttl: Duration,
    /// Namespace prefix for all keys
    pub namespace: Option<String>,
    /// TTL jitter percentage (0.0 - 1.0) to spread expiry of keys written together
    pub ttl_jitter: f64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            namespace: None,
            ttl_jitter: 0.0,
        }
    }
}

impl ReaderConfig {
    /// Create config with specific default TTL
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            default_ttl: ttl,
            ..Default::default()
        }
    }

    /// Set the key namespace
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Add up to `fraction` of the TTL as random extra lifetime
    pub fn jitter(mut self, fraction: f64) -> Self {
        self.ttl_jitter = fraction.clamp(0.0, 1.0);
        self
    }
}

/// Cache-aside reader.
///
/// On a hit the stored value is returned without calling the fetch function;
/// on a miss the fetched value is written back with a TTL. Concurrent misses
/// for the same key each call their fetch function: there is no request
/// coalescing, so an expensive fetch behind a hot key can be invoked many
/// times when the key expires.
///
/// Generic over:
/// - `St`: the key-value store
/// - `S`: the serializer (JSON by default)
/// - `E`: the event sink
pub struct CacheAsideReader<St, S = JsonSerializer, E = TracingSink>
where
    St: KeyValueStore,
    S: Serializer,
    E: EventSink,
{
    store: Arc<St>,
    serializer: S,
    sink: Arc<E>,
    config: ReaderConfig,
}

impl<St: KeyValueStore> CacheAsideReader<St, JsonSerializer, TracingSink> {
    /// Create a reader with JSON values and tracing events
    pub fn new(store: Arc<St>) -> Self {
        Self::with_config(store, ReaderConfig::default())
    }

    /// Create with custom config
    pub fn with_config(store: Arc<St>, config: ReaderConfig) -> Self {
        Self::with_parts(store, JsonSerializer, Arc::new(TracingSink::new()), config)
    }
}

impl<St, S, E> CacheAsideReader<St, S, E>
where
    St: KeyValueStore,
    S: Serializer,
    E: EventSink,
{
    /// Create a reader with a custom serializer and sink
    pub fn with_parts(
        store: Arc<St>,
        serializer: S,
        sink: Arc<E>,
        config: ReaderConfig,
    ) -> Self {
        Self {
            store,
            serializer,
            sink,
            config,
        }
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    pub(crate) fn sink(&self) -> &Arc<E> {
        &self.sink
    }

    /// Shared handle to the underlying store
    pub fn store(&self) -> &Arc<St> {
        &self.store
    }

    /// Get the full key with namespace prefix
    pub fn full_key(&self, key: &str) -> String {
        match &self.config.namespace {
            Some(ns) => format!("{}:{}", ns, key),
            None => key.to_string(),
        }
    }

    fn apply_ttl_jitter(&self, ttl: Duration) -> Duration {
        if self.config.ttl_jitter > 0.0 {
            let jitter_range = (ttl.as_millis() as f64 * self.config.ttl_jitter) as u64;
            if jitter_range > 0 {
                let jitter = rand::random::<u64>() % jitter_range;
                return ttl.saturating_add(Duration::from_millis(jitter));
            }
        }
        ttl
    }

    fn emit(&self, operation: &'static str, key: &str, outcome: Outcome, started: Instant) {
        self.sink.record(
            &Event::new(Component::Cache, operation, key, outcome).duration(started.elapsed()),
        );
    }

    fn emit_degraded(&self, operation: &'static str, key: &str, err: &KvError, started: Instant) {
        let detail = err.to_string();
        self.sink.record(
            &Event::new(Component::Cache, operation, key, Outcome::Degraded)
                .duration(started.elapsed())
                .detail(&detail),
        );
    }

    /// Read `key`, or fetch, store and return the value on a miss.
    ///
    /// `ttl = None` uses [`ReaderConfig::default_ttl`]. With
    /// [`FailurePolicy::FailOpen`] a store that cannot be read is bypassed and
    /// the value is fetched directly, and a failed write still returns the
    /// fetched value. With [`FailurePolicy::FailClosed`] store errors
    /// propagate. Fetch errors always propagate and nothing is written.
    ///
    /// Stored bytes that do not decode as `T` are an error under both
    /// policies.
    pub async fn get_cached<T, F, Fut>(
        &self,
        key: impl CacheKey,
        fetch: F,
        ttl: Option<Duration>,
        policy: FailurePolicy,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        let full_key = self.full_key(&key.cache_key());
        let started = Instant::now();

        let mut bypass = false;
        match self.store.get(&full_key).await {
            Ok(Some(bytes)) => {
                let value = self.serializer.deserialize::<T>(&bytes)?;
                self.emit("get_cached", &full_key, Outcome::Hit, started);
                return Ok(value);
            }
            Ok(None) => self.emit("get_cached", &full_key, Outcome::Miss, started),
            Err(e) if e.is_store_error() && policy.is_open() => {
                self.emit_degraded("get_cached", &full_key, &e, started);
                bypass = true;
            }
            Err(e) => return Err(e),
        }

        let value = fetch().await?;
        if bypass {
            return Ok(value);
        }

        let ttl = self.apply_ttl_jitter(ttl.unwrap_or(self.config.default_ttl));
        let bytes = self.serializer.serialize(&value)?;
        match self.store.set(&full_key, bytes, Some(ttl)).await {
            Ok(()) => Ok(value),
            Err(e) if e.is_store_error() && policy.is_open() => {
                self.emit_degraded("cache_write", &full_key, &e, started);
                Ok(value)
            }
            Err(e) => Err(e),
        }
    }

    /// Plain typed read without fetching
    pub async fn get<T: DeserializeOwned>(&self, key: impl CacheKey) -> Result<Option<T>> {
        let full_key = self.full_key(&key.cache_key());
        let started = Instant::now();

        match self.store.get(&full_key).await? {
            Some(bytes) => {
                let value = self.serializer.deserialize(&bytes)?;
                self.emit("get", &full_key, Outcome::Hit, started);
                Ok(Some(value))
            }
            None => {
                self.emit("get", &full_key, Outcome::Miss, started);
                Ok(None)
            }
        }
    }

    /// Write a value, replacing any prior entry
    pub async fn put<T: Serialize>(
        &self,
        key: impl CacheKey,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let full_key = self.full_key(&key.cache_key());
        let ttl = self.apply_ttl_jitter(ttl.unwrap_or(self.config.default_ttl));
        let bytes = self.serializer.serialize(value)?;
        self.store.set(&full_key, bytes, Some(ttl)).await
    }

    /// Remove a cached value
    pub async fn remove(&self, key: impl CacheKey) -> Result<bool> {
        let full_key = self.full_key(&key.cache_key());
        self.store.delete(&full_key).await
    }
}

impl<St, S, E> Clone for CacheAsideReader<St, S, E>
where
    St: KeyValueStore,
    S: Serializer,
    E: EventSink,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            serializer: self.serializer.clone(),
            sink: self.sink.clone(),
            config: self.config.clone(),
        }
    }
}
