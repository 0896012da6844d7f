//! Fixed-window rate limiting on a shared counter

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use kvshield_core::{
    Component, Event, EventSink, FailurePolicy, KeyValueStore, KvError, Outcome, RateLimitStatus,
    Result, TracingSink,
};

/// Configuration for [`RateLimiter`]
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Prefix for counter keys
    pub key_prefix: String,
    /// Behaviour when the store cannot be reached
    pub failure_policy: FailurePolicy,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            key_prefix: "ratelimit".to_string(),
            failure_policy: FailurePolicy::FailOpen,
        }
    }
}

impl RateLimiterConfig {
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Reject requests instead of admitting them when the store fails
    pub fn fail_closed(mut self) -> Self {
        self.failure_policy = FailurePolicy::FailClosed;
        self
    }
}

/// Fixed-window rate limiter.
///
/// Each window is one counter in the store, created by the first request and
/// expiring `window` later. Increment and expiry happen in a single atomic
/// store operation, so concurrent callers across processes never leave a
/// counter without a TTL. Windows are fixed, not sliding: a client can send
/// up to twice the limit across a window boundary.
///
/// When the store is unreachable the default policy admits the request and
/// reports it as degraded. That trades protection for availability and is
/// logged on every occurrence.
pub struct RateLimiter<St, E = TracingSink>
where
    St: KeyValueStore,
    E: EventSink,
{
    store: Arc<St>,
    sink: Arc<E>,
    config: RateLimiterConfig,
}

impl<St: KeyValueStore> RateLimiter<St, TracingSink> {
    pub fn new(store: Arc<St>) -> Self {
        Self::with_config(store, RateLimiterConfig::default())
    }

    pub fn with_config(store: Arc<St>, config: RateLimiterConfig) -> Self {
        Self::with_sink(store, Arc::new(TracingSink::new()), config)
    }
}

impl<St, E> RateLimiter<St, E>
where
    St: KeyValueStore,
    E: EventSink,
{
    pub fn with_sink(store: Arc<St>, sink: Arc<E>, config: RateLimiterConfig) -> Self {
        Self {
            store,
            sink,
            config,
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    fn counter_key(&self, key: &str) -> String {
        format!("{}:{}", self.config.key_prefix, key)
    }

    fn validate(limit: u64, window: Duration) -> Result<()> {
        if limit == 0 {
            return Err(KvError::Validation("rate limit must be at least 1".into()));
        }
        if window.is_zero() {
            return Err(KvError::Validation("rate limit window must be non-zero".into()));
        }
        Ok(())
    }

    /// Count one request against `key` and decide whether it is admitted.
    ///
    /// Requests 1 through `limit` in a window are admitted; request
    /// `limit + 1` and later fail with [`KvError::RateLimitExceeded`] carrying
    /// the time until the window resets.
    pub async fn check(&self, key: &str, limit: u64, window: Duration) -> Result<RateLimitStatus> {
        Self::validate(limit, window)?;

        let counter = self.counter_key(key);
        let started = Instant::now();

        let current = match self.store.incr_window(&counter, window).await {
            Ok(current) => current,
            Err(e) if e.is_store_error() && self.config.failure_policy.is_open() => {
                let detail = e.to_string();
                self.sink.record(
                    &Event::new(Component::RateLimiter, "check", &counter, Outcome::Degraded)
                        .duration(started.elapsed())
                        .detail(&detail),
                );
                return Ok(RateLimitStatus {
                    limit,
                    remaining: limit,
                    reset: window,
                    degraded: true,
                });
            }
            Err(e) => return Err(e),
        };

        if current.count > limit {
            self.sink.record(
                &Event::new(Component::RateLimiter, "check", &counter, Outcome::Rejected)
                    .duration(started.elapsed())
                    .count(current.count),
            );
            return Err(KvError::RateLimitExceeded {
                key: key.to_string(),
                limit,
                remaining: 0,
                reset: current.ttl,
            });
        }

        self.sink.record(
            &Event::new(Component::RateLimiter, "check", &counter, Outcome::Allowed)
                .duration(started.elapsed())
                .count(current.count),
        );

        Ok(RateLimitStatus {
            limit,
            remaining: limit - current.count,
            reset: current.ttl,
            degraded: false,
        })
    }

    /// Current window usage for `key` without counting a request
    pub async fn status(&self, key: &str, limit: u64) -> Result<RateLimitStatus> {
        let counter = self.counter_key(key);

        let used = match self.store.get(&counter).await? {
            Some(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| KvError::Backend(format!("counter {counter} is not an integer")))?,
            None => 0,
        };
        let reset = self
            .store
            .ttl(&counter)
            .await?
            .remaining()
            .unwrap_or(Duration::ZERO);

        Ok(RateLimitStatus {
            limit,
            remaining: limit.saturating_sub(used),
            reset,
            degraded: false,
        })
    }

    /// Drop the current window for `key`
    pub async fn reset(&self, key: &str) -> Result<bool> {
        self.store.delete(&self.counter_key(key)).await
    }
}

impl<St, E> Clone for RateLimiter<St, E>
where
    St: KeyValueStore,
    E: EventSink,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            sink: self.sink.clone(),
            config: self.config.clone(),
        }
    }
}
