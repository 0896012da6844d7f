//! Exponential backoff retry

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use kvshield_core::{Component, Event, EventSink, Outcome, TracingSink};

/// Backoff settings for [`RetryExecutor`]
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Wait before the first retry
    pub initial_delay: Duration,
    /// Ceiling for any single wait
    pub max_delay: Duration,
    /// Growth factor between consecutive waits
    pub multiplier: f64,
    /// Random extra wait as a fraction of the computed delay (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            ..Default::default()
        }
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn jitter(mut self, fraction: f64) -> Self {
        self.jitter = fraction.clamp(0.0, 1.0);
        self
    }

    /// Wait before retry number `retries_made + 1`, without jitter.
    ///
    /// `initial_delay * multiplier^retries_made`, capped at `max_delay`.
    pub fn delay_for(&self, retries_made: u32) -> Duration {
        let factor = self.multiplier.powi(retries_made.min(i32::MAX as u32) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let cap = self.max_delay.as_millis() as f64;
        if !millis.is_finite() || millis >= cap {
            self.max_delay
        } else {
            Duration::from_millis(millis as u64)
        }
    }

    fn jittered_delay(&self, retries_made: u32) -> Duration {
        let base = self.delay_for(retries_made);
        if self.jitter <= 0.0 {
            return base;
        }
        let extra = base.mul_f64(self.jitter * rand::random::<f64>());
        base.saturating_add(extra).min(self.max_delay)
    }
}

/// Progress of a retried operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// Attempts made so far, including the first
    pub attempt: u32,
    /// Retries still allowed after the upcoming one
    pub remaining: u32,
    /// Wait before the next attempt
    pub delay: Duration,
}

impl RetryState {
    /// The upcoming retry is the last one
    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }
}

impl fmt::Display for RetryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attempt {}, {} retries left, next in {}ms",
            self.attempt,
            self.remaining,
            self.delay.as_millis()
        )
    }
}

/// Runs a fallible async operation with exponential backoff.
///
/// Delays are plain tokio sleeps; dropping the returned future abandons the
/// remaining attempts.
pub struct RetryExecutor<E = TracingSink>
where
    E: EventSink,
{
    policy: RetryPolicy,
    sink: Arc<E>,
    name: String,
}

impl RetryExecutor<TracingSink> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_sink(policy, Arc::new(TracingSink::new()))
    }
}

impl<E: EventSink> RetryExecutor<E> {
    pub fn with_sink(policy: RetryPolicy, sink: Arc<E>) -> Self {
        Self {
            policy,
            sink,
            name: "retry".to_string(),
        }
    }

    /// Label used as the subject of retry events
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Retry on every error
    pub async fn run<T, Er, F, Fut>(&self, op: F) -> Result<T, Er>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Er>>,
        Er: fmt::Display,
    {
        self.run_if(op, |_| true).await
    }

    /// Retry while `should_retry` accepts the error and retries remain.
    ///
    /// Returns the first success or the last error.
    pub async fn run_if<T, Er, F, Fut, P>(&self, op: F, should_retry: P) -> Result<T, Er>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Er>>,
        Er: fmt::Display,
        P: Fn(&Er) -> bool,
    {
        self.run_policy(&self.policy, op, should_retry).await
    }

    /// Like [`run_if`](Self::run_if), with the retry count and first delay
    /// given per call. Cap, multiplier and jitter come from the executor's
    /// policy.
    pub async fn run_with<T, Er, F, Fut, P>(
        &self,
        op: F,
        max_retries: u32,
        initial_delay: Duration,
        should_retry: P,
    ) -> Result<T, Er>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Er>>,
        Er: fmt::Display,
        P: Fn(&Er) -> bool,
    {
        let policy = RetryPolicy {
            max_retries,
            initial_delay,
            ..self.policy.clone()
        };
        self.run_policy(&policy, op, should_retry).await
    }

    async fn run_policy<T, Er, F, Fut, P>(
        &self,
        policy: &RetryPolicy,
        mut op: F,
        should_retry: P,
    ) -> Result<T, Er>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Er>>,
        Er: fmt::Display,
        P: Fn(&Er) -> bool,
    {
        let started = Instant::now();
        let mut retries_made = 0u32;

        loop {
            let err = match op().await {
                Ok(value) => {
                    if retries_made > 0 {
                        self.sink.record(
                            &Event::new(Component::Retry, "run", &self.name, Outcome::Success)
                                .duration(started.elapsed())
                                .count(u64::from(retries_made + 1)),
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let remaining = policy.max_retries.saturating_sub(retries_made);
            if remaining == 0 || !should_retry(&err) {
                let detail = err.to_string();
                self.sink.record(
                    &Event::new(Component::Retry, "run", &self.name, Outcome::Failure)
                        .duration(started.elapsed())
                        .count(u64::from(retries_made + 1))
                        .detail(&detail),
                );
                return Err(err);
            }

            let state = RetryState {
                attempt: retries_made + 1,
                remaining: remaining - 1,
                delay: policy.jittered_delay(retries_made),
            };
            let detail = format!("{state}: {err}");
            self.sink.record(
                &Event::new(Component::Retry, "run", &self.name, Outcome::Retrying)
                    .duration(started.elapsed())
                    .count(u64::from(state.attempt))
                    .detail(&detail),
            );

            tokio::time::sleep(state.delay).await;
            retries_made += 1;
        }
    }
}

impl<E: EventSink> Clone for RetryExecutor<E> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy.clone(),
            sink: self.sink.clone(),
            name: self.name.clone(),
        }
    }
}
