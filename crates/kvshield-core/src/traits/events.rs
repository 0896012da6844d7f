//! Structured event sink for component observability

use std::time::Duration;

/// Component emitting an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Cache,
    RateLimiter,
    Invalidator,
    Warmer,
    Batch,
    Retry,
    Scheduler,
}

impl Component {
    /// Get component as string label
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Cache => "cache",
            Component::RateLimiter => "rate_limiter",
            Component::Invalidator => "invalidator",
            Component::Warmer => "warmer",
            Component::Batch => "batch",
            Component::Retry => "retry",
            Component::Scheduler => "scheduler",
        }
    }
}

/// Outcome of the operation an event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Value served from the store
    Hit,
    /// Value absent from the store
    Miss,
    /// Request admitted by the rate limiter
    Allowed,
    /// Request rejected by the rate limiter
    Rejected,
    /// Store failed and the component continued without it
    Degraded,
    Success,
    Failure,
    /// Failure that will be attempted again
    Retrying,
    /// Work intentionally not performed (overlap, nothing to do)
    Skipped,
}

impl Outcome {
    /// Get outcome as string label
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Hit => "hit",
            Outcome::Miss => "miss",
            Outcome::Allowed => "allowed",
            Outcome::Rejected => "rejected",
            Outcome::Degraded => "degraded",
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Retrying => "retrying",
            Outcome::Skipped => "skipped",
        }
    }
}

/// One structured event: what ran, on which key or task, how long it took and
/// how it ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event<'a> {
    pub component: Component,
    pub operation: &'static str,
    /// Key, pattern or task name the operation acted on
    pub subject: &'a str,
    pub outcome: Outcome,
    pub duration: Duration,
    /// Error text or other free-form detail
    pub detail: Option<&'a str>,
    /// Item count where one applies (deleted keys, processed items)
    pub count: Option<u64>,
}

impl<'a> Event<'a> {
    pub fn new(
        component: Component,
        operation: &'static str,
        subject: &'a str,
        outcome: Outcome,
    ) -> Self {
        Self {
            component,
            operation,
            subject,
            outcome,
            duration: Duration::ZERO,
            detail: None,
            count: None,
        }
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn detail(mut self, detail: &'a str) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }
}

/// Injected logging capability.
///
/// Implement this to route component events to your own sink (log pipeline,
/// Prometheus, StatsD, ...).
pub trait EventSink: Send + Sync + 'static {
    /// Record one event
    fn record(&self, event: &Event<'_>);
}

/// No-op sink
///
/// Zero overhead when events are not needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    #[inline]
    fn record(&self, _event: &Event<'_>) {}
}

/// Sink using the `metrics` crate
///
/// Integrates with Prometheus, StatsD, and other exporters via the `metrics` ecosystem.
///
/// # Example
/// ```ignore
/// use kvshield_core::MetricsSink;
///
/// // Set up a metrics recorder (e.g., prometheus_exporter)
/// // metrics::set_global_recorder(recorder);
///
/// let sink = MetricsSink::new("kvshield");
/// // Emits: kvshield_events_total, kvshield_operation_duration_seconds
/// ```
#[cfg(feature = "metrics")]
#[derive(Debug, Clone)]
pub struct MetricsSink {
    prefix: String,
}

#[cfg(feature = "metrics")]
impl MetricsSink {
    /// Create a new sink with the given metric name prefix
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn metric_name(&self, name: &str) -> String {
        format!("{}_{}", self.prefix, name)
    }
}

#[cfg(feature = "metrics")]
impl EventSink for MetricsSink {
    fn record(&self, event: &Event<'_>) {
        metrics::counter!(
            self.metric_name("events_total"),
            "component" => event.component.as_str(),
            "operation" => event.operation,
            "outcome" => event.outcome.as_str()
        )
        .increment(1);

        if !event.duration.is_zero() {
            metrics::histogram!(
                self.metric_name("operation_duration_seconds"),
                "component" => event.component.as_str(),
                "operation" => event.operation
            )
            .record(event.duration.as_secs_f64());
        }
    }
}
