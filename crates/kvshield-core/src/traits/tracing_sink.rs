use crate::{Component, Event, EventSink, Outcome};

macro_rules! emit {
    ($level:ident, $event:ident, $service:ident) => {
        tracing::$level!(
            target: "kvshield",
            component = $event.component.as_str(),
            operation = $event.operation,
            subject = %$event.subject,
            outcome = $event.outcome.as_str(),
            duration_ms = $event.duration.as_millis() as u64,
            count = ?$event.count,
            detail = ?$event.detail,
            service = ?$service,
            "{} {}",
            $event.component.as_str(),
            $event.operation
        )
    };
}

/// Sink that logs events via `tracing`.
///
/// Failures go out at `error`, degraded or refused work at `warn`, completed
/// background work (scheduler, warmer, invalidator) at `info` and per-request
/// traffic at `debug`.
#[derive(Debug, Clone, Default)]
pub struct TracingSink {
    /// Service name/prefix (optional)
    service_name: Option<String>,
}

impl TracingSink {
    /// Create new tracing sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with service name field
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }
}

impl EventSink for TracingSink {
    fn record(&self, event: &Event<'_>) {
        let service = self.service_name.as_deref();
        match event.outcome {
            Outcome::Failure => emit!(error, event, service),
            Outcome::Degraded | Outcome::Rejected | Outcome::Retrying | Outcome::Skipped => {
                emit!(warn, event, service)
            }
            _ if matches!(
                event.component,
                Component::Scheduler | Component::Warmer | Component::Invalidator
            ) =>
            {
                emit!(info, event, service)
            }
            _ => emit!(debug, event, service),
        }
    }
}
