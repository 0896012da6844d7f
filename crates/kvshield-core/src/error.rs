//! Error types for kvshield operations

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Main error type for all kvshield operations
#[derive(Error, Debug, Clone)]
pub enum KvError {
    /// Store connection failed
    #[error("connection error: {0}")]
    Connection(String),

    /// Store command failed
    #[error("backend error: {0}")]
    Backend(String),

    /// Store command did not answer in time
    #[error("operation timed out")]
    Timeout,

    /// Serialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Stored bytes do not match the requested type
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Fixed-window quota hit
    #[error("rate limit exceeded for {key}: limit {limit}, resets in {}s", .reset.as_secs())]
    RateLimitExceeded {
        key: String,
        limit: u64,
        remaining: u64,
        reset: Duration,
    },

    /// Invalid component input
    #[error("validation error: {0}")]
    Validation(String),

    /// Scheduled handler failed
    #[error(transparent)]
    Task(#[from] TaskError),

    /// Manual trigger of a task that is already running
    #[error("task already running: {0}")]
    AlreadyRunning(String),

    /// Caller-supplied fetch or loader failed
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl KvError {
    /// Wrap a caller error coming out of a fetch function or loader
    pub fn fetch(err: impl fmt::Display) -> Self {
        KvError::Fetch(err.to_string())
    }

    /// Whether this error came from the key-value store itself
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            KvError::Connection(_) | KvError::Backend(_) | KvError::Timeout
        )
    }

    /// Retry-after guidance for throttled callers
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            KvError::RateLimitExceeded { reset, .. } => Some(*reset),
            _ => None,
        }
    }

    /// Map to what an external caller is allowed to see.
    ///
    /// Throttling is surfaced explicitly; everything else collapses into a
    /// generic internal error and the detail stays in the logs.
    pub fn to_public(&self) -> PublicError {
        match self {
            KvError::RateLimitExceeded { limit, reset, .. } => PublicError::Throttled {
                limit: *limit,
                retry_after: *reset,
            },
            _ => PublicError::Internal,
        }
    }
}

/// Error shape exposed to external callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicError {
    /// Too many requests; retry after the given delay
    Throttled { limit: u64, retry_after: Duration },
    /// Any other failure
    Internal,
}

impl PublicError {
    /// HTTP-style status code for the error
    pub fn status_code(&self) -> u16 {
        match self {
            PublicError::Throttled { .. } => 429,
            PublicError::Internal => 500,
        }
    }
}

impl fmt::Display for PublicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublicError::Throttled { retry_after, .. } => write!(
                f,
                "too many requests, retry after {}s",
                retry_after.as_secs().max(1)
            ),
            PublicError::Internal => f.write_str("internal error"),
        }
    }
}

/// Failure reported by a scheduled task handler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("task error: {message}")]
pub struct TaskError {
    message: String,
    retryable: bool,
}

impl TaskError {
    /// A failure that is eligible for the deferred retry
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that must not be retried automatically
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl From<KvError> for TaskError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::Task(task) => task,
            other => TaskError::new(other.to_string()),
        }
    }
}

/// Result type alias for kvshield operations
pub type Result<T> = std::result::Result<T, KvError>;
