//! Rate limit decision

use std::time::Duration;

/// Outcome of an allowed rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    /// Configured quota for the window
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// Time until the window resets
    pub reset: Duration,
    /// Set when the store was unreachable and the request was let through
    pub degraded: bool,
}

impl RateLimitStatus {
    /// Requests already counted in the current window
    pub fn used(&self) -> u64 {
        self.limit - self.remaining
    }
}
