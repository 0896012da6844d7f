//! Expiry-related store results

use std::time::Duration;

/// Remaining lifetime of a key as reported by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key does not exist
    Missing,
    /// Key exists without an expiry
    Persistent,
    /// Key expires after the given duration
    Expires(Duration),
}

impl KeyTtl {
    /// Remaining duration, if the key has one
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            KeyTtl::Expires(d) => Some(*d),
            _ => None,
        }
    }

    /// Interpret a Redis `PTTL` reply (-2 missing, -1 no expiry)
    pub fn from_pttl(millis: i64) -> Self {
        match millis {
            -2 => KeyTtl::Missing,
            m if m < 0 => KeyTtl::Persistent,
            m => KeyTtl::Expires(Duration::from_millis(m as u64)),
        }
    }
}

/// Result of the atomic increment-and-open-window primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Counter value after the increment
    pub count: u64,
    /// Time until the window closes
    pub ttl: Duration,
}

impl WindowCount {
    /// Whether this increment opened the window
    pub fn is_first(&self) -> bool {
        self.count == 1
    }
}
