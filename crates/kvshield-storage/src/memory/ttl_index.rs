//! Time-wheel index of keys by expiry slot

use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

/// Time-wheel based TTL index
///
/// Instead of scanning all keys to find expired ones, keys sit in buckets by
/// expiry slot. A key whose TTL is longer than the wheel is placed at the
/// wheel's horizon and surfaces early; callers must re-check the real
/// deadline before evicting.
pub struct TtlIndex {
    /// Tick duration (bucket resolution)
    tick: Duration,
    /// Buckets of keys by expiration slot
    buckets: Vec<HashSet<String>>,
    /// Current bucket index
    current: usize,
    /// Map of key -> bucket index for O(1) removal
    key_to_bucket: HashMap<String, usize>,
    /// Last tick time
    last_tick: Instant,
}

impl TtlIndex {
    /// Create a new TTL index
    ///
    /// # Arguments
    /// * `tick` - Resolution of each time bucket (e.g., 1 second)
    /// * `horizon` - Longest TTL placed without wrapping (determines number of buckets)
    pub fn new(tick: Duration, horizon: Duration) -> Self {
        let tick = tick.max(Duration::from_millis(1));
        let num_buckets = ((horizon.as_millis() / tick.as_millis()) as usize + 1).max(60);

        Self {
            tick,
            buckets: vec![HashSet::new(); num_buckets],
            current: 0,
            key_to_bucket: HashMap::new(),
            last_tick: Instant::now(),
        }
    }

    /// Schedule a key for expiration after `ttl`
    pub fn schedule(&mut self, key: &str, ttl: Duration) {
        self.remove(key);

        let ticks = usize::try_from(ttl.as_millis() / self.tick.as_millis())
            .unwrap_or(usize::MAX)
            .min(self.buckets.len() - 1);
        let bucket_idx = (self.current + ticks + 1) % self.buckets.len();

        self.buckets[bucket_idx].insert(key.to_string());
        self.key_to_bucket.insert(key.to_string(), bucket_idx);
    }

    /// Remove a key from the index
    pub fn remove(&mut self, key: &str) {
        if let Some(bucket_idx) = self.key_to_bucket.remove(key) {
            self.buckets[bucket_idx].remove(key);
        }
    }

    #[cfg(test)]
    /// Check if a key is scheduled
    pub fn contains(&self, key: &str) -> bool {
        self.key_to_bucket.contains_key(key)
    }

    /// Advance the wheel and return candidate keys whose slot has passed
    pub fn tick(&mut self) -> Vec<String> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_tick);
        let ticks_to_advance = (elapsed.as_millis() / self.tick.as_millis()) as usize;

        if ticks_to_advance == 0 {
            return Vec::new();
        }

        let mut expired = Vec::new();

        for _ in 0..ticks_to_advance.min(self.buckets.len()) {
            self.current = (self.current + 1) % self.buckets.len();
            let bucket_expired: Vec<String> = self.buckets[self.current].drain().collect();

            for key in &bucket_expired {
                self.key_to_bucket.remove(key);
            }

            expired.extend(bucket_expired);
        }

        // Keep the sub-tick remainder so slow sweeps do not drift.
        self.last_tick += self.tick * ticks_to_advance as u32;
        expired
    }

    #[cfg(test)]
    /// Get the number of scheduled keys
    pub fn len(&self) -> usize {
        self.key_to_bucket.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.key_to_bucket.is_empty()
    }

    #[cfg(test)]
    /// Clear all scheduled keys
    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.key_to_bucket.clear();
    }
}

impl Default for TtlIndex {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(86400))
    }
}
