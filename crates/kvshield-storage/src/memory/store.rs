//! In-memory key-value store using DashMap

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use kvshield_core::{KeyTtl, KeyValueStore, KvError, Result, WindowCount};

use super::pattern;
use super::ttl_index::TtlIndex;

/// Configuration for the memory store
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Initial map capacity
    pub initial_capacity: usize,
    /// Resolution of the expiry wheel
    pub ttl_resolution: Duration,
    /// Longest TTL the expiry wheel places without wrapping
    pub max_ttl: Duration,
    /// Interval used by [`MemoryStore::spawn_sweeper`]
    pub sweep_interval: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 1024,
            ttl_resolution: Duration::from_secs(1),
            max_ttl: Duration::from_secs(86400), // 24 hours
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl MemoryConfig {
    /// Set the sweep interval
    pub fn sweep_every(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

#[derive(Debug, Clone)]
struct Stored {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

/// Deadline `ttl` from `now`; a TTL past the clock's range never expires.
fn deadline(now: Instant, ttl: Duration) -> Option<Instant> {
    now.checked_add(ttl)
}

impl Stored {
    fn new(value: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.and_then(|ttl| deadline(Instant::now(), ttl)),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn remaining(&self, now: Instant) -> KeyTtl {
        match self.expires_at {
            Some(at) => KeyTtl::Expires(at.saturating_duration_since(now)),
            None => KeyTtl::Persistent,
        }
    }
}

fn parse_counter(value: &[u8]) -> Result<i64> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| KvError::Backend("value is not an integer or out of range".to_string()))
}

/// In-memory key-value store with Redis semantics.
///
/// Single-process only. Expired keys disappear lazily on access and eagerly
/// through [`purge_expired`](Self::purge_expired). Cloning creates a new
/// handle to the SAME underlying store.
#[derive(Clone)]
pub struct MemoryStore {
    /// Main data store
    data: Arc<DashMap<String, Stored>>,
    /// TTL expiration index
    ttl_index: Arc<RwLock<TtlIndex>>,
    /// Configuration
    config: MemoryConfig,
}

impl MemoryStore {
    /// Create a new memory store
    pub fn new(config: MemoryConfig) -> Self {
        let ttl_index = TtlIndex::new(config.ttl_resolution, config.max_ttl);

        Self {
            data: Arc::new(DashMap::with_capacity(config.initial_capacity)),
            ttl_index: Arc::new(RwLock::new(ttl_index)),
            config,
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(MemoryConfig::default())
    }

    /// Number of stored keys, including expired keys not yet purged
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn track_expiry(&self, key: &str, expires_at: Option<Instant>) {
        let mut index = self.ttl_index.write();
        match expires_at {
            Some(at) => index.schedule(key, at.saturating_duration_since(Instant::now())),
            None => index.remove(key),
        }
    }

    /// Remove keys whose expiry has passed and return how many were removed
    pub fn purge_expired(&self) -> usize {
        let candidates = self.ttl_index.write().tick();
        let now = Instant::now();
        let mut count = 0;

        for key in candidates {
            let removed = self
                .data
                .remove_if(&key, |_, stored| stored.is_expired(now))
                .is_some();
            if removed {
                count += 1;
            } else if let Some(stored) = self.data.get(&key) {
                // Surfaced early by a wrapped wheel slot; put it back.
                if let Some(at) = stored.expires_at {
                    let remaining = at.saturating_duration_since(now);
                    drop(stored);
                    self.ttl_index.write().schedule(&key, remaining);
                }
            }
        }

        count
    }

    /// Run [`purge_expired`](Self::purge_expired) every `sweep_interval`
    /// until the returned handle is shut down or dropped.
    pub fn spawn_sweeper(&self) -> SweeperHandle {
        let store = self.clone();
        let (tx, mut rx) = oneshot::channel::<()>();
        let period = self.config.sweep_interval;

        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let purged = store.purge_expired();
                        if purged > 0 {
                            tracing::debug!(target: "kvshield", purged, "memory store sweep");
                        }
                    }
                    _ = &mut rx => break,
                }
            }
        });

        SweeperHandle { shutdown: Some(tx), join }
    }
}

/// Handle to a running sweeper task
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for it to exit
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.join).await;
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        let expired = match self.data.get(key) {
            Some(stored) if !stored.is_expired(now) => return Ok(Some(stored.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.data.remove_if(key, |_, stored| stored.is_expired(now));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let stored = Stored::new(value, ttl);
        let expires_at = stored.expires_at;
        self.data.insert(key.to_string(), stored);
        self.track_expiry(key, expires_at);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        match self.data.remove(key) {
            Some((_, stored)) => {
                self.ttl_index.write().remove(key);
                Ok(!stored.is_expired(now))
            }
            None => Ok(false),
        }
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        let mut count = 0;
        for key in keys {
            if self.delete(key).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let now = Instant::now();
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(Stored::new(b"1".to_vec(), None));
                    return Ok(1);
                }
                let stored = occupied.get_mut();
                let next = parse_counter(&stored.value)?
                    .checked_add(1)
                    .ok_or_else(|| KvError::Backend("increment would overflow".to_string()))?;
                stored.value = next.to_string().into_bytes();
                Ok(next)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Stored::new(b"1".to_vec(), None));
                Ok(1)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let expires_at = deadline(now, ttl);
        let updated = match self.data.get_mut(key) {
            Some(mut stored) if !stored.is_expired(now) => {
                stored.expires_at = expires_at;
                true
            }
            _ => false,
        };
        if updated {
            self.track_expiry(key, expires_at);
        }
        Ok(updated)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let now = Instant::now();
        Ok(match self.data.get(key) {
            Some(stored) if !stored.is_expired(now) => stored.remaining(now),
            _ => KeyTtl::Missing,
        })
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = pattern::compile(pattern)?;
        let now = Instant::now();
        Ok(self
            .data
            .iter()
            .filter(|entry| !entry.value().is_expired(now) && matcher.is_match(entry.key()))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount> {
        let now = Instant::now();
        // The entry guard holds the shard lock for the whole read-modify-write.
        let mut slot = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Stored::new(b"0".to_vec(), None));

        if slot.is_expired(now) {
            *slot = Stored::new(b"0".to_vec(), None);
        }

        let count = parse_counter(&slot.value)?
            .checked_add(1)
            .ok_or_else(|| KvError::Backend("increment would overflow".to_string()))?;
        slot.value = count.to_string().into_bytes();

        let opened = count == 1 || slot.expires_at.is_none();
        if opened {
            slot.expires_at = deadline(now, window);
        }
        let expires_at = slot.expires_at;
        let ttl = match slot.remaining(now) {
            KeyTtl::Expires(d) => d,
            _ => window,
        };
        drop(slot);

        if opened {
            self.track_expiry(key, expires_at);
        }

        Ok(WindowCount {
            count: count.max(0) as u64,
            ttl,
        })
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
