//! Key-value store trait

use async_trait::async_trait;
use std::time::Duration;

use crate::{KeyTtl, KvError, WindowCount};

/// Client-side view of the external key-value store.
///
/// Every component receives an explicitly constructed handle implementing
/// this trait; none of them owns the connection lifecycle. Implementations
/// include an in-memory store and Redis.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Get the raw value stored under `key`
    ///
    /// Returns `None` if the key doesn't exist or has expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Store `value` under `key`, fully replacing any prior entry.
    ///
    /// `ttl = None` stores the value without expiry.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Delete a key
    ///
    /// Returns `true` if the key existed and was deleted.
    async fn delete(&self, key: &str) -> Result<bool, KvError>;

    /// Delete multiple keys
    ///
    /// Returns the number of keys that were deleted.
    async fn delete_many(&self, keys: &[String]) -> Result<u64, KvError>;

    /// Atomically increment the integer stored under `key`
    ///
    /// A missing key counts as 0. Returns the value after the increment.
    async fn incr(&self, key: &str) -> Result<i64, KvError>;

    /// Set an expiry on an existing key
    ///
    /// Returns `false` if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError>;

    /// Remaining lifetime of a key
    async fn ttl(&self, key: &str) -> Result<KeyTtl, KvError>;

    /// List keys matching a glob pattern (`*`, `?`, `[...]`)
    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, KvError>;

    /// Increment `key` and, when the increment created it, expire it after
    /// `window`, as ONE atomic store operation.
    ///
    /// A counter found without an expiry is given `window` again, so a crash
    /// can never leave a permanent counter behind.
    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount, KvError>;

    /// Check that the store answers
    async fn ping(&self) -> Result<(), KvError> {
        Ok(())
    }
}
