use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use bb8_redis::RedisConnectionManager;
use redis::{RedisError, Script};
use std::future::Future;
use std::time::Duration;

use kvshield_core::{KeyTtl, KeyValueStore, KvError, Result, WindowCount};

use super::config::RedisConfig;

/// INCR, open the window on the first hit, and re-arm a counter that lost its TTL.
const WINDOW_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

fn map_redis_error(e: RedisError) -> KvError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        KvError::Connection(e.to_string())
    } else {
        KvError::Backend(e.to_string())
    }
}

/// Redis rejects expiries that overflow its millisecond clock.
const MAX_EXPIRE_MS: u64 = (i64::MAX / 2) as u64;

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis())
        .unwrap_or(u64::MAX)
        .clamp(1, MAX_EXPIRE_MS)
}

/// Escape glob metacharacters so a literal prefix can lead a `MATCH` pattern.
fn escape_glob(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Redis-backed key-value store over a bb8 connection pool
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool<RedisConnectionManager>,
    config: RedisConfig,
    window_script: Script,
}

impl RedisStore {
    /// Connect and build the pool
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        let manager = RedisConnectionManager::new(config.url.as_str())
            .map_err(|e| KvError::Connection(e.to_string()))?;

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .connection_timeout(config.connection_timeout)
            .build(manager)
            .await
            .map_err(|e| KvError::Connection(e.to_string()))?;

        tracing::info!(target: "kvshield", url = %redact(&config.url), "redis store connected");

        Ok(Self {
            pool,
            config,
            window_script: Script::new(WINDOW_SCRIPT),
        })
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    fn prefixed_key(&self, key: &str) -> String {
        match &self.config.key_prefix {
            Some(prefix) => format!("{}:{}", prefix, key),
            None => key.to_string(),
        }
    }

    fn strip_prefix(&self, key: String) -> String {
        match &self.config.key_prefix {
            Some(prefix) => key
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix(':'))
                .map(str::to_string)
                .unwrap_or(key),
            None => key,
        }
    }

    async fn connection(&self) -> Result<PooledConnection<'_, RedisConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| KvError::Connection(e.to_string()))
    }

    /// Bound a command by `command_timeout`
    async fn timed<T>(&self, fut: impl Future<Output = redis::RedisResult<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.command_timeout, fut).await {
            Ok(result) => result.map_err(map_redis_error),
            Err(_) => Err(KvError::Timeout),
        }
    }
}

fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => format!("{}://***{}", &url[..scheme], &url[at..]),
        _ => url.to_string(),
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;
        let prefixed = self.prefixed_key(key);

        self.timed(redis::cmd("GET").arg(&prefixed).query_async(&mut *conn))
            .await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection().await?;
        let prefixed = self.prefixed_key(key);

        let mut cmd = redis::cmd("SET");
        cmd.arg(&prefixed).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        self.timed(cmd.query_async::<()>(&mut *conn)).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let prefixed = self.prefixed_key(key);

        let deleted: u64 = self
            .timed(redis::cmd("DEL").arg(&prefixed).query_async(&mut *conn))
            .await?;
        Ok(deleted > 0)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let prefixed_keys: Vec<String> = keys.iter().map(|k| self.prefixed_key(k)).collect();

        self.timed(redis::cmd("DEL").arg(&prefixed_keys).query_async(&mut *conn))
            .await
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection().await?;
        let prefixed = self.prefixed_key(key);

        self.timed(redis::cmd("INCR").arg(&prefixed).query_async(&mut *conn))
            .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;
        let prefixed = self.prefixed_key(key);

        let updated: i64 = self
            .timed(
                redis::cmd("PEXPIRE")
                    .arg(&prefixed)
                    .arg(millis(ttl))
                    .query_async(&mut *conn),
            )
            .await?;
        Ok(updated == 1)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let mut conn = self.connection().await?;
        let prefixed = self.prefixed_key(key);

        let pttl: i64 = self
            .timed(redis::cmd("PTTL").arg(&prefixed).query_async(&mut *conn))
            .await?;
        Ok(KeyTtl::from_pttl(pttl))
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;

        let match_pattern = match &self.config.key_prefix {
            Some(prefix) => format!("{}:{}", escape_glob(prefix), pattern),
            None => pattern.to_string(),
        };

        let mut cursor = 0u64;
        let mut found = Vec::new();

        loop {
            let (next_cursor, keys): (u64, Vec<String>) = self
                .timed(
                    redis::cmd("SCAN")
                        .cursor_arg(cursor)
                        .arg("MATCH")
                        .arg(&match_pattern)
                        .arg("COUNT")
                        .arg(self.config.scan_count)
                        .query_async(&mut *conn),
                )
                .await?;

            found.extend(keys.into_iter().map(|k| self.strip_prefix(k)));

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        // SCAN may return a key more than once across iterations.
        found.sort_unstable();
        found.dedup();
        Ok(found)
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount> {
        let mut conn = self.connection().await?;
        let prefixed = self.prefixed_key(key);

        let (count, ttl_ms): (i64, i64) = self
            .timed(
                self.window_script
                    .key(&prefixed)
                    .arg(millis(window))
                    .invoke_async(&mut *conn),
            )
            .await?;

        Ok(WindowCount {
            count: count.max(0) as u64,
            ttl: Duration::from_millis(ttl_ms.max(0) as u64),
        })
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let reply: String = self
            .timed(redis::cmd("PING").query_async(&mut *conn))
            .await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(KvError::Backend(format!("unexpected PING reply: {reply}")))
        }
    }
}
