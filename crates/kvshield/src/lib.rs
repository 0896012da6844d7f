//! kvshield: resilience and caching toolkit over a shared key-value store
//!
//! # Features
//!
//! - **Cache-aside reads** with an explicit fail-open / fail-closed policy
//! - **Fixed-window rate limiting** on an atomic store counter
//! - **Pattern invalidation** after successful mutations
//! - **Cache warmup** on a cancellable background interval
//! - **Bounded-concurrency batches**, **exponential backoff retries** and
//!   **scheduled tasks** with a single deferred retry
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use kvshield::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> kvshield::Result<()> {
//!     let store = Arc::new(MemoryStore::new(MemoryConfig::default()));
//!     let reader = CacheAsideReader::new(store.clone());
//!
//!     let key = CacheKeyBuilder::new("user").param("id", 42).build();
//!     let name: String = reader
//!         .get_cached(
//!             key.as_str(),
//!             || async { Ok("Alice".to_string()) },
//!             Some(Duration::from_secs(60)),
//!             FailurePolicy::FailClosed,
//!         )
//!         .await?;
//!
//!     let limiter = RateLimiter::new(store);
//!     limiter.check("api:client-1", 100, Duration::from_secs(60)).await?;
//!     println!("hello {name}");
//!     Ok(())
//! }
//! ```

mod batch;
mod invalidate;
mod rate_limit;
mod reader;
mod retry;
mod scheduler;
mod warmer;

// Re-export core
pub use kvshield_core::*;

// Re-export storage
#[cfg(feature = "memory")]
pub use kvshield_storage::{MemoryConfig, MemoryStore, SweeperHandle};

#[cfg(feature = "redis")]
pub use kvshield_storage::{RedisConfig, RedisStore};

pub use batch::BatchProcessor;
pub use invalidate::{CacheInvalidator, InvalidationReport, PatternReport};
pub use rate_limit::{RateLimiter, RateLimiterConfig};
pub use reader::{CacheAsideReader, ReaderConfig};
pub use retry::{RetryExecutor, RetryPolicy, RetryState};
pub use scheduler::{
    RunOutcome, Schedule, TaskHandler, TaskPhase, TaskRunner, TaskRunnerConfig, TaskStatus,
};
pub use warmer::{CacheWarmer, Loader, WarmReport, WarmerConfig, WarmerHandle};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        BatchProcessor, BatchResult, CacheAsideReader, CacheInvalidator, CacheKey,
        CacheKeyBuilder, CacheWarmer, FailurePolicy, JsonSerializer, KeyValueStore, KvError,
        Loader, RateLimiter, RateLimiterConfig, ReaderConfig, Result, RetryExecutor,
        RetryPolicy, Schedule, Serializer, TaskError, TaskHandler, TaskRunner, TaskRunnerConfig,
        WarmerConfig, build_key,
    };

    #[cfg(feature = "memory")]
    pub use crate::{MemoryConfig, MemoryStore};

    #[cfg(feature = "redis")]
    pub use crate::{RedisConfig, RedisStore};

    #[cfg(feature = "msgpack")]
    pub use crate::MsgPackSerializer;

    #[cfg(feature = "bincode")]
    pub use crate::BincodeSerializer;
}

#[cfg(all(test, feature = "memory"))]
mod tests;
