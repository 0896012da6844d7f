//! kvshield-storage: Key-value store backends for kvshield

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "memory")]
pub use memory::{MemoryConfig, MemoryStore, SweeperHandle};

#[cfg(feature = "redis")]
pub use crate::redis::{RedisConfig, RedisStore};
