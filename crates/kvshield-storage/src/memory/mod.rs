//! In-memory key-value store

mod pattern;
mod store;
mod ttl_index;

pub use store::{MemoryConfig, MemoryStore, SweeperHandle};
