//! Core traits for kvshield components

mod events;
mod key;
mod serializer;
mod store;
mod tracing_sink;

pub use events::{Component, Event, EventSink, NoopSink, Outcome};
pub use key::{build_key, CacheKey, CacheKeyBuilder, KEY_DELIMITER};
pub use serializer::{JsonSerializer, Serializer};
pub use store::KeyValueStore;
pub use tracing_sink::TracingSink;

#[cfg(feature = "metrics")]
pub use events::MetricsSink;

#[cfg(feature = "msgpack")]
pub use serializer::MsgPackSerializer;

#[cfg(feature = "bincode")]
pub use serializer::BincodeSerializer;
