//! Serialization contract for cached values

use crate::KvError;
use serde::{de::DeserializeOwned, Serialize};
use std::any::type_name;

/// Trait for pluggable serialization formats
///
/// Values are always read back into an explicit Rust type; bytes that do not
/// fit that type produce [`KvError::Deserialization`] naming the type.
pub trait Serializer: Send + Sync + Clone + 'static {
    /// Name of the serializer (for logs)
    fn name(&self) -> &str;

    /// Serialize a value to bytes
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, KvError>;

    /// Deserialize bytes into `T`
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, KvError>;
}

fn decode_error<T>(format: &str, err: impl std::fmt::Display) -> KvError {
    KvError::Deserialization(format!("{format} into {}: {err}", type_name::<T>()))
}

fn encode_error<T>(format: &str, err: impl std::fmt::Display) -> KvError {
    KvError::Serialization(format!("{format} from {}: {err}", type_name::<T>()))
}

/// JSON serializer (default)
///
/// Matches what other services sharing the store read and write.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &str {
        "json"
    }

    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, KvError> {
        serde_json::to_vec(value).map_err(|e| encode_error::<T>("json", e))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, KvError> {
        serde_json::from_slice(bytes).map_err(|e| decode_error::<T>("json", e))
    }
}

/// MessagePack serializer
///
/// Enable with `msgpack` feature.
#[cfg(feature = "msgpack")]
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackSerializer;

#[cfg(feature = "msgpack")]
impl Serializer for MsgPackSerializer {
    fn name(&self) -> &str {
        "msgpack"
    }

    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, KvError> {
        rmp_serde::to_vec(value).map_err(|e| encode_error::<T>("msgpack", e))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, KvError> {
        rmp_serde::from_slice(bytes).map_err(|e| decode_error::<T>("msgpack", e))
    }
}

/// Bincode serializer
///
/// Enable with `bincode` feature.
#[cfg(feature = "bincode")]
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeSerializer;

#[cfg(feature = "bincode")]
impl Serializer for BincodeSerializer {
    fn name(&self) -> &str {
        "bincode"
    }

    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, KvError> {
        bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(|e| encode_error::<T>("bincode", e))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, KvError> {
        let (val, _len) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| decode_error::<T>("bincode", e))?;
        Ok(val)
    }
}
