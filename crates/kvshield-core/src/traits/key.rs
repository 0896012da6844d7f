//! Cache key trait and deterministic key construction

use std::collections::BTreeMap;
use std::fmt::Display;

/// Delimiter between key segments
pub const KEY_DELIMITER: char = ':';

/// Trait for types that can be used as cache keys
///
/// Implement this trait to use custom types as cache keys.
pub trait CacheKey: Send + Sync {
    /// Generate the key string
    fn cache_key(&self) -> String;
}

impl CacheKey for String {
    fn cache_key(&self) -> String {
        self.clone()
    }
}

impl CacheKey for &str {
    fn cache_key(&self) -> String {
        self.to_string()
    }
}

impl CacheKey for &String {
    fn cache_key(&self) -> String {
        (*self).clone()
    }
}

/// Builds `prefix:name1:value1:name2:value2` keys.
///
/// Parameter names are kept sorted, so the same set of parameters always
/// yields the same key no matter the order they were added in. Setting a name
/// twice keeps the last value. Values are not escaped; a value containing the
/// delimiter is written as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeyBuilder {
    prefix: String,
    params: BTreeMap<String, String>,
}

impl CacheKeyBuilder {
    /// Start a key with the given prefix
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            params: BTreeMap::new(),
        }
    }

    /// Add a parameter
    pub fn param(mut self, name: impl Into<String>, value: impl Display) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    /// Add a parameter only when a value is present.
    ///
    /// Missing values are left out of the key instead of being written as a
    /// placeholder.
    pub fn opt_param<V: Display>(self, name: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(v) => self.param(name, v),
            None => self,
        }
    }

    /// Add multiple parameters
    pub fn params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Display,
    {
        self.params
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.to_string())));
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Produce the key string
    pub fn build(&self) -> String {
        let mut key = self.prefix.clone();
        for (name, value) in &self.params {
            key.push(KEY_DELIMITER);
            key.push_str(name);
            key.push(KEY_DELIMITER);
            key.push_str(value);
        }
        key
    }
}

impl CacheKey for CacheKeyBuilder {
    fn cache_key(&self) -> String {
        self.build()
    }
}

/// Build a key from a prefix and a parameter collection in one call
pub fn build_key<I, K, V>(prefix: &str, params: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Display,
{
    CacheKeyBuilder::new(prefix).params(params).build()
}
