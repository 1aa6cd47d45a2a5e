//! Cache Entry Module
//!
//! Defines the on-disk envelope and the value sum type it carries.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

// == Cache Value ==
/// A stored payload.
///
/// Every supported serialization format can round-trip this type, including
/// non-self-describing ones, so envelopes can be decoded without knowing the
/// caller's original Rust type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<CacheValue>),
    Map(BTreeMap<String, CacheValue>),
}

impl CacheValue {
    /// Converts any serde-serializable value via its JSON data model.
    pub fn from_serde<T: Serialize>(value: &T) -> Result<Self> {
        let json = serde_json::to_value(value)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        Ok(Self::from(json))
    }

    /// Rebuilds a typed value previously stored with [`CacheValue::from_serde`].
    pub fn deserialize_into<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.to_json()).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    /// Integer view used by increment/decrement.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            CacheValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CacheValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// False if any float inside is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        match self {
            CacheValue::Float(f) => f.is_finite(),
            CacheValue::List(items) => items.iter().all(Self::is_finite),
            CacheValue::Map(map) => map.values().all(Self::is_finite),
            _ => true,
        }
    }

    fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            CacheValue::Null => Value::Null,
            CacheValue::Bool(b) => Value::Bool(*b),
            CacheValue::Int(n) => Value::from(*n),
            CacheValue::Float(f) => Value::from(*f),
            CacheValue::Str(s) => Value::String(s.clone()),
            CacheValue::Bytes(b) => Value::Array(b.iter().map(|x| Value::from(*x)).collect()),
            CacheValue::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            CacheValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for CacheValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => CacheValue::Null,
            Value::Bool(b) => CacheValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => CacheValue::Int(i),
                None => CacheValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => CacheValue::Str(s),
            Value::Array(items) => CacheValue::List(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => {
                CacheValue::Map(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<bool> for CacheValue {
    fn from(value: bool) -> Self {
        CacheValue::Bool(value)
    }
}

impl From<i64> for CacheValue {
    fn from(value: i64) -> Self {
        CacheValue::Int(value)
    }
}

impl From<i32> for CacheValue {
    fn from(value: i32) -> Self {
        CacheValue::Int(value.into())
    }
}

impl From<f64> for CacheValue {
    fn from(value: f64) -> Self {
        CacheValue::Float(value)
    }
}

impl From<&str> for CacheValue {
    fn from(value: &str) -> Self {
        CacheValue::Str(value.to_string())
    }
}

impl From<String> for CacheValue {
    fn from(value: String) -> Self {
        CacheValue::Str(value)
    }
}

impl From<Vec<u8>> for CacheValue {
    fn from(value: Vec<u8>) -> Self {
        CacheValue::Bytes(value)
    }
}

// == Envelope ==
/// One cache entry as persisted on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Logical key, without namespace or prefix
    pub key: String,
    pub value: CacheValue,
    /// Creation timestamp (Unix milliseconds)
    pub created: u64,
    /// Last write timestamp (Unix milliseconds)
    pub updated: u64,
    /// Expiration timestamp (Unix milliseconds), None = no expiration
    pub expires: Option<u64>,
    /// Read counter, only maintained when statistics are enabled
    pub hits: u64,
    pub tags: Vec<String>,
}

impl Envelope {
    // == Constructor ==
    /// Creates a fresh envelope stamped with the current time.
    pub fn new(key: impl Into<String>, value: CacheValue, expires: Option<u64>) -> Self {
        let now = current_timestamp_ms();
        Self {
            key: key.into(),
            value,
            created: now,
            updated: now,
            expires,
            hits: 0,
            tags: Vec::new(),
        }
    }

    // == Is Expired ==
    /// Checks if the entry has expired.
    ///
    /// An entry is expired once the current time is greater than or equal to
    /// its expiration time.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(current_timestamp_ms())
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        matches!(self.expires, Some(expires) if now_ms >= expires)
    }

    // == Time To Live ==
    /// Returns remaining TTL in milliseconds, or None if no expiration is set.
    ///
    /// # Returns
    /// - `Some(0)` if the entry has expired
    /// - `Some(remaining_ms)` if the entry has TTL and hasn't expired
    /// - `None` if the entry never expires
    pub fn ttl_remaining_ms(&self) -> Option<u64> {
        self.expires
            .map(|expires| expires.saturating_sub(current_timestamp_ms()))
    }

    /// Replaces the payload and bumps `updated`, keeping creation time, hits and tags.
    pub fn rewrite(&mut self, value: CacheValue) {
        self.value = value;
        self.updated = current_timestamp_ms();
    }

    /// Sets the tag list, deduplicated and sorted.
    pub fn set_tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        tags.sort();
        tags.dedup();
        self.tags = tags;
    }
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
