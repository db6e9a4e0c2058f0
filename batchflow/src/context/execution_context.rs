//! The checkpoint map attached to job and step executions.

use crate::errors::{BatchError, BatchResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key-value checkpoint state of a job or step execution.
///
/// This is the only state carried across restarts. Writers of the context
/// must be idempotent: putting the same snapshot twice leaves the context
/// unchanged. The context tracks a dirty flag so repositories can skip
/// persisting unchanged state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    entries: Map<String, Value>,
    #[serde(skip)]
    dirty: bool,
}

impl PartialEq for ExecutionContext {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl ExecutionContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context from existing entries.
    #[must_use]
    pub fn from_map(entries: Map<String, Value>) -> Self {
        Self {
            entries,
            dirty: false,
        }
    }

    /// Stores a serializable value.
    pub fn put<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> BatchResult<()> {
        let value = serde_json::to_value(value)?;
        self.put_value(key, value);
        Ok(())
    }

    /// Stores a raw JSON value. Only marks the context dirty when the value changes.
    pub fn put_value(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if self.entries.get(&key) != Some(&value) {
            self.entries.insert(key, value);
            self.dirty = true;
        }
    }

    /// Stores a string.
    pub fn put_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.put_value(key, Value::String(value.into()));
    }

    /// Stores an integer.
    pub fn put_long(&mut self, key: impl Into<String>, value: i64) {
        self.put_value(key, Value::from(value));
    }

    /// Stores a float.
    pub fn put_double(&mut self, key: impl Into<String>, value: f64) {
        self.put_value(key, Value::from(value));
    }

    /// Reads and deserializes a value.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> BatchResult<Option<T>> {
        self.entries
            .get(key)
            .map(|value| serde_json::from_value(value.clone()).map_err(BatchError::from))
            .transpose()
    }

    /// Returns the raw value for a key.
    #[must_use]
    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Returns a string value.
    #[must_use]
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(Value::as_str)
    }

    /// Returns an integer value.
    #[must_use]
    pub fn get_long(&self, key: &str) -> Option<i64> {
        self.entries.get(key).and_then(Value::as_i64)
    }

    /// Returns an integer value or a default.
    #[must_use]
    pub fn get_long_or(&self, key: &str, default: i64) -> i64 {
        self.get_long(key).unwrap_or(default)
    }

    /// Returns a float value.
    #[must_use]
    pub fn get_double(&self, key: &str) -> Option<f64> {
        self.entries.get(key).and_then(Value::as_f64)
    }

    /// Checks if a key exists.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Removes a key, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// Copies every entry of `other` into this context.
    pub fn merge(&mut self, other: &Self) {
        for (key, value) in &other.entries {
            self.put_value(key.clone(), value.clone());
        }
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the context is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns all keys.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Iterates over entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    /// Returns true if the context changed since the last [`clear_dirty`](Self::clear_dirty).
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Resets the dirty flag after persisting.
    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }
}
