//! Flat property form of an execution context.

use super::ExecutionContext;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// String properties describing a component's position.
///
/// Every value is stored as its JSON text, so converting an
/// [`ExecutionContext`] to restart data and back is lossless. Properties that
/// are not valid JSON (for example written by hand) are read back as plain
/// strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartData {
    properties: BTreeMap<String, String>,
}

impl RestartData {
    /// Creates empty restart data.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a raw property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Returns a raw property.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Returns all properties.
    #[must_use]
    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Returns true if there are no properties.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

impl From<&ExecutionContext> for RestartData {
    fn from(ctx: &ExecutionContext) -> Self {
        let properties = ctx
            .iter()
            .map(|(key, value)| (key.clone(), value.to_string()))
            .collect();
        Self { properties }
    }
}

impl From<&RestartData> for ExecutionContext {
    fn from(data: &RestartData) -> Self {
        let mut ctx = Self::new();
        for (key, raw) in &data.properties {
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
            ctx.put_value(key.clone(), value);
        }
        ctx.clear_dirty();
        ctx
    }
}
