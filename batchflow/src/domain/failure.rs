//! Failure records attached to executions.

use crate::errors::BatchError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Record of an error that ended (or was tolerated by) an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Step or job name.
    pub source: String,
    /// Error message.
    pub error: String,
    /// Classification kind of the error.
    pub error_kind: String,
    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,
    /// Additional context.
    pub context: HashMap<String, serde_json::Value>,
}

impl FailureRecord {
    /// Creates a new failure record.
    #[must_use]
    pub fn new(source: impl Into<String>, error: &BatchError) -> Self {
        Self {
            source: source.into(),
            error: error.to_string(),
            error_kind: error.root_cause().kind().to_string(),
            timestamp: Utc::now(),
            context: HashMap::new(),
        }
    }

    /// Adds context.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}
