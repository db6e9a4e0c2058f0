//! Stateful retry: correlation keys and the context cache.

use super::RetryContext;
use crate::classify::Classifier;
use crate::errors::{BatchError, BatchResult};
use dashmap::DashMap;
use std::fmt::Debug;
use std::sync::Arc;

/// Identifies the unit of work being retried across transactions.
#[derive(Debug, Clone)]
pub struct RetryState {
    key: String,
    force_refresh: bool,
    rollback_classifier: Option<Arc<dyn Classifier<bool>>>,
}

impl RetryState {
    /// Creates a state for the given key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            force_refresh: false,
            rollback_classifier: None,
        }
    }

    /// Ignores any cached context for this key and starts over.
    #[must_use]
    pub fn with_force_refresh(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }

    /// Decides which errors force an immediate rethrow (and rollback).
    #[must_use]
    pub fn with_rollback_classifier(mut self, classifier: Arc<dyn Classifier<bool>>) -> Self {
        self.rollback_classifier = Some(classifier);
        self
    }

    /// Returns the correlation key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns true if cached state should be ignored.
    #[must_use]
    pub fn is_force_refresh(&self) -> bool {
        self.force_refresh
    }

    /// Returns true if `error` must be rethrown so the caller can roll back.
    /// Without a classifier every error rolls back.
    #[must_use]
    pub fn rollback_for(&self, error: &BatchError) -> bool {
        self.rollback_classifier
            .as_ref()
            .map_or(true, |classifier| classifier.classify(error))
    }
}

/// Storage for retry contexts between transactional attempts.
pub trait RetryContextCache: Send + Sync + Debug {
    /// Returns the context for a key.
    fn get(&self, key: &str) -> Option<Arc<RetryContext>>;

    /// Stores a context.
    fn put(&self, key: &str, ctx: Arc<RetryContext>) -> BatchResult<()>;

    /// Removes a context.
    fn remove(&self, key: &str);

    /// Checks if a key is present.
    fn contains_key(&self, key: &str) -> bool;
}

/// In-memory, capacity-bounded cache.
///
/// Entries are removed when their retry succeeds or is exhausted. A full
/// cache usually means keys are not stable across attempts.
#[derive(Debug)]
pub struct MapRetryContextCache {
    map: DashMap<String, Arc<RetryContext>>,
    capacity: usize,
}

impl Default for MapRetryContextCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl MapRetryContextCache {
    /// Default maximum number of entries.
    pub const DEFAULT_CAPACITY: usize = 4096;

    /// Creates a cache with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            map: DashMap::new(),
            capacity,
        }
    }

    /// Number of cached contexts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl RetryContextCache for MapRetryContextCache {
    fn get(&self, key: &str) -> Option<Arc<RetryContext>> {
        self.map.get(key).map(|entry| Arc::clone(entry.value()))
    }

    fn put(&self, key: &str, ctx: Arc<RetryContext>) -> BatchResult<()> {
        if !self.map.contains_key(key) && self.map.len() >= self.capacity {
            return Err(BatchError::RetryCacheCapacityExceeded {
                capacity: self.capacity,
            });
        }
        self.map.insert(key.to_string(), ctx);
        Ok(())
    }

    fn remove(&self, key: &str) {
        self.map.remove(key);
    }

    fn contains_key(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorKindClassifier;

    #[test]
    fn test_rollback_for_defaults_to_true() {
        let state = RetryState::new("item-1");
        assert!(state.rollback_for(&BatchError::item("any", "x")));

        let state = state.with_rollback_classifier(Arc::new(ErrorKindClassifier::excluding(["validation"])));
        assert!(!state.rollback_for(&BatchError::item("validation", "x")));
        assert!(state.rollback_for(&BatchError::item("io", "x")));
    }

    #[test]
    fn test_cache_capacity() {
        let cache = MapRetryContextCache::new(1);
        cache.put("a", Arc::new(RetryContext::new(None))).unwrap();
        cache.put("a", Arc::new(RetryContext::new(None))).unwrap();

        let err = cache.put("b", Arc::new(RetryContext::new(None))).unwrap_err();
        assert_eq!(err, BatchError::RetryCacheCapacityExceeded { capacity: 1 });

        cache.remove("a");
        assert!(cache.is_empty());
        assert!(cache.put("b", Arc::new(RetryContext::new(None))).is_ok());
        assert!(cache.contains_key("b"));
    }
}
