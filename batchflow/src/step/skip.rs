//! Skip policies.

use crate::classify::{Classifier, ErrorKindClassifier};
use crate::errors::{BatchError, BatchResult};
use std::fmt::Debug;
use std::sync::Arc;

/// Decides whether a failed item may be left out of the chunk.
pub trait SkipPolicy: Send + Sync + Debug {
    /// Returns true if the item that raised `error` may be skipped, given the
    /// number of items skipped so far in the step.
    ///
    /// Fails with [`BatchError::SkipLimitExceeded`] when the error is
    /// skippable but the limit has been reached.
    fn should_skip(&self, error: &BatchError, skip_count: usize) -> BatchResult<bool>;
}

/// Skips classified errors up to a limit.
#[derive(Debug, Clone)]
pub struct LimitCheckingItemSkipPolicy {
    skip_limit: usize,
    skippable: Arc<dyn Classifier<bool>>,
}

impl LimitCheckingItemSkipPolicy {
    /// Skips errors of the given kinds (and their sub-kinds).
    #[must_use]
    pub fn new<I, S>(skip_limit: usize, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_classifier(skip_limit, Arc::new(ErrorKindClassifier::including(kinds)))
    }

    /// Skips errors the classifier accepts.
    #[must_use]
    pub fn with_classifier(skip_limit: usize, skippable: Arc<dyn Classifier<bool>>) -> Self {
        Self {
            skip_limit,
            skippable,
        }
    }

    /// The configured limit.
    #[must_use]
    pub fn skip_limit(&self) -> usize {
        self.skip_limit
    }
}

impl SkipPolicy for LimitCheckingItemSkipPolicy {
    fn should_skip(&self, error: &BatchError, skip_count: usize) -> BatchResult<bool> {
        if !self.skippable.classify(error) {
            return Ok(false);
        }
        if skip_count < self.skip_limit {
            Ok(true)
        } else {
            Err(BatchError::SkipLimitExceeded {
                limit: self.skip_limit,
                cause: Box::new(error.clone()),
            })
        }
    }
}

/// Skips everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysSkipItemSkipPolicy;

impl SkipPolicy for AlwaysSkipItemSkipPolicy {
    fn should_skip(&self, _error: &BatchError, _skip_count: usize) -> BatchResult<bool> {
        Ok(true)
    }
}

/// Skips nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverSkipItemSkipPolicy;

impl SkipPolicy for NeverSkipItemSkipPolicy {
    fn should_skip(&self, _error: &BatchError, _skip_count: usize) -> BatchResult<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_checking() {
        let policy = LimitCheckingItemSkipPolicy::new(2, ["poison"]);
        let poison = BatchError::item("poison.format", "bad");

        assert_eq!(policy.should_skip(&poison, 0), Ok(true));
        assert_eq!(policy.should_skip(&poison, 1), Ok(true));
        assert!(matches!(
            policy.should_skip(&poison, 2),
            Err(BatchError::SkipLimitExceeded { limit: 2, .. })
        ));
        assert_eq!(policy.should_skip(&BatchError::item("io", "down"), 0), Ok(false));
    }

    #[test]
    fn test_always_and_never() {
        let err = BatchError::item("any", "x");
        assert_eq!(AlwaysSkipItemSkipPolicy.should_skip(&err, 1_000), Ok(true));
        assert_eq!(NeverSkipItemSkipPolicy.should_skip(&err, 0), Ok(false));
    }
}
