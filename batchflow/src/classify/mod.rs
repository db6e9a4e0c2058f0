//! Error classification.
//!
//! Retry policies, skip policies, rollback rules and exception handlers all
//! need to map a [`BatchError`] to a decision. They share the [`Classifier`]
//! trait and the dotted-kind lookup of [`ErrorKindClassifier`]:
//!
//! ```text
//! "transient.io.timeout" -> "transient.io" -> "transient" -> default
//! ```
//!
//! When no rule matches the error's own kind, the root cause of a wrapped
//! error (`RetryExhausted`, `SkipLimitExceeded`) is looked up the same way.

use crate::errors::BatchError;
use std::collections::HashMap;
use std::fmt::Debug;

/// Maps an error to a classification value.
pub trait Classifier<T>: Send + Sync + Debug {
    /// Classifies the error.
    fn classify(&self, error: &BatchError) -> T;
}

/// Classifier keyed by error kind with hierarchical fallback.
#[derive(Debug, Clone)]
pub struct ErrorKindClassifier<T> {
    rules: HashMap<String, T>,
    default: T,
}

impl<T: Clone> ErrorKindClassifier<T> {
    /// Creates a classifier with a default value and no rules.
    #[must_use]
    pub fn new(default: T) -> Self {
        Self {
            rules: HashMap::new(),
            default,
        }
    }

    /// Adds a rule for a kind and all of its sub-kinds.
    #[must_use]
    pub fn with_rule(mut self, kind: impl Into<String>, value: T) -> Self {
        self.rules.insert(kind.into(), value);
        self
    }

    /// Returns the default value.
    #[must_use]
    pub fn default_value(&self) -> &T {
        &self.default
    }

    fn lookup(&self, kind: &str) -> Option<&T> {
        let mut candidate = kind;
        loop {
            if let Some(value) = self.rules.get(candidate) {
                return Some(value);
            }
            match candidate.rfind('.') {
                Some(idx) => candidate = &candidate[..idx],
                None => return None,
            }
        }
    }
}

impl ErrorKindClassifier<bool> {
    /// Classifies the listed kinds as `true` and everything else as `false`.
    #[must_use]
    pub fn including<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        kinds
            .into_iter()
            .fold(Self::new(false), |classifier, kind| classifier.with_rule(kind, true))
    }

    /// Classifies the listed kinds as `false` and everything else as `true`.
    #[must_use]
    pub fn excluding<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        kinds
            .into_iter()
            .fold(Self::new(true), |classifier, kind| classifier.with_rule(kind, false))
    }
}

impl<T> Classifier<T> for ErrorKindClassifier<T>
where
    T: Clone + Send + Sync + Debug,
{
    fn classify(&self, error: &BatchError) -> T {
        if let Some(value) = self.lookup(error.kind()) {
            return value.clone();
        }
        let root = error.root_cause();
        if root != error {
            if let Some(value) = self.lookup(root.kind()) {
                return value.clone();
            }
        }
        self.default.clone()
    }
}
