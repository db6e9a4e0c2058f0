//! Retry policies.

use super::RetryContext;
use crate::classify::{Classifier, ErrorKindClassifier};
use crate::errors::BatchError;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Decides whether another attempt may be made.
pub trait RetryPolicy: Send + Sync + Debug {
    /// Returns true if the operation may be attempted (again).
    fn can_retry(&self, ctx: &RetryContext) -> bool;

    /// Creates the context for a new retry operation.
    fn open(&self, parent: Option<Arc<RetryContext>>) -> Arc<RetryContext> {
        Arc::new(RetryContext::new(parent))
    }

    /// Releases resources when the operation ends.
    fn close(&self, _ctx: &RetryContext) {}

    /// Records a failed attempt.
    fn register_error(&self, ctx: &RetryContext, error: &BatchError) {
        ctx.register_error(error.clone());
    }
}

/// Retries retryable errors up to a fixed number of attempts.
///
/// `max_attempts` includes the first attempt.
#[derive(Debug, Clone)]
pub struct SimpleRetryPolicy {
    max_attempts: usize,
    retryable: Arc<dyn Classifier<bool>>,
}

impl Default for SimpleRetryPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_ATTEMPTS)
    }
}

impl SimpleRetryPolicy {
    /// Default number of attempts.
    pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

    /// Creates a policy that retries every error kind.
    #[must_use]
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            retryable: Arc::new(ErrorKindClassifier::new(true)),
        }
    }

    /// Creates a policy that retries only the given kinds.
    #[must_use]
    pub fn for_kinds<I, S>(max_attempts: usize, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(max_attempts).with_classifier(Arc::new(ErrorKindClassifier::including(kinds)))
    }

    /// Sets the retryable classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier<bool>>) -> Self {
        self.retryable = classifier;
        self
    }

    /// Returns the attempt limit.
    #[must_use]
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }
}

impl RetryPolicy for SimpleRetryPolicy {
    fn can_retry(&self, ctx: &RetryContext) -> bool {
        let retryable = ctx
            .last_error()
            .map_or(true, |err| self.retryable.classify(&err));
        retryable && ctx.retry_count() < self.max_attempts
    }
}

/// Allows the first attempt only.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRetryPolicy;

impl RetryPolicy for NeverRetryPolicy {
    fn can_retry(&self, ctx: &RetryContext) -> bool {
        ctx.retry_count() == 0
    }
}

/// Retries forever. Mostly useful for tests and composites.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRetryPolicy;

impl RetryPolicy for AlwaysRetryPolicy {
    fn can_retry(&self, _ctx: &RetryContext) -> bool {
        true
    }
}

/// Retries until a time budget measured from the first attempt is spent.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutRetryPolicy {
    timeout: Duration,
}

impl TimeoutRetryPolicy {
    /// Creates a policy with the given budget.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl RetryPolicy for TimeoutRetryPolicy {
    fn can_retry(&self, ctx: &RetryContext) -> bool {
        ctx.elapsed() <= self.timeout
    }
}

const ACTIVE_DELEGATE: &str = "retry.policy.delegate";

/// Delegates to a different policy depending on the kind of the last error.
///
/// Every delegate gets its own child context, so counts for one kind of
/// error do not use up the attempts of another.
#[derive(Debug, Clone)]
pub struct ExceptionClassifierRetryPolicy {
    policies: Vec<Arc<dyn RetryPolicy>>,
    classifier: ErrorKindClassifier<usize>,
}

impl ExceptionClassifierRetryPolicy {
    /// Creates a policy with a fallback for unclassified errors.
    #[must_use]
    pub fn new(default_policy: Arc<dyn RetryPolicy>) -> Self {
        Self {
            policies: vec![default_policy],
            classifier: ErrorKindClassifier::new(0),
        }
    }

    /// Routes errors of `kind` (and its sub-kinds) to `policy`.
    #[must_use]
    pub fn with_policy(mut self, kind: impl Into<String>, policy: Arc<dyn RetryPolicy>) -> Self {
        self.policies.push(policy);
        self.classifier = self.classifier.with_rule(kind, self.policies.len() - 1);
        self
    }

    fn active(&self, ctx: &RetryContext) -> Option<usize> {
        ctx.attribute(ACTIVE_DELEGATE)
            .and_then(|value| value.as_u64())
            .and_then(|idx| usize::try_from(idx).ok())
    }
}

impl RetryPolicy for ExceptionClassifierRetryPolicy {
    fn can_retry(&self, ctx: &RetryContext) -> bool {
        let Some(idx) = self.active(ctx) else {
            return true;
        };
        let children = ctx.children();
        match (self.policies.get(idx), children.get(idx)) {
            (Some(policy), Some(child)) => policy.can_retry(child),
            _ => false,
        }
    }

    fn open(&self, parent: Option<Arc<RetryContext>>) -> Arc<RetryContext> {
        let ctx = Arc::new(RetryContext::new(parent.clone()));
        ctx.set_children(
            self.policies
                .iter()
                .map(|policy| policy.open(parent.clone()))
                .collect(),
        );
        ctx
    }

    fn close(&self, ctx: &RetryContext) {
        for (policy, child) in self.policies.iter().zip(ctx.children()) {
            policy.close(&child);
        }
    }

    fn register_error(&self, ctx: &RetryContext, error: &BatchError) {
        let idx = self.classifier.classify(error);
        ctx.set_attribute(ACTIVE_DELEGATE, serde_json::Value::from(idx));
        if let (Some(policy), Some(child)) = (self.policies.get(idx), ctx.children().get(idx)) {
            policy.register_error(child, error);
        }
        ctx.register_error(error.clone());
    }
}

/// Combines several policies.
///
/// An optimistic composite retries if any policy allows it; a pessimistic one
/// (the default) only if all of them do.
#[derive(Debug, Clone, Default)]
pub struct CompositeRetryPolicy {
    policies: Vec<Arc<dyn RetryPolicy>>,
    optimistic: bool,
}

impl CompositeRetryPolicy {
    /// Creates a pessimistic composite.
    #[must_use]
    pub fn new(policies: Vec<Arc<dyn RetryPolicy>>) -> Self {
        Self {
            policies,
            optimistic: false,
        }
    }

    /// Switches between optimistic and pessimistic combination.
    #[must_use]
    pub fn with_optimistic(mut self, optimistic: bool) -> Self {
        self.optimistic = optimistic;
        self
    }
}

impl RetryPolicy for CompositeRetryPolicy {
    fn can_retry(&self, ctx: &RetryContext) -> bool {
        let mut pairs = self.policies.iter().zip(ctx.children());
        if self.optimistic {
            pairs.any(|(policy, child)| policy.can_retry(&child))
        } else {
            pairs.all(|(policy, child)| policy.can_retry(&child))
        }
    }

    fn open(&self, parent: Option<Arc<RetryContext>>) -> Arc<RetryContext> {
        let ctx = Arc::new(RetryContext::new(parent.clone()));
        ctx.set_children(
            self.policies
                .iter()
                .map(|policy| policy.open(parent.clone()))
                .collect(),
        );
        ctx
    }

    fn close(&self, ctx: &RetryContext) {
        for (policy, child) in self.policies.iter().zip(ctx.children()) {
            policy.close(&child);
        }
    }

    fn register_error(&self, ctx: &RetryContext, error: &BatchError) {
        for (policy, child) in self.policies.iter().zip(ctx.children()) {
            policy.register_error(&child, error);
        }
        ctx.register_error(error.clone());
    }
}
