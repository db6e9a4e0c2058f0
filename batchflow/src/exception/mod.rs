//! Exception handlers deciding whether a repeat loop survives an error.
//!
//! A handler either swallows an error (the loop goes on) or returns it (the
//! loop stops and the error propagates once listeners have closed).

use crate::classify::{Classifier, ErrorKindClassifier};
use crate::errors::{BatchError, BatchResult};
use crate::repeat::RepeatContext;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Decides what happens to an error raised inside a repeat loop.
pub trait ExceptionHandler: Send + Sync + Debug {
    /// Returns `Ok(())` to swallow the error or `Err` to rethrow.
    fn handle_exception(&self, ctx: &RepeatContext, error: BatchError) -> BatchResult<()>;
}

/// Always rethrows.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultExceptionHandler;

impl ExceptionHandler for DefaultExceptionHandler {
    fn handle_exception(&self, _ctx: &RepeatContext, error: BatchError) -> BatchResult<()> {
        Err(error)
    }
}

/// Disposition of an error under [`LogOrRethrowExceptionHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionLevel {
    /// Propagate the error.
    #[default]
    Rethrow,
    /// Log at debug level and continue.
    Debug,
    /// Log at warn level and continue.
    Warn,
    /// Log at error level and continue.
    Error,
}

/// Logs classified errors and rethrows the rest.
#[derive(Debug, Clone)]
pub struct LogOrRethrowExceptionHandler {
    classifier: Arc<dyn Classifier<ExceptionLevel>>,
}

impl Default for LogOrRethrowExceptionHandler {
    fn default() -> Self {
        Self::new(Arc::new(ErrorKindClassifier::new(ExceptionLevel::Rethrow)))
    }
}

impl LogOrRethrowExceptionHandler {
    /// Creates a handler with the given classifier.
    #[must_use]
    pub fn new(classifier: Arc<dyn Classifier<ExceptionLevel>>) -> Self {
        Self { classifier }
    }
}

impl ExceptionHandler for LogOrRethrowExceptionHandler {
    fn handle_exception(&self, _ctx: &RepeatContext, err: BatchError) -> BatchResult<()> {
        match self.classifier.classify(&err) {
            ExceptionLevel::Rethrow => return Err(err),
            ExceptionLevel::Debug => debug!(error = %err, "Exception swallowed"),
            ExceptionLevel::Warn => warn!(error = %err, "Exception swallowed"),
            ExceptionLevel::Error => error!(error = %err, "Exception swallowed"),
        }
        Ok(())
    }
}

/// Rethrows once the count of errors with the same classification exceeds a threshold.
///
/// Counters live in the repeat context's attributes, so they are scoped to
/// that context's lifetime. With `use_parent` the counter lives on the
/// immediate parent context and is shared by sibling loops.
#[derive(Debug, Clone)]
pub struct RethrowOnThresholdExceptionHandler {
    classifier: Arc<dyn Classifier<String>>,
    thresholds: HashMap<String, u64>,
    use_parent: bool,
}

impl Default for RethrowOnThresholdExceptionHandler {
    fn default() -> Self {
        Self::new(Arc::new(ErrorKindClassifier::new(
            Self::DEFAULT_KEY.to_string(),
        )))
    }
}

impl RethrowOnThresholdExceptionHandler {
    /// Classification used when the classifier has no rule.
    pub const DEFAULT_KEY: &'static str = "default";

    const COUNTER_PREFIX: &'static str = "RethrowOnThresholdExceptionHandler.count.";

    /// Creates a handler with the given classifier and no thresholds.
    #[must_use]
    pub fn new(classifier: Arc<dyn Classifier<String>>) -> Self {
        Self {
            classifier,
            thresholds: HashMap::new(),
            use_parent: false,
        }
    }

    /// Sets the threshold for a classification key.
    #[must_use]
    pub fn with_threshold(mut self, key: impl Into<String>, threshold: u64) -> Self {
        self.thresholds.insert(key.into(), threshold);
        self
    }

    /// Shares counters through the parent context.
    #[must_use]
    pub fn with_use_parent(mut self, use_parent: bool) -> Self {
        self.use_parent = use_parent;
        self
    }

    /// Current count for a key as seen from `ctx`.
    #[must_use]
    pub fn count(&self, ctx: &RepeatContext, key: &str) -> u64 {
        self.counter_context(ctx)
            .attribute(&format!("{}{key}", Self::COUNTER_PREFIX))
            .and_then(|value| value.as_u64())
            .unwrap_or(0)
    }

    fn counter_context<'a>(&self, ctx: &'a RepeatContext) -> &'a RepeatContext {
        if self.use_parent {
            if let Some(parent) = ctx.parent() {
                return parent;
            }
        }
        ctx
    }
}

impl ExceptionHandler for RethrowOnThresholdExceptionHandler {
    fn handle_exception(&self, ctx: &RepeatContext, error: BatchError) -> BatchResult<()> {
        let key = self.classifier.classify(&error);
        let count = self
            .counter_context(ctx)
            .increment_attribute(&format!("{}{key}", Self::COUNTER_PREFIX), 1);
        let threshold = self.thresholds.get(&key).copied().unwrap_or(0);

        if count > threshold {
            debug!(%key, count, threshold, "Exception threshold exceeded, rethrowing");
            return Err(error);
        }

        debug!(%key, count, threshold, error = %error, "Exception below threshold, continuing");
        Ok(())
    }
}

/// Tolerates up to `limit` errors of the given kinds across sibling loops.
///
/// Fatal kinds are always rethrown; kinds outside the tolerated set are
/// rethrown too. An empty tolerated set tolerates every non-fatal kind.
#[derive(Debug, Clone)]
pub struct SimpleLimitExceptionHandler {
    fatal: ErrorKindClassifier<bool>,
    delegate: RethrowOnThresholdExceptionHandler,
}

impl SimpleLimitExceptionHandler {
    const LIMITED: &'static str = "limited";

    /// Creates a handler tolerating `limit` errors of any non-fatal kind.
    #[must_use]
    pub fn new(limit: u64) -> Self {
        Self::with_kinds(limit, Vec::<String>::new(), Vec::<String>::new())
    }

    /// Creates a handler for specific tolerated and fatal kinds.
    #[must_use]
    pub fn with_kinds<I, F, S>(limit: u64, kinds: I, fatal_kinds: F) -> Self
    where
        I: IntoIterator<Item = S>,
        F: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let kinds: Vec<String> = kinds.into_iter().map(Into::into).collect();
        let classifier = if kinds.is_empty() {
            ErrorKindClassifier::new(Self::LIMITED.to_string())
        } else {
            kinds.into_iter().fold(
                ErrorKindClassifier::new(RethrowOnThresholdExceptionHandler::DEFAULT_KEY.to_string()),
                |classifier, kind| classifier.with_rule(kind, Self::LIMITED.to_string()),
            )
        };

        Self {
            fatal: ErrorKindClassifier::including(fatal_kinds),
            delegate: RethrowOnThresholdExceptionHandler::new(Arc::new(classifier))
                .with_threshold(Self::LIMITED, limit)
                .with_use_parent(true),
        }
    }
}

impl ExceptionHandler for SimpleLimitExceptionHandler {
    fn handle_exception(&self, ctx: &RepeatContext, error: BatchError) -> BatchResult<()> {
        if self.fatal.classify(&error) {
            return Err(error);
        }
        self.delegate.handle_exception(ctx, error)
    }
}
