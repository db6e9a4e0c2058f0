//! Scoped state of one retry operation.

use super::BackOffContext;
use crate::errors::BatchError;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// State of one retry operation.
///
/// For stateless retry the context lives for one `execute` call. For stateful
/// retry it is parked in a [`RetryContextCache`](super::RetryContextCache)
/// under the item's key between transactional attempts, so counts and backoff
/// continue where the previous attempt left off.
///
/// Two counters are kept. [`retry_count`](Self::retry_count) counts failures
/// and is what retry policies compare against their limit.
/// [`attempt_count`](Self::attempt_count) counts invocations of the callback,
/// including the one in progress. A unit of work that fails twice and then
/// succeeds sees `attempt_count() == 3` and `retry_count() == 2` on its
/// successful call.
#[derive(Debug)]
pub struct RetryContext {
    parent: Option<Arc<RetryContext>>,
    retry_count: AtomicUsize,
    attempt_count: AtomicUsize,
    last_error: RwLock<Option<BatchError>>,
    exhausted_only: AtomicBool,
    recovered: AtomicBool,
    attributes: RwLock<HashMap<String, Value>>,
    backoff: Mutex<BackOffContext>,
    children: RwLock<Vec<Arc<RetryContext>>>,
    started_at: Instant,
}

impl RetryContext {
    /// Creates a context under an optional parent.
    #[must_use]
    pub fn new(parent: Option<Arc<RetryContext>>) -> Self {
        Self {
            parent,
            retry_count: AtomicUsize::new(0),
            attempt_count: AtomicUsize::new(0),
            last_error: RwLock::new(None),
            exhausted_only: AtomicBool::new(false),
            recovered: AtomicBool::new(false),
            attributes: RwLock::new(HashMap::new()),
            backoff: Mutex::new(BackOffContext::default()),
            children: RwLock::new(Vec::new()),
            started_at: Instant::now(),
        }
    }

    /// Returns the enclosing retry operation's context.
    #[must_use]
    pub fn parent(&self) -> Option<&Arc<RetryContext>> {
        self.parent.as_ref()
    }

    /// Number of failures registered so far.
    ///
    /// During the first invocation this is 0.
    #[must_use]
    pub fn retry_count(&self) -> usize {
        self.retry_count.load(Ordering::SeqCst)
    }

    /// Number of callback invocations, including the one in progress.
    ///
    /// During the first invocation this is 1. Outside a callback it equals
    /// the number of invocations made.
    #[must_use]
    pub fn attempt_count(&self) -> usize {
        self.attempt_count.load(Ordering::SeqCst)
    }

    pub(crate) fn start_attempt(&self) {
        self.attempt_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Records a failure.
    pub fn register_error(&self, error: BatchError) {
        self.retry_count.fetch_add(1, Ordering::SeqCst);
        *self.last_error.write() = Some(error);
    }

    /// The most recent failure.
    #[must_use]
    pub fn last_error(&self) -> Option<BatchError> {
        self.last_error.read().clone()
    }

    /// Stops retrying after the current attempt, regardless of policy.
    pub fn set_exhausted_only(&self) {
        self.exhausted_only.store(true, Ordering::SeqCst);
    }

    /// Returns true if retry was stopped by [`set_exhausted_only`](Self::set_exhausted_only).
    #[must_use]
    pub fn is_exhausted_only(&self) -> bool {
        self.exhausted_only.load(Ordering::SeqCst)
    }

    pub(crate) fn set_recovered(&self) {
        self.recovered.store(true, Ordering::SeqCst);
    }

    /// Returns true once a recovery callback has produced the result.
    #[must_use]
    pub fn is_recovered(&self) -> bool {
        self.recovered.load(Ordering::SeqCst)
    }

    /// Returns an attribute.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.attributes.read().get(key).cloned()
    }

    /// Sets an attribute.
    pub fn set_attribute(&self, key: impl Into<String>, value: Value) {
        self.attributes.write().insert(key.into(), value);
    }

    /// Removes an attribute.
    pub fn remove_attribute(&self, key: &str) -> Option<Value> {
        self.attributes.write().remove(key)
    }

    /// Time since the context was opened.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub(crate) fn with_backoff<R>(&self, f: impl FnOnce(&mut BackOffContext) -> R) -> R {
        f(&mut self.backoff.lock())
    }

    /// Returns the child contexts of a composite policy.
    #[must_use]
    pub fn children(&self) -> Vec<Arc<RetryContext>> {
        self.children.read().clone()
    }

    /// Replaces the child contexts.
    pub fn set_children(&self, children: Vec<Arc<RetryContext>>) {
        *self.children.write() = children;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_error() {
        let ctx = RetryContext::new(None);
        ctx.start_attempt();
        ctx.register_error(BatchError::item("transient", "once"));

        assert_eq!(ctx.retry_count(), 1);
        assert_eq!(ctx.attempt_count(), 1);
        assert_eq!(ctx.last_error(), Some(BatchError::item("transient", "once")));
    }

    #[test]
    fn test_attempts_run_one_ahead_of_failures() {
        let ctx = RetryContext::new(None);
        for n in 1..=2 {
            ctx.start_attempt();
            ctx.register_error(BatchError::item("transient", format!("failure {n}")));
        }
        ctx.start_attempt();

        assert_eq!(ctx.attempt_count(), 3);
        assert_eq!(ctx.retry_count(), 2);
    }

    #[test]
    fn test_flags() {
        let ctx = RetryContext::new(None);
        assert!(!ctx.is_exhausted_only());
        ctx.set_exhausted_only();
        assert!(ctx.is_exhausted_only());
        ctx.set_recovered();
        assert!(ctx.is_recovered());
    }
}
