//! Scoped state of one repeat invocation.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// State of one `iterate` call.
///
/// A context lives only as long as the call that created it. Attributes set on
/// it do not outlive the call. Nested loops link to the enclosing loop's
/// context through [`RepeatContext::parent`], and marking a parent complete
/// also completes every nested loop.
#[derive(Debug)]
pub struct RepeatContext {
    parent: Option<Arc<RepeatContext>>,
    started_count: AtomicUsize,
    complete_only: AtomicBool,
    terminate_only: AtomicBool,
    attributes: RwLock<HashMap<String, Value>>,
    children: RwLock<Vec<Arc<RepeatContext>>>,
    started_at: Instant,
}

impl RepeatContext {
    /// Creates a context under an optional parent.
    #[must_use]
    pub fn new(parent: Option<Arc<RepeatContext>>) -> Self {
        Self {
            parent,
            started_count: AtomicUsize::new(0),
            complete_only: AtomicBool::new(false),
            terminate_only: AtomicBool::new(false),
            attributes: RwLock::new(HashMap::new()),
            children: RwLock::new(Vec::new()),
            started_at: Instant::now(),
        }
    }

    /// Returns the enclosing loop's context.
    #[must_use]
    pub fn parent(&self) -> Option<&Arc<RepeatContext>> {
        self.parent.as_ref()
    }

    /// Number of iterations started so far.
    #[must_use]
    pub fn started_count(&self) -> usize {
        self.started_count.load(Ordering::SeqCst)
    }

    /// Records the start of an iteration.
    pub fn increment(&self) {
        self.started_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Asks the loop to finish normally after the current iteration.
    pub fn set_complete_only(&self) {
        self.complete_only.store(true, Ordering::SeqCst);
    }

    /// Returns true if this context was marked complete.
    #[must_use]
    pub fn is_complete_only(&self) -> bool {
        self.complete_only.load(Ordering::SeqCst)
    }

    /// Asks the loop to stop abnormally. Also marks it complete.
    pub fn set_terminate_only(&self) {
        self.terminate_only.store(true, Ordering::SeqCst);
        self.set_complete_only();
    }

    /// Returns true if this context was asked to stop abnormally.
    #[must_use]
    pub fn is_terminate_only(&self) -> bool {
        self.terminate_only.load(Ordering::SeqCst)
    }

    /// Returns true if this context or any ancestor was marked complete.
    #[must_use]
    pub fn is_marked_complete(&self) -> bool {
        self.is_complete_only()
            || self
                .parent
                .as_ref()
                .is_some_and(|parent| parent.is_marked_complete())
    }

    /// Time since the context was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
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

    /// Checks if an attribute exists.
    #[must_use]
    pub fn has_attribute(&self, key: &str) -> bool {
        self.attributes.read().contains_key(key)
    }

    /// Removes an attribute.
    pub fn remove_attribute(&self, key: &str) -> Option<Value> {
        self.attributes.write().remove(key)
    }

    /// Atomically adds `delta` to an integer attribute and returns the new value.
    pub fn increment_attribute(&self, key: &str, delta: u64) -> u64 {
        let mut attributes = self.attributes.write();
        let current = attributes.get(key).and_then(Value::as_u64).unwrap_or(0);
        let next = current + delta;
        attributes.insert(key.to_string(), Value::from(next));
        next
    }

    /// Returns the child contexts of a composite policy.
    #[must_use]
    pub fn children(&self) -> Vec<Arc<RepeatContext>> {
        self.children.read().clone()
    }

    /// Replaces the child contexts.
    pub fn set_children(&self, children: Vec<Arc<RepeatContext>>) {
        *self.children.write() = children;
    }
}
