//! Completion policies deciding when a repeat loop stops.

use super::RepeatContext;
use crate::core::RepeatStatus;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Decides when a repeat loop is complete.
///
/// The template calls [`start`](Self::start) once per `iterate`, receiving a
/// fresh child context so state never leaks between calls, then
/// [`update`](Self::update) before every invocation of the callback.
pub trait CompletionPolicy: Send + Sync + Debug {
    /// Creates the context for a new loop.
    fn start(&self, parent: Option<Arc<RepeatContext>>) -> Arc<RepeatContext> {
        Arc::new(RepeatContext::new(parent))
    }

    /// Checks completion from the context alone, before an invocation.
    fn is_complete(&self, ctx: &RepeatContext) -> bool;

    /// Checks completion after an invocation returned `result`.
    fn is_complete_with(&self, ctx: &RepeatContext, result: RepeatStatus) -> bool {
        !result.is_continuable() || self.is_complete(ctx)
    }

    /// Advances the policy's counters for a new invocation.
    fn update(&self, ctx: &RepeatContext) {
        ctx.increment();
    }
}

/// Completes only when the callback returns [`RepeatStatus::Finished`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResultCompletionPolicy;

impl CompletionPolicy for DefaultResultCompletionPolicy {
    fn is_complete(&self, _ctx: &RepeatContext) -> bool {
        false
    }
}

/// Completes after a fixed number of invocations, or on a finished result.
#[derive(Debug, Clone, Copy)]
pub struct SimpleCompletionPolicy {
    chunk_size: usize,
}

impl SimpleCompletionPolicy {
    /// Default number of invocations.
    pub const DEFAULT_CHUNK_SIZE: usize = 5;

    /// Creates a policy for `chunk_size` invocations.
    #[must_use]
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }

    /// Returns the configured size.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

impl Default for SimpleCompletionPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHUNK_SIZE)
    }
}

impl CompletionPolicy for SimpleCompletionPolicy {
    fn is_complete(&self, ctx: &RepeatContext) -> bool {
        ctx.started_count() >= self.chunk_size
    }
}

/// Completes once a wall-clock budget has elapsed since the loop started.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutTerminationPolicy {
    timeout: Duration,
}

impl TimeoutTerminationPolicy {
    /// Creates a policy with the given budget.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl CompletionPolicy for TimeoutTerminationPolicy {
    fn is_complete(&self, ctx: &RepeatContext) -> bool {
        ctx.elapsed() >= self.timeout
    }
}

/// Completes as soon as any of its policies completes.
///
/// Each child policy runs against its own child context.
#[derive(Debug, Clone, Default)]
pub struct CompositeCompletionPolicy {
    policies: Vec<Arc<dyn CompletionPolicy>>,
}

impl CompositeCompletionPolicy {
    /// Creates a composite of the given policies.
    #[must_use]
    pub fn new(policies: Vec<Arc<dyn CompletionPolicy>>) -> Self {
        Self { policies }
    }

    /// Adds a policy.
    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn CompletionPolicy>) -> Self {
        self.policies.push(policy);
        self
    }

    fn pairs<'a>(
        &'a self,
        ctx: &RepeatContext,
    ) -> impl Iterator<Item = (&'a Arc<dyn CompletionPolicy>, Arc<RepeatContext>)> {
        self.policies.iter().zip(ctx.children())
    }
}

impl CompletionPolicy for CompositeCompletionPolicy {
    fn start(&self, parent: Option<Arc<RepeatContext>>) -> Arc<RepeatContext> {
        let ctx = Arc::new(RepeatContext::new(parent.clone()));
        let children = self
            .policies
            .iter()
            .map(|policy| policy.start(parent.clone()))
            .collect();
        ctx.set_children(children);
        ctx
    }

    fn is_complete(&self, ctx: &RepeatContext) -> bool {
        self.pairs(ctx).any(|(policy, child)| policy.is_complete(&child))
    }

    fn is_complete_with(&self, ctx: &RepeatContext, result: RepeatStatus) -> bool {
        self.pairs(ctx)
            .any(|(policy, child)| policy.is_complete_with(&child, result))
    }

    fn update(&self, ctx: &RepeatContext) {
        ctx.increment();
        for (policy, child) in self.pairs(ctx) {
            policy.update(&child);
        }
    }
}
