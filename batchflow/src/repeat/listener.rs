//! Observers of repeat loops.

use super::RepeatContext;
use crate::core::RepeatStatus;
use crate::errors::BatchError;

/// Hooks around a repeat loop.
///
/// `open` and `before` run in registration order; `after`, `on_error` and
/// `close` run in reverse order. Setting `complete_only` on the context from
/// `open` or `before` stops the loop before the next invocation.
pub trait RepeatListener: Send + Sync {
    /// Called once when the loop starts.
    fn open(&self, _ctx: &RepeatContext) {}

    /// Called before each invocation.
    fn before(&self, _ctx: &RepeatContext) {}

    /// Called after each invocation that returned a continuable status.
    fn after(&self, _ctx: &RepeatContext, _result: RepeatStatus) {}

    /// Called when an invocation fails, before the exception handler.
    fn on_error(&self, _ctx: &RepeatContext, _error: &BatchError) {}

    /// Called once when the loop ends, even on failure.
    fn close(&self, _ctx: &RepeatContext) {}
}
