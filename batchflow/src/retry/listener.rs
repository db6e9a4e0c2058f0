//! Observers of retry operations.

use super::RetryContext;
use crate::errors::BatchError;

/// Hooks around a retry operation.
///
/// `open` runs in registration order and may veto the whole operation;
/// `on_error` and `close` run in reverse order.
pub trait RetryListener: Send + Sync {
    /// Called before the first attempt. Returning false aborts the operation.
    fn open(&self, _ctx: &RetryContext) -> bool {
        true
    }

    /// Called after every failed attempt.
    fn on_error(&self, _ctx: &RetryContext, _error: &BatchError) {}

    /// Called once the operation ends. `error` is `None` on success.
    fn close(&self, _ctx: &RetryContext, _error: Option<&BatchError>) {}
}
