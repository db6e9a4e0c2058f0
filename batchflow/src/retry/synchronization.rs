//! Task-local access to the active retry context.

use super::RetryContext;
use std::future::Future;
use std::sync::Arc;

tokio::task_local! {
    static CURRENT_RETRY: Arc<RetryContext>;
}

/// Ambient lookup of the innermost retry operation on the current task.
pub struct RetrySynchronizationManager;

impl RetrySynchronizationManager {
    /// Returns the innermost retry context, if any.
    #[must_use]
    pub fn current() -> Option<Arc<RetryContext>> {
        CURRENT_RETRY.try_with(Arc::clone).ok()
    }

    /// Runs `fut` with `ctx` registered as the current context.
    pub async fn scope<F: Future>(ctx: Arc<RetryContext>, fut: F) -> F::Output {
        CURRENT_RETRY.scope(ctx, fut).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scope_registers_context() {
        let ctx = Arc::new(RetryContext::new(None));
        let seen = RetrySynchronizationManager::scope(Arc::clone(&ctx), async {
            RetrySynchronizationManager::current()
        })
        .await;

        assert!(seen.is_some_and(|seen| Arc::ptr_eq(&seen, &ctx)));
        assert!(RetrySynchronizationManager::current().is_none());
    }
}
