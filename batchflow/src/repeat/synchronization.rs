//! Task-local access to the active repeat context.

use super::RepeatContext;
use std::future::Future;
use std::sync::Arc;

tokio::task_local! {
    static CURRENT_REPEAT: Arc<RepeatContext>;
}

/// Ambient lookup of the repeat context of the innermost running loop.
///
/// Explicit context passing is preferred; this exists for code that runs
/// inside a callback but was not handed the context.
pub struct RepeatSynchronizationManager;

impl RepeatSynchronizationManager {
    /// Returns the context of the innermost loop on this task, if any.
    #[must_use]
    pub fn current() -> Option<Arc<RepeatContext>> {
        CURRENT_REPEAT.try_with(Arc::clone).ok()
    }

    /// Runs `fut` with `ctx` registered as the current context.
    pub async fn scope<F: Future>(ctx: Arc<RepeatContext>, fut: F) -> F::Output {
        CURRENT_REPEAT.scope(ctx, fut).await
    }

    /// Marks the current loop complete. Returns false outside a loop.
    pub fn set_complete_only() -> bool {
        Self::current().map_or(false, |ctx| {
            ctx.set_complete_only();
            true
        })
    }

    /// Marks the current loop and every enclosing loop complete.
    pub fn set_ancestors_complete_only() -> bool {
        let mut next = Self::current();
        let found = next.is_some();
        while let Some(ctx) = next {
            ctx.set_complete_only();
            next = ctx.parent().cloned();
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_current_is_scoped() {
        assert!(RepeatSynchronizationManager::current().is_none());

        let ctx = Arc::new(RepeatContext::new(None));
        let inner = RepeatSynchronizationManager::scope(Arc::clone(&ctx), async {
            RepeatSynchronizationManager::set_complete_only();
            RepeatSynchronizationManager::current()
        })
        .await;

        assert!(inner.is_some());
        assert!(ctx.is_complete_only());
        assert!(!RepeatSynchronizationManager::set_complete_only());
    }

    #[tokio::test]
    async fn test_set_ancestors_complete_only() {
        let parent = Arc::new(RepeatContext::new(None));
        let child = Arc::new(RepeatContext::new(Some(Arc::clone(&parent))));

        RepeatSynchronizationManager::scope(child, async {
            assert!(RepeatSynchronizationManager::set_ancestors_complete_only());
        })
        .await;

        assert!(parent.is_complete_only());
    }
}
