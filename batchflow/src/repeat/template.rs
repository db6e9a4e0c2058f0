//! The repeat loop.

use super::{
    CompletionPolicy, DefaultResultCompletionPolicy, RepeatContext, RepeatListener,
    RepeatSynchronizationManager,
};
use crate::core::RepeatStatus;
use crate::errors::BatchResult;
use crate::exception::{DefaultExceptionHandler, ExceptionHandler};
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// One unit of work driven by a [`RepeatTemplate`].
#[async_trait]
pub trait RepeatCallback: Send {
    /// Runs one iteration.
    async fn do_in_iteration(&mut self, ctx: &Arc<RepeatContext>) -> BatchResult<RepeatStatus>;
}

/// Adapter turning an async closure into a [`RepeatCallback`].
pub struct FnRepeatCallback<F, Fut> {
    func: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnRepeatCallback<F, Fut>
where
    F: FnMut(Arc<RepeatContext>) -> Fut + Send,
    Fut: Future<Output = BatchResult<RepeatStatus>> + Send,
{
    /// Wraps a closure.
    pub fn new(func: F) -> Self {
        Self {
            func,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> RepeatCallback for FnRepeatCallback<F, Fut>
where
    F: FnMut(Arc<RepeatContext>) -> Fut + Send,
    Fut: Future<Output = BatchResult<RepeatStatus>> + Send,
{
    async fn do_in_iteration(&mut self, ctx: &Arc<RepeatContext>) -> BatchResult<RepeatStatus> {
        (self.func)(Arc::clone(ctx)).await
    }
}

/// Calls a callback until a completion policy says stop.
///
/// Errors from the callback go through the listeners' `on_error` and then the
/// [`ExceptionHandler`]. A swallowed error lets the loop continue; a rethrown
/// one stops it and is returned after every listener's `close` has run.
#[derive(Clone)]
pub struct RepeatTemplate {
    completion_policy: Arc<dyn CompletionPolicy>,
    exception_handler: Arc<dyn ExceptionHandler>,
    listeners: Vec<Arc<dyn RepeatListener>>,
}

impl Default for RepeatTemplate {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RepeatTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepeatTemplate")
            .field("completion_policy", &self.completion_policy)
            .field("exception_handler", &self.exception_handler)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl RepeatTemplate {
    /// Creates a template that runs until the callback finishes.
    #[must_use]
    pub fn new() -> Self {
        Self {
            completion_policy: Arc::new(DefaultResultCompletionPolicy),
            exception_handler: Arc::new(DefaultExceptionHandler),
            listeners: Vec::new(),
        }
    }

    /// Sets the completion policy.
    #[must_use]
    pub fn with_completion_policy(mut self, policy: Arc<dyn CompletionPolicy>) -> Self {
        self.completion_policy = policy;
        self
    }

    /// Sets the exception handler.
    #[must_use]
    pub fn with_exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.exception_handler = handler;
        self
    }

    /// Adds a listener.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn RepeatListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Runs the loop nested in the current task's innermost loop, if any.
    pub async fn iterate<C>(&self, callback: &mut C) -> BatchResult<RepeatStatus>
    where
        C: RepeatCallback + ?Sized,
    {
        self.iterate_with_parent(RepeatSynchronizationManager::current(), callback)
            .await
    }

    /// Runs the loop under an explicit parent context.
    pub async fn iterate_with_parent<C>(
        &self,
        parent: Option<Arc<RepeatContext>>,
        callback: &mut C,
    ) -> BatchResult<RepeatStatus>
    where
        C: RepeatCallback + ?Sized,
    {
        let ctx = self.completion_policy.start(parent);
        debug!("Starting repeat loop");

        let mut running = !ctx.is_marked_complete();
        for listener in &self.listeners {
            listener.open(&ctx);
            running = running && !ctx.is_marked_complete();
            if !running {
                break;
            }
        }

        let mut result = RepeatStatus::Continuable;
        let mut deferred = Vec::new();

        while running {
            for listener in &self.listeners {
                listener.before(&ctx);
                running = running && !ctx.is_marked_complete();
            }
            if running && self.completion_policy.is_complete(&ctx) {
                debug!("Repeat loop complete according to policy alone");
                running = false;
            }
            if !running {
                break;
            }

            self.completion_policy.update(&ctx);
            debug!(count = ctx.started_count(), "Repeat operation about to start");

            let outcome = RepeatSynchronizationManager::scope(
                Arc::clone(&ctx),
                callback.do_in_iteration(&ctx),
            )
            .await;

            match outcome {
                Ok(status) => {
                    result = status;
                    if status.is_continuable() {
                        for listener in self.listeners.iter().rev() {
                            listener.after(&ctx, status);
                        }
                    }
                }
                Err(err) => {
                    for listener in self.listeners.iter().rev() {
                        listener.on_error(&ctx, &err);
                    }
                    debug!(error = %err, "Handling exception");
                    if let Err(handled) = self.exception_handler.handle_exception(&ctx, err) {
                        deferred.push(handled);
                    }
                }
            }

            if self.completion_policy.is_complete_with(&ctx, result)
                || ctx.is_marked_complete()
                || !deferred.is_empty()
            {
                running = false;
            }
        }

        for listener in self.listeners.iter().rev() {
            listener.close(&ctx);
        }

        match deferred.into_iter().next() {
            Some(err) => {
                debug!(error = %err, "Rethrowing fatal exception");
                Err(err)
            }
            None => Ok(result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BatchError;
    use crate::exception::SimpleLimitExceptionHandler;
    use crate::repeat::SimpleCompletionPolicy;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingListener {
        name: &'static str,
        calls: Arc<Mutex<Vec<String>>>,
        complete_on_open: bool,
    }

    impl RepeatListener for RecordingListener {
        fn open(&self, ctx: &RepeatContext) {
            self.calls.lock().push(format!("{}:open", self.name));
            if self.complete_on_open {
                ctx.set_complete_only();
            }
        }

        fn after(&self, _ctx: &RepeatContext, _result: RepeatStatus) {
            self.calls.lock().push(format!("{}:after", self.name));
        }

        fn on_error(&self, _ctx: &RepeatContext, _error: &BatchError) {
            self.calls.lock().push(format!("{}:error", self.name));
        }

        fn close(&self, _ctx: &RepeatContext) {
            self.calls.lock().push(format!("{}:close", self.name));
        }
    }

    fn counting_callback(
        count: Arc<AtomicUsize>,
        finish_at: usize,
    ) -> impl RepeatCallback {
        FnRepeatCallback::new(move |_ctx| {
            let count = Arc::clone(&count);
            async move {
                let n = count.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(RepeatStatus::continue_if(n < finish_at))
            }
        })
    }

    #[tokio::test]
    async fn test_runs_until_finished() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut callback = counting_callback(Arc::clone(&count), 4);

        let status = RepeatTemplate::new().iterate(&mut callback).await.unwrap();

        assert_eq!(status, RepeatStatus::Finished);
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_completion_policy_bounds_iterations() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut callback = counting_callback(Arc::clone(&count), 100);
        let template = RepeatTemplate::new()
            .with_completion_policy(Arc::new(SimpleCompletionPolicy::new(3)));

        let status = template.iterate(&mut callback).await.unwrap();

        assert_eq!(status, RepeatStatus::Continuable);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_listener_open_can_short_circuit() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let count = Arc::new(AtomicUsize::new(0));
        let mut callback = counting_callback(Arc::clone(&count), 10);
        let template = RepeatTemplate::new().with_listener(Arc::new(RecordingListener {
            name: "a",
            calls: Arc::clone(&calls),
            complete_on_open: true,
        }));

        template.iterate(&mut callback).await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(*calls.lock(), vec!["a:open", "a:close"]);
    }

    #[tokio::test]
    async fn test_listener_ordering_and_after_only_when_continuable() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let count = Arc::new(AtomicUsize::new(0));
        let mut callback = counting_callback(Arc::clone(&count), 2);
        let template = RepeatTemplate::new()
            .with_listener(Arc::new(RecordingListener {
                name: "a",
                calls: Arc::clone(&calls),
                ..Default::default()
            }))
            .with_listener(Arc::new(RecordingListener {
                name: "b",
                calls: Arc::clone(&calls),
                ..Default::default()
            }));

        template.iterate(&mut callback).await.unwrap();

        assert_eq!(
            *calls.lock(),
            vec!["a:open", "b:open", "b:after", "a:after", "b:close", "a:close"]
        );
    }

    #[tokio::test]
    async fn test_error_rethrown_after_close() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut callback =
            FnRepeatCallback::new(|_ctx| async { Err(BatchError::item("fatal", "boom")) });
        let template = RepeatTemplate::new().with_listener(Arc::new(RecordingListener {
            name: "a",
            calls: Arc::clone(&calls),
            ..Default::default()
        }));

        let err = template.iterate(&mut callback).await.unwrap_err();

        assert_eq!(err, BatchError::item("fatal", "boom"));
        assert_eq!(*calls.lock(), vec!["a:open", "a:error", "a:close"]);
    }

    #[tokio::test]
    async fn test_swallowed_errors_continue_loop() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let mut callback = FnRepeatCallback::new(move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= 2 {
                    Err(BatchError::item("transient", "flaky"))
                } else {
                    Ok(RepeatStatus::Finished)
                }
            }
        });
        let template = RepeatTemplate::new()
            .with_exception_handler(Arc::new(SimpleLimitExceptionHandler::new(2)));

        let status = template.iterate(&mut callback).await.unwrap();

        assert_eq!(status, RepeatStatus::Finished);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_nested_loop_sees_outer_context() {
        let inner_template = RepeatTemplate::new()
            .with_completion_policy(Arc::new(SimpleCompletionPolicy::new(2)));
        let outer_count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&outer_count);

        let mut outer = FnRepeatCallback::new(move |outer_ctx: Arc<RepeatContext>| {
            let inner_template = inner_template.clone();
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut inner = FnRepeatCallback::new(|ctx: Arc<RepeatContext>| async move {
                    assert!(ctx.parent().is_some());
                    Ok(RepeatStatus::Continuable)
                });
                inner_template.iterate(&mut inner).await?;
                outer_ctx.set_complete_only();
                Ok::<_, BatchError>(RepeatStatus::Continuable)
            }
        });

        RepeatTemplate::new().iterate(&mut outer).await.unwrap();
        assert_eq!(outer_count.load(Ordering::SeqCst), 1);
    }
}
