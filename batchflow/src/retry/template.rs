//! The retry loop.

use super::{
    BackOffPolicy, MapRetryContextCache, NoBackOffPolicy, RetryContext, RetryContextCache,
    RetryListener, RetryPolicy, RetryState, RetrySynchronizationManager, SimpleRetryPolicy,
};
use crate::errors::{BatchError, BatchResult};
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// The unit of work to retry.
#[async_trait]
pub trait RetryCallback<T>: Send {
    /// Runs one attempt.
    async fn do_with_retry(&mut self, ctx: &Arc<RetryContext>) -> BatchResult<T>;
}

/// Produces a result once retries are exhausted.
#[async_trait]
pub trait RecoveryCallback<T>: Send {
    /// Runs the recovery path.
    async fn recover(&mut self, ctx: &Arc<RetryContext>) -> BatchResult<T>;
}

/// Adapter turning an async closure into a [`RetryCallback`].
pub struct FnRetryCallback<F, Fut> {
    func: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnRetryCallback<F, Fut>
where
    F: FnMut(Arc<RetryContext>) -> Fut + Send,
    Fut: Future + Send,
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
impl<T, F, Fut> RetryCallback<T> for FnRetryCallback<F, Fut>
where
    T: Send,
    F: FnMut(Arc<RetryContext>) -> Fut + Send,
    Fut: Future<Output = BatchResult<T>> + Send,
{
    async fn do_with_retry(&mut self, ctx: &Arc<RetryContext>) -> BatchResult<T> {
        (self.func)(Arc::clone(ctx)).await
    }
}

/// Adapter turning an async closure into a [`RecoveryCallback`].
pub struct FnRecoveryCallback<F, Fut> {
    func: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnRecoveryCallback<F, Fut>
where
    F: FnMut(Arc<RetryContext>) -> Fut + Send,
    Fut: Future + Send,
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
impl<T, F, Fut> RecoveryCallback<T> for FnRecoveryCallback<F, Fut>
where
    T: Send,
    F: FnMut(Arc<RetryContext>) -> Fut + Send,
    Fut: Future<Output = BatchResult<T>> + Send,
{
    async fn recover(&mut self, ctx: &Arc<RetryContext>) -> BatchResult<T> {
        (self.func)(Arc::clone(ctx)).await
    }
}

/// Re-runs a callback until it succeeds or the retry policy gives up.
///
/// Stateless operations loop in place. Stateful operations (with a
/// [`RetryState`]) park their context in the cache under the state's key and
/// rethrow, so the caller can roll back and re-drive the same key later; the
/// next call with that key continues the same retry count.
#[derive(Clone)]
pub struct RetryTemplate {
    retry_policy: Arc<dyn RetryPolicy>,
    backoff_policy: Arc<dyn BackOffPolicy>,
    listeners: Vec<Arc<dyn RetryListener>>,
    cache: Arc<dyn RetryContextCache>,
}

impl Default for RetryTemplate {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RetryTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryTemplate")
            .field("retry_policy", &self.retry_policy)
            .field("backoff_policy", &self.backoff_policy)
            .field("listeners", &self.listeners.len())
            .field("cache", &self.cache)
            .finish()
    }
}

impl RetryTemplate {
    /// Creates a template with three attempts and no backoff.
    #[must_use]
    pub fn new() -> Self {
        Self {
            retry_policy: Arc::new(SimpleRetryPolicy::default()),
            backoff_policy: Arc::new(NoBackOffPolicy),
            listeners: Vec::new(),
            cache: Arc::new(MapRetryContextCache::default()),
        }
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Sets the backoff policy.
    #[must_use]
    pub fn with_backoff_policy(mut self, policy: Arc<dyn BackOffPolicy>) -> Self {
        self.backoff_policy = policy;
        self
    }

    /// Adds a listener.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn RetryListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Sets the stateful context cache.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn RetryContextCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Returns the retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> &Arc<dyn RetryPolicy> {
        &self.retry_policy
    }

    /// Returns the stateful context cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<dyn RetryContextCache> {
        &self.cache
    }

    /// Retries in place; on exhaustion the last error is returned.
    pub async fn execute<T, C>(&self, callback: &mut C) -> BatchResult<T>
    where
        T: Send,
        C: RetryCallback<T> + ?Sized,
    {
        self.do_execute(callback, None, None).await
    }

    /// Retries in place; on exhaustion the recovery callback provides the result.
    pub async fn execute_with_recovery<T, C>(
        &self,
        callback: &mut C,
        recovery: &mut (dyn RecoveryCallback<T> + '_),
    ) -> BatchResult<T>
    where
        T: Send,
        C: RetryCallback<T> + ?Sized,
    {
        self.do_execute(callback, Some(recovery), None).await
    }

    /// Retries across calls correlated by `state`.
    ///
    /// Without a recovery callback, exhaustion yields
    /// [`BatchError::RetryExhausted`].
    pub async fn execute_stateful<T, C>(
        &self,
        callback: &mut C,
        recovery: Option<&mut (dyn RecoveryCallback<T> + '_)>,
        state: &RetryState,
    ) -> BatchResult<T>
    where
        T: Send,
        C: RetryCallback<T> + ?Sized,
    {
        self.do_execute(callback, recovery, Some(state)).await
    }

    async fn do_execute<T, C>(
        &self,
        callback: &mut C,
        recovery: Option<&mut (dyn RecoveryCallback<T> + '_)>,
        state: Option<&RetryState>,
    ) -> BatchResult<T>
    where
        T: Send,
        C: RetryCallback<T> + ?Sized,
    {
        let ctx = self.open(state);
        let mut last_error = None;

        let outcome = self
            .run(&ctx, callback, recovery, state, &mut last_error)
            .await;

        self.close(&ctx, state, last_error.is_none());
        for listener in self.listeners.iter().rev() {
            listener.close(&ctx, last_error.as_ref());
        }

        outcome
    }

    async fn run<T, C>(
        &self,
        ctx: &Arc<RetryContext>,
        callback: &mut C,
        recovery: Option<&mut (dyn RecoveryCallback<T> + '_)>,
        state: Option<&RetryState>,
        last_error: &mut Option<BatchError>,
    ) -> BatchResult<T>
    where
        T: Send,
        C: RetryCallback<T> + ?Sized,
    {
        let mut running = true;
        for listener in &self.listeners {
            running = running && listener.open(ctx);
        }
        if !running {
            return Err(BatchError::RetryTerminated(
                "listener vetoed the retry before the first attempt".to_string(),
            ));
        }

        while self.retry_policy.can_retry(ctx) && !ctx.is_exhausted_only() {
            ctx.start_attempt();
            debug!(
                retry_count = ctx.retry_count(),
                attempt = ctx.attempt_count(),
                "Retry attempt"
            );
            *last_error = None;

            let outcome =
                RetrySynchronizationManager::scope(Arc::clone(ctx), callback.do_with_retry(ctx))
                    .await;

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            *last_error = Some(err.clone());
            for listener in self.listeners.iter().rev() {
                listener.on_error(ctx, &err);
            }
            self.register_error(ctx, state, &err)?;

            if self.retry_policy.can_retry(ctx) && !ctx.is_exhausted_only() {
                let delay = ctx.with_backoff(|backoff| self.backoff_policy.next_delay(backoff));
                if !delay.is_zero() {
                    debug!(delay_ms = delay.as_millis(), "Backing off before retry");
                    tokio::time::sleep(delay).await;
                }
            }

            if state.is_some_and(|state| state.rollback_for(&err)) {
                debug!(retry_count = ctx.retry_count(), "Rethrow in retry for rollback");
                return Err(err);
            }
        }

        debug!(retry_count = ctx.retry_count(), "Retry failed last attempt");
        let cause = ctx.last_error().unwrap_or_else(|| {
            BatchError::IllegalState("retry exhausted before any attempt".to_string())
        });
        if last_error.is_none() {
            *last_error = Some(cause.clone());
        }

        if ctx.is_exhausted_only() {
            return Err(BatchError::RetryExhausted {
                attempts: ctx.attempt_count(),
                cause: Box::new(cause),
            });
        }

        self.handle_exhausted(ctx, recovery, state, cause).await
    }

    async fn handle_exhausted<T: Send>(
        &self,
        ctx: &Arc<RetryContext>,
        recovery: Option<&mut (dyn RecoveryCallback<T> + '_)>,
        state: Option<&RetryState>,
        cause: BatchError,
    ) -> BatchResult<T> {
        if let Some(state) = state {
            self.cache.remove(state.key());
        }

        if let Some(recovery) = recovery {
            let value =
                RetrySynchronizationManager::scope(Arc::clone(ctx), recovery.recover(ctx)).await?;
            ctx.set_recovered();
            return Ok(value);
        }

        if state.is_some() {
            debug!("Retry exhausted after last attempt with no recovery path");
            return Err(BatchError::RetryExhausted {
                attempts: ctx.attempt_count(),
                cause: Box::new(cause),
            });
        }

        Err(cause)
    }

    fn open(&self, state: Option<&RetryState>) -> Arc<RetryContext> {
        let parent = RetrySynchronizationManager::current();
        match state {
            Some(state) if !state.is_force_refresh() => self
                .cache
                .get(state.key())
                .unwrap_or_else(|| self.retry_policy.open(parent)),
            _ => self.retry_policy.open(parent),
        }
    }

    fn register_error(
        &self,
        ctx: &Arc<RetryContext>,
        state: Option<&RetryState>,
        err: &BatchError,
    ) -> BatchResult<()> {
        if let Some(state) = state {
            if ctx.retry_count() > 0 && !self.cache.contains_key(state.key()) {
                return Err(BatchError::IllegalState(format!(
                    "inconsistent retry state: key '{}' is no longer cached",
                    state.key()
                )));
            }
            self.cache.put(state.key(), Arc::clone(ctx))?;
        }
        self.retry_policy.register_error(ctx, err);
        Ok(())
    }

    fn close(&self, ctx: &RetryContext, state: Option<&RetryState>, succeeded: bool) {
        match state {
            Some(state) => {
                if succeeded {
                    self.cache.remove(state.key());
                    self.retry_policy.close(ctx);
                }
            }
            None => self.retry_policy.close(ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorKindClassifier;
    use crate::retry::{AlwaysRetryPolicy, FixedBackOffPolicy};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn flaky(failures: usize, calls: Arc<AtomicUsize>) -> impl RetryCallback<&'static str> {
        FnRetryCallback::new(move |_ctx| {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= failures {
                    Err(BatchError::item("transient", format!("failure {n}")))
                } else {
                    Ok("done")
                }
            }
        })
    }

    #[tokio::test]
    async fn test_stateless_retry_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut callback = flaky(2, Arc::clone(&calls));

        let result = RetryTemplate::new().execute(&mut callback).await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_successful_call_sees_attempts_and_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(None));
        let mut callback = {
            let seen = Arc::clone(&seen);
            FnRetryCallback::new(move |ctx: Arc<RetryContext>| {
                let calls = Arc::clone(&calls);
                let seen = Arc::clone(&seen);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        return Err(BatchError::item("transient", "not yet"));
                    }
                    *seen.lock() = Some((ctx.attempt_count(), ctx.retry_count()));
                    Ok("done")
                }
            })
        };

        let result = RetryTemplate::new().execute(&mut callback).await;

        assert_eq!(result, Ok("done"));
        assert_eq!(*seen.lock(), Some((3, 2)));
    }

    #[tokio::test]
    async fn test_stateless_exhaustion_rethrows_last_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut callback = flaky(5, Arc::clone(&calls));

        let result = RetryTemplate::new().execute(&mut callback).await;

        assert_eq!(result, Err(BatchError::item("transient", "failure 3")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_recovery_after_exhaustion() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut callback = flaky(5, Arc::clone(&calls));
        let mut recovery = FnRecoveryCallback::new(|ctx: Arc<RetryContext>| async move {
            assert_eq!(ctx.retry_count(), 3);
            Ok("recovered")
        });

        let result = RetryTemplate::new()
            .execute_with_recovery(&mut callback, &mut recovery)
            .await;

        assert_eq!(result, Ok("recovered"));
    }

    #[tokio::test]
    async fn test_exhausted_only_stops_retrying() {
        let mut callback = FnRetryCallback::new(|ctx: Arc<RetryContext>| async move {
            ctx.set_exhausted_only();
            Err::<(), _>(BatchError::item("transient", "give up"))
        });

        let result = RetryTemplate::new()
            .with_retry_policy(Arc::new(AlwaysRetryPolicy))
            .execute(&mut callback)
            .await;

        assert!(matches!(result, Err(BatchError::RetryExhausted { attempts: 1, .. })));
    }

    #[tokio::test]
    async fn test_listener_veto() {
        struct Veto;
        impl RetryListener for Veto {
            fn open(&self, _ctx: &RetryContext) -> bool {
                false
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let mut callback = flaky(0, Arc::clone(&calls));
        let result = RetryTemplate::new()
            .with_listener(Arc::new(Veto))
            .execute(&mut callback)
            .await;

        assert!(matches!(result, Err(BatchError::RetryTerminated(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_listeners_observe_errors_and_close() {
        #[derive(Default)]
        struct Recording(Mutex<Vec<String>>);
        impl RetryListener for Recording {
            fn on_error(&self, _ctx: &RetryContext, error: &BatchError) {
                self.0.lock().push(format!("error:{}", error.kind()));
            }
            fn close(&self, _ctx: &RetryContext, error: Option<&BatchError>) {
                self.0.lock().push(format!("close:{}", error.is_some()));
            }
        }

        let listener = Arc::new(Recording::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut callback = flaky(1, Arc::clone(&calls));
        RetryTemplate::new()
            .with_listener(listener.clone())
            .execute(&mut callback)
            .await
            .unwrap();

        assert_eq!(*listener.0.lock(), vec!["error:transient", "close:false"]);
    }

    #[tokio::test]
    async fn test_stateful_retry_continues_across_calls() {
        let template = RetryTemplate::new();
        let state = RetryState::new("item-7");
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(None));

        for invocation in 1..=3 {
            let calls = Arc::clone(&calls);
            let seen = Arc::clone(&seen);
            let mut callback = FnRetryCallback::new(move |ctx: Arc<RetryContext>| {
                let calls = Arc::clone(&calls);
                let seen = Arc::clone(&seen);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n <= 2 {
                        return Err(BatchError::item("transient", "rollback me"));
                    }
                    *seen.lock() = Some((ctx.attempt_count(), ctx.retry_count()));
                    Ok(n)
                }
            });

            let result = template.execute_stateful(&mut callback, None, &state).await;
            if invocation < 3 {
                assert!(result.is_err());
                assert!(template.cache().contains_key("item-7"));
            } else {
                assert_eq!(result, Ok(3));
            }
        }

        assert_eq!(*seen.lock(), Some((3, 2)));
        assert!(!template.cache().contains_key("item-7"));
    }

    #[tokio::test]
    async fn test_stateful_exhaustion_without_recovery() {
        let template = RetryTemplate::new().with_retry_policy(Arc::new(SimpleRetryPolicy::new(2)));
        let state = RetryState::new("poison");
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let mut callback = flaky(10, Arc::clone(&calls));
            let result = template.execute_stateful(&mut callback, None, &state).await;
            assert!(matches!(result, Err(BatchError::Item { .. })));
        }

        let mut callback = flaky(10, Arc::clone(&calls));
        let result = template.execute_stateful(&mut callback, None, &state).await;

        assert!(matches!(result, Err(BatchError::RetryExhausted { attempts: 2, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!template.cache().contains_key("poison"));
    }

    #[tokio::test]
    async fn test_stateful_no_rollback_loops_in_place() {
        let template = RetryTemplate::new();
        let state = RetryState::new("key")
            .with_rollback_classifier(Arc::new(ErrorKindClassifier::excluding(["transient"])));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut callback = flaky(2, Arc::clone(&calls));

        let result = template.execute_stateful(&mut callback, None, &state).await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_backoff_sleeps_between_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut callback = flaky(2, Arc::clone(&calls));
        let template = RetryTemplate::new()
            .with_backoff_policy(Arc::new(FixedBackOffPolicy::new(Duration::from_millis(20))));

        let started = std::time::Instant::now();
        template.execute(&mut callback).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_nested_retry_sees_parent() {
        let template = RetryTemplate::new();
        let inner_template = template.clone();
        let mut outer = FnRetryCallback::new(move |_ctx| {
            let inner_template = inner_template.clone();
            async move {
                let mut inner = FnRetryCallback::new(|ctx: Arc<RetryContext>| async move {
                    Ok::<_, BatchError>(ctx.parent().is_some())
                });
                inner_template.execute(&mut inner).await
            }
        });

        assert_eq!(template.execute(&mut outer).await, Ok(true));
    }
}
