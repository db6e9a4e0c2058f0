//! Retry engine.
//!
//! A [`RetryTemplate`] re-runs a [`RetryCallback`] until it succeeds or the
//! [`RetryPolicy`] gives up, pausing between attempts according to a
//! [`BackOffPolicy`]. Stateful retries are correlated by a [`RetryState`] key
//! and survive across separate transactional attempts through a
//! [`RetryContextCache`].

mod backoff;
mod context;
mod listener;
mod policy;
mod state;
mod synchronization;
mod template;

pub use backoff::{
    BackOffContext, BackOffPolicy, ExponentialBackOffPolicy, FixedBackOffPolicy, JitterStrategy,
    NoBackOffPolicy,
};
pub use context::RetryContext;
pub use listener::RetryListener;
pub use policy::{
    AlwaysRetryPolicy, CompositeRetryPolicy, ExceptionClassifierRetryPolicy, NeverRetryPolicy,
    RetryPolicy, SimpleRetryPolicy, TimeoutRetryPolicy,
};
pub use state::{MapRetryContextCache, RetryContextCache, RetryState};
pub use synchronization::RetrySynchronizationManager;
pub use template::{
    FnRecoveryCallback, FnRetryCallback, RecoveryCallback, RetryCallback, RetryTemplate,
};
