//! Generic repeat engine.
//!
//! A [`RepeatTemplate`] keeps calling a [`RepeatCallback`] until the callback
//! returns [`RepeatStatus::Finished`](crate::core::RepeatStatus::Finished) or
//! its [`CompletionPolicy`] says the loop is complete. The chunk step uses two
//! nested templates: one over chunks and one over the items of a chunk.

mod context;
mod listener;
mod policy;
mod synchronization;
mod template;

pub use context::RepeatContext;
pub use listener::RepeatListener;
pub use policy::{
    CompletionPolicy, CompositeCompletionPolicy, DefaultResultCompletionPolicy,
    SimpleCompletionPolicy, TimeoutTerminationPolicy,
};
pub use synchronization::RepeatSynchronizationManager;
pub use template::{FnRepeatCallback, RepeatCallback, RepeatTemplate};
