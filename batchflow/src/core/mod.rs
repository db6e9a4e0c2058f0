//! Core status types shared by every layer of the engine.

mod exit_status;
mod status;

pub use exit_status::{ExitStatus, COMPLETED, EXECUTING, FAILED, NOOP, STOPPED, UNKNOWN};
pub use status::{BatchStatus, RepeatStatus};
