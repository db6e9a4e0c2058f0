//! Checkpoint state carried across restarts.
//!
//! This module provides:
//! - [`ExecutionContext`], the key-value checkpoint attached to executions
//! - [`RestartData`], the flat string-property form of the same state

mod execution_context;
mod restart_data;

pub use execution_context::ExecutionContext;
pub use restart_data::RestartData;
