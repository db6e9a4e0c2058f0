//! Testing utilities for batch steps and jobs.
//!
//! This module provides:
//! - Scripted readers, processors and writers that fail on chosen items
//! - Recording listeners and recoverers
//! - A repository-backed fixture for running steps
//! - Assertions on execution outcomes

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_job_status, assert_step_counts, assert_step_status};
pub use fixtures::{numbers, StepFixture};
pub use mocks::{
    CountingListener, FailingItemReader, RecordingRecoverer, RecordingSkipListener,
    ScriptedItemProcessor, ScriptedItemWriter, StopAfterCommits,
};
