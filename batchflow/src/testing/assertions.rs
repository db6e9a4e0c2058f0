//! Assertions on execution outcomes.

use crate::core::BatchStatus;
use crate::domain::{JobExecution, StepExecution};

/// Asserts the step's status and exit code.
pub fn assert_step_status(execution: &StepExecution, status: BatchStatus, exit_code: &str) {
    assert_eq!(
        (execution.status, execution.exit_status.exit_code()),
        (status, exit_code),
        "Unexpected outcome for step '{}': {}",
        execution.step_name,
        execution.summary()
    );
}

/// Asserts the job's status and exit code.
pub fn assert_job_status(execution: &JobExecution, status: BatchStatus, exit_code: &str) {
    assert_eq!(
        (execution.status, execution.exit_status.exit_code()),
        (status, exit_code),
        "Unexpected outcome for job '{}'",
        execution.job_name()
    );
}

/// Asserts read, write and total skip counts.
pub fn assert_step_counts(execution: &StepExecution, read: usize, write: usize, skip: usize) {
    assert_eq!(
        (execution.read_count, execution.write_count, execution.skip_count()),
        (read, write, skip),
        "Expected (read, write, skip) counts for step '{}': {}",
        execution.step_name,
        execution.summary()
    );
}
