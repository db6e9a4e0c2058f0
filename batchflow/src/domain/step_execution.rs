//! Step executions and their counters.

use super::{FailureRecord, StepContribution};
use crate::cancellation::CancellationToken;
use crate::context::ExecutionContext;
use crate::core::{BatchStatus, ExitStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// One attempt to run one step within a job execution.
///
/// A restart creates a new step execution that inherits the previous one's
/// [`ExecutionContext`]. Counters only change at chunk commit, through
/// [`StepExecution::apply`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    /// Unique id.
    pub id: Uuid,
    /// Owning job execution.
    pub job_execution_id: Uuid,
    /// Step name.
    pub step_name: String,
    /// Current status.
    pub status: BatchStatus,
    /// Current exit status.
    pub exit_status: ExitStatus,
    /// Items read.
    pub read_count: usize,
    /// Items written.
    pub write_count: usize,
    /// Items filtered out by the processor.
    pub filter_count: usize,
    /// Successful chunk commits.
    pub commit_count: usize,
    /// Chunk rollbacks.
    pub rollback_count: usize,
    /// Items skipped on read.
    pub read_skip_count: usize,
    /// Items skipped on process.
    pub process_skip_count: usize,
    /// Items skipped on write.
    pub write_skip_count: usize,
    /// Items recovered after their retries were exhausted.
    #[serde(default)]
    pub recover_count: usize,
    /// Start time.
    pub start_time: DateTime<Utc>,
    /// End time, once finished.
    pub end_time: Option<DateTime<Utc>>,
    /// Last time the repository persisted this execution.
    pub last_updated: Option<DateTime<Utc>>,
    /// Step checkpoint.
    pub execution_context: ExecutionContext,
    /// Failures recorded during the run.
    pub failures: Vec<FailureRecord>,
    terminate_only: bool,
    #[serde(skip)]
    stop_token: Arc<CancellationToken>,
}

impl StepExecution {
    /// Creates a new step execution in `Starting` status.
    #[must_use]
    pub fn new(step_name: impl Into<String>, job_execution_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_execution_id,
            step_name: step_name.into(),
            status: BatchStatus::Starting,
            exit_status: ExitStatus::executing(),
            read_count: 0,
            write_count: 0,
            filter_count: 0,
            commit_count: 0,
            rollback_count: 0,
            read_skip_count: 0,
            process_skip_count: 0,
            write_skip_count: 0,
            recover_count: 0,
            start_time: Utc::now(),
            end_time: None,
            last_updated: None,
            execution_context: ExecutionContext::new(),
            failures: Vec::new(),
            terminate_only: false,
            stop_token: Arc::new(CancellationToken::new()),
        }
    }

    /// Shares a stop token with another execution.
    #[must_use]
    pub fn with_stop_token(mut self, token: Arc<CancellationToken>) -> Self {
        self.stop_token = token;
        self
    }

    /// Replaces the checkpoint.
    #[must_use]
    pub fn with_execution_context(mut self, ctx: ExecutionContext) -> Self {
        self.execution_context = ctx;
        self
    }

    /// Returns the stop token.
    #[must_use]
    pub fn stop_token(&self) -> &Arc<CancellationToken> {
        &self.stop_token
    }

    /// Total of read, process and write skips.
    #[must_use]
    pub fn skip_count(&self) -> usize {
        self.read_skip_count + self.process_skip_count + self.write_skip_count
    }

    /// Flags the step to stop at the next chunk boundary.
    pub fn set_terminate_only(&mut self) {
        self.terminate_only = true;
    }

    /// Returns true if the step was flagged to stop.
    #[must_use]
    pub fn is_terminate_only(&self) -> bool {
        self.terminate_only
    }

    /// Returns true if the step should stop at the next chunk boundary.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.terminate_only || self.stop_token.is_cancelled()
    }

    /// Creates a contribution for the next chunk attempt.
    #[must_use]
    pub fn create_contribution(&self) -> StepContribution {
        StepContribution::new(self.skip_count())
    }

    /// Applies a committed chunk's contribution.
    pub fn apply(&mut self, contribution: &StepContribution) {
        self.read_count += contribution.read_count;
        self.write_count += contribution.write_count;
        self.filter_count += contribution.filter_count;
        self.read_skip_count += contribution.read_skip_count;
        self.process_skip_count += contribution.process_skip_count;
        self.write_skip_count += contribution.write_skip_count;
        self.recover_count += contribution.recover_count;
        self.exit_status = self.exit_status.and(&contribution.exit_status);
    }

    /// Records a failure.
    pub fn add_failure(&mut self, failure: FailureRecord) {
        self.failures.push(failure);
    }

    /// One-line summary for logs.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{}: status={}, exitStatus={}, readCount={}, filterCount={}, writeCount={}, \
             readSkipCount={}, writeSkipCount={}, processSkipCount={}, recoverCount={}, \
             commitCount={}, rollbackCount={}",
            self.step_name,
            self.status,
            self.exit_status.exit_code(),
            self.read_count,
            self.filter_count,
            self.write_count,
            self.read_skip_count,
            self.write_skip_count,
            self.process_skip_count,
            self.recover_count,
            self.commit_count,
            self.rollback_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_contribution() {
        let mut execution = StepExecution::new("load", Uuid::new_v4());
        let mut contribution = execution.create_contribution();
        contribution.increment_read_count();
        contribution.increment_read_count();
        contribution.increment_write_count(1);
        contribution.increment_filter_count();
        contribution.increment_process_skip_count();

        execution.apply(&contribution);

        assert_eq!(execution.read_count, 2);
        assert_eq!(execution.write_count, 1);
        assert_eq!(execution.filter_count, 1);
        assert_eq!(execution.skip_count(), 1);
    }

    #[test]
    fn test_terminate_only_stops() {
        let mut execution = StepExecution::new("load", Uuid::new_v4());
        assert!(!execution.should_stop());
        execution.set_terminate_only();
        assert!(execution.should_stop());
    }

    #[test]
    fn test_serde_skips_token() {
        let execution = StepExecution::new("load", Uuid::new_v4());
        execution.stop_token().cancel("stop");

        let json = serde_json::to_string(&execution).unwrap();
        let restored: StepExecution = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.step_name, "load");
        assert!(!restored.should_stop());
    }
}
