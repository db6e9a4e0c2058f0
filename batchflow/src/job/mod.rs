//! Jobs: ordered steps run against one job execution.
//!
//! A [`Job`] runs its steps for a [`JobExecution`] created by the
//! [`JobLauncher`]. On restart of a failed or stopped instance, steps that
//! already completed are skipped and the first unfinished step resumes from
//! its last checkpoint.

mod launcher;
mod simple;


pub use launcher::JobLauncher;
pub use simple::SimpleJob;

use crate::domain::JobExecution;
use crate::errors::BatchResult;
use async_trait::async_trait;
use std::fmt::Debug;

/// A batch job.
#[async_trait]
pub trait Job: Send + Sync + Debug {
    /// Job name; together with the identifying parameters it names the
    /// job instance.
    fn name(&self) -> &str;

    /// Whether a failed or stopped instance may be run again.
    fn is_restartable(&self) -> bool {
        true
    }

    /// Runs the execution to a terminal status.
    ///
    /// Failures of the job's work end up in the execution's status; an `Err`
    /// means the execution could not be persisted.
    async fn execute(&self, execution: &mut JobExecution) -> BatchResult<()>;
}

/// Observes the start and end of job executions.
pub trait JobExecutionListener: Send + Sync {
    /// Called before the first step.
    fn before_job(&self, _execution: &JobExecution) {}

    /// Called once the job reached its final status, before it is persisted.
    fn after_job(&self, _execution: &JobExecution) {}
}
