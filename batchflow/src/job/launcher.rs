//! Launching and stopping jobs.

use super::Job;
use crate::core::BatchStatus;
use crate::domain::{JobExecution, JobParameters};
use crate::errors::{BatchError, BatchResult};
use crate::repository::JobRepository;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Creates job executions in a repository and runs them.
#[derive(Debug, Clone)]
pub struct JobLauncher {
    repository: Arc<dyn JobRepository>,
}

impl JobLauncher {
    /// Creates a launcher over `repository`.
    #[must_use]
    pub fn new(repository: Arc<dyn JobRepository>) -> Self {
        Self { repository }
    }

    /// The repository executions are created in.
    #[must_use]
    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.repository
    }

    /// Runs `job` for the instance named by `params`.
    ///
    /// An existing instance is restarted. This fails if the job is not
    /// restartable, if an execution of the instance is running or has
    /// completed, or if one of its steps was left in `UNKNOWN` status.
    pub async fn run(&self, job: &dyn Job, params: &JobParameters) -> BatchResult<JobExecution> {
        if let Some(last) = self.repository.get_last_job_execution(job.name(), params).await? {
            if !job.is_restartable() {
                return Err(BatchError::JobRestart(format!(
                    "job instance {} already exists and is not restartable",
                    last.job_instance.key()
                )));
            }
            if let Some(step) = last
                .step_executions
                .iter()
                .find(|step| step.status == BatchStatus::Unknown)
            {
                return Err(BatchError::JobRestart(format!(
                    "step '{}' is of status UNKNOWN",
                    step.step_name
                )));
            }
        }

        let mut execution = self.repository.create_job_execution(job.name(), params).await?;
        info!(
            job = job.name(),
            parameters = %params.identity_key(),
            execution_id = %execution.id,
            "Job launched"
        );
        job.execute(&mut execution).await?;
        Ok(execution)
    }

    /// Requests a cooperative stop of a running execution.
    ///
    /// Running steps finish their current chunk and end `STOPPED`; no further
    /// step is started.
    pub async fn stop(&self, execution_id: Uuid) -> BatchResult<JobExecution> {
        let Some(mut execution) = self.repository.get_job_execution(execution_id).await? else {
            return Err(BatchError::Repository(format!(
                "no job execution with id {execution_id}"
            )));
        };
        if !execution.is_running() {
            return Err(BatchError::IllegalState(format!(
                "job execution {execution_id} is not running (status {})",
                execution.status
            )));
        }

        info!(job = execution.job_name(), execution_id = %execution_id, "Stopping job");
        execution.stop();
        self.repository.update_job_execution(&mut execution).await?;
        Ok(execution)
    }
}
