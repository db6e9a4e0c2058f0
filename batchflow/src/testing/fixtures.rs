//! Repository-backed fixtures for step tests.

use std::sync::Arc;

use crate::domain::{JobExecution, JobParameters, StepExecution};
use crate::errors::BatchResult;
use crate::repository::{InMemoryJobRepository, JobRepository};

/// A job execution in an in-memory repository to hang step executions on.
#[derive(Debug, Clone)]
pub struct StepFixture {
    repository: Arc<InMemoryJobRepository>,
    job_execution: JobExecution,
}

impl StepFixture {
    /// Creates a repository and a job execution named `job_name`.
    pub async fn new(job_name: &str) -> BatchResult<Self> {
        let repository = Arc::new(InMemoryJobRepository::new());
        let job_execution = repository
            .create_job_execution(job_name, &JobParameters::new())
            .await?;
        Ok(Self {
            repository,
            job_execution,
        })
    }

    /// The repository, typed for step builders.
    #[must_use]
    pub fn repository(&self) -> Arc<dyn JobRepository> {
        self.repository.clone()
    }

    /// The concrete repository, for inspection.
    #[must_use]
    pub fn store(&self) -> &Arc<InMemoryJobRepository> {
        &self.repository
    }

    /// The job execution the steps belong to.
    #[must_use]
    pub fn job_execution(&self) -> &JobExecution {
        &self.job_execution
    }

    /// Adds a fresh step execution.
    pub async fn step_execution(&self, step_name: &str) -> BatchResult<StepExecution> {
        let mut execution = self.job_execution.create_step_execution(step_name);
        self.repository.add_step_execution(&mut execution).await?;
        Ok(execution)
    }

    /// Adds a step execution that resumes from `previous`'s checkpoint.
    pub async fn restart(&self, previous: &StepExecution) -> BatchResult<StepExecution> {
        let mut execution = self
            .job_execution
            .create_step_execution(previous.step_name.clone())
            .with_execution_context(previous.execution_context.clone());
        self.repository.add_step_execution(&mut execution).await?;
        Ok(execution)
    }
}

/// The numbers `1..=n`.
#[must_use]
pub fn numbers(n: u32) -> Vec<u32> {
    (1..=n).collect()
}
