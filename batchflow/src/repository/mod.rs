//! Persistence boundary of the engine.
//!
//! The engine never persists anything itself. It calls the
//! [`JobRepository`] at job start, step start, every chunk commit and job and
//! step end. Only an in-memory implementation is provided.

mod memory;

pub use memory::InMemoryJobRepository;

use crate::domain::{JobExecution, JobInstance, JobParameters, StepExecution};
use crate::errors::BatchResult;
use async_trait::async_trait;
use std::fmt::Debug;
use uuid::Uuid;

/// Stores job instances, job executions and step executions.
#[async_trait]
pub trait JobRepository: Send + Sync + Debug {
    /// Returns true if an instance exists for this name and parameters.
    async fn job_instance_exists(&self, job_name: &str, params: &JobParameters) -> BatchResult<bool>;

    /// Creates the execution for a new run.
    ///
    /// For an existing instance the new execution inherits the previous
    /// execution's context. Fails with
    /// [`BatchError::JobExecutionAlreadyRunning`](crate::errors::BatchError::JobExecutionAlreadyRunning)
    /// while another execution runs, and with
    /// [`BatchError::JobInstanceAlreadyComplete`](crate::errors::BatchError::JobInstanceAlreadyComplete)
    /// once the instance has completed.
    async fn create_job_execution(
        &self,
        job_name: &str,
        params: &JobParameters,
    ) -> BatchResult<JobExecution>;

    /// Persists a job execution.
    ///
    /// A stop request persisted by another caller is merged into a running
    /// execution's status.
    async fn update_job_execution(&self, execution: &mut JobExecution) -> BatchResult<()>;

    /// Persists a job execution's context.
    async fn update_job_execution_context(&self, execution: &JobExecution) -> BatchResult<()>;

    /// Registers a new step execution.
    async fn add_step_execution(&self, execution: &mut StepExecution) -> BatchResult<()>;

    /// Persists a step execution's status and counters.
    ///
    /// Flags the step `terminate_only` when its job execution is stopping.
    async fn update_step_execution(&self, execution: &mut StepExecution) -> BatchResult<()>;

    /// Persists a step execution's context.
    async fn update_execution_context(&self, execution: &StepExecution) -> BatchResult<()>;

    /// The most recent execution of a step across all executions of an instance.
    async fn get_last_step_execution(
        &self,
        instance: &JobInstance,
        step_name: &str,
    ) -> BatchResult<Option<StepExecution>>;

    /// How many times a step has been started for an instance.
    async fn get_step_execution_count(
        &self,
        instance: &JobInstance,
        step_name: &str,
    ) -> BatchResult<usize>;

    /// Looks up one step execution.
    async fn get_step_execution(
        &self,
        job_execution_id: Uuid,
        step_execution_id: Uuid,
    ) -> BatchResult<Option<StepExecution>>;

    /// Looks up one job execution, with its step executions.
    async fn get_job_execution(&self, id: Uuid) -> BatchResult<Option<JobExecution>>;

    /// The most recent execution of an instance.
    async fn get_last_job_execution(
        &self,
        job_name: &str,
        params: &JobParameters,
    ) -> BatchResult<Option<JobExecution>>;

    /// Executions of a job that are still running.
    async fn find_running_executions(&self, job_name: &str) -> BatchResult<Vec<JobExecution>>;
}
