//! A job that runs its steps in sequence.

use super::{Job, JobExecutionListener};
use crate::core::{BatchStatus, ExitStatus};
use crate::domain::{FailureRecord, JobExecution, StepExecution};
use crate::errors::{BatchError, BatchResult};
use crate::repository::JobRepository;
use crate::step::Step;
use async_trait::async_trait;
use chrono::Utc;
use std::fmt::{self, Debug};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Runs steps in order, stopping at the first step that does not complete.
///
/// The job's status and exit status are those of the last step executed. A
/// restart skips steps whose last execution completed (unless the step
/// allows re-running) and hands a resumed step the checkpoint of its last
/// execution.
#[derive(Clone)]
pub struct SimpleJob {
    name: String,
    repository: Arc<dyn JobRepository>,
    steps: Vec<Arc<dyn Step>>,
    listeners: Vec<Arc<dyn JobExecutionListener>>,
    restartable: bool,
}

impl Debug for SimpleJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleJob")
            .field("name", &self.name)
            .field("steps", &self.step_names())
            .field("listeners", &self.listeners.len())
            .field("restartable", &self.restartable)
            .finish_non_exhaustive()
    }
}

impl SimpleJob {
    /// Creates an empty, restartable job.
    #[must_use]
    pub fn new(name: impl Into<String>, repository: Arc<dyn JobRepository>) -> Self {
        Self {
            name: name.into(),
            repository,
            steps: Vec::new(),
            listeners: Vec::new(),
            restartable: true,
        }
    }

    /// Appends a step.
    #[must_use]
    pub fn with_step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    /// Adds a listener.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn JobExecutionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Sets whether the job may be restarted.
    #[must_use]
    pub fn with_restartable(mut self, restartable: bool) -> Self {
        self.restartable = restartable;
        self
    }

    /// Names of the steps in execution order.
    #[must_use]
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    async fn run_steps(&self, execution: &mut JobExecution) -> BatchResult<Option<StepExecution>> {
        let mut last = None;
        for step in &self.steps {
            let Some(step_execution) = self.handle_step(step.as_ref(), execution).await? else {
                continue;
            };
            let completed = step_execution.status == BatchStatus::Completed;
            last = Some(step_execution);
            if !completed {
                break;
            }
        }
        Ok(last)
    }

    async fn handle_step(
        &self,
        step: &dyn Step,
        execution: &mut JobExecution,
    ) -> BatchResult<Option<StepExecution>> {
        execution.stop_token().check()?;

        let last = self
            .repository
            .get_last_step_execution(&execution.job_instance, step.name())
            .await?;
        if !self.should_start(last.as_ref(), step, execution).await? {
            info!(step = step.name(), "Step already complete or not restartable, so no action to execute");
            return Ok(None);
        }

        let mut step_execution = execution.create_step_execution(step.name());
        if let Some(last) = last.filter(|last| last.status != BatchStatus::Completed) {
            debug!(step = step.name(), previous = %last.id, "Restarting step from its last checkpoint");
            step_execution = step_execution.with_execution_context(last.execution_context);
        }
        self.repository.add_step_execution(&mut step_execution).await?;
        execution.record_step_execution(&step_execution);

        step.execute(&mut step_execution).await?;

        execution.record_step_execution(&step_execution);
        self.repository.update_job_execution_context(execution).await?;
        Ok(Some(step_execution))
    }

    async fn should_start(
        &self,
        last: Option<&StepExecution>,
        step: &dyn Step,
        execution: &JobExecution,
    ) -> BatchResult<bool> {
        match last.map(|last| last.status) {
            Some(BatchStatus::Unknown) => {
                return Err(BatchError::JobRestart(format!(
                    "cannot restart step '{}' from UNKNOWN status",
                    step.name()
                )));
            }
            Some(BatchStatus::Completed) if !step.allow_start_if_complete() => return Ok(false),
            _ => {}
        }

        let starts = self
            .repository
            .get_step_execution_count(&execution.job_instance, step.name())
            .await?;
        if starts < step.start_limit() {
            Ok(true)
        } else {
            Err(BatchError::StartLimitExceeded {
                step: step.name().to_string(),
                limit: step.start_limit(),
            })
        }
    }
}

#[async_trait]
impl Job for SimpleJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_restartable(&self) -> bool {
        self.restartable
    }

    async fn execute(&self, execution: &mut JobExecution) -> BatchResult<()> {
        info!(job = %self.name, execution_id = %execution.id, "Job starting");
        execution.start_time = Some(Utc::now());
        execution.status = BatchStatus::Started;
        self.repository.update_job_execution(execution).await?;

        for listener in &self.listeners {
            listener.before_job(execution);
        }

        match self.run_steps(execution).await {
            Ok(Some(last)) => {
                execution.status = BatchStatus::Completed.upgrade_to(last.status);
                execution.exit_status = last.exit_status;
            }
            Ok(None) => {
                execution.status = BatchStatus::Completed;
                execution.exit_status = ExitStatus::noop().add_exit_description(
                    "All steps already completed or no steps configured for this job",
                );
            }
            Err(err) if err.is_interruption() => {
                info!(job = %self.name, reason = %err, "Job stopped");
                execution.status = BatchStatus::Stopped;
                execution.exit_status = ExitStatus::stopped().add_exit_description(&err.to_string());
            }
            Err(err) => {
                error!(job = %self.name, error = %err, "Encountered fatal error executing job");
                execution.add_failure(FailureRecord::new(self.name.clone(), &err));
                execution.status = BatchStatus::Failed;
                execution.exit_status = ExitStatus::failed().add_exit_description(&err.to_string());
            }
        }

        for listener in &self.listeners {
            listener.after_job(execution);
        }

        execution.end_time = Some(Utc::now());
        self.repository.update_job_execution(execution).await?;
        info!(
            job = %self.name,
            status = %execution.status,
            exit_code = execution.exit_status.exit_code(),
            "Job finished"
        );
        Ok(())
    }
}
