//! Steps and the shared step lifecycle.
//!
//! A [`Step`] runs one [`StepExecution`] to a terminal status. Concrete steps
//! provide a [`StepBody`] and delegate the lifecycle to [`execute_step`],
//! which marks the execution started, calls listeners, maps failures to
//! `FAILED` or `STOPPED` and persists the final state.

mod builder;
mod chunk;
mod listener;
mod skip;
mod transaction;

#[cfg(test)]
mod chunk_tests;

pub use builder::StepBuilder;
pub use chunk::{ChunkOrientedStep, KeyGenerator};
pub use listener::{ChunkListener, ItemListener, SkipListener, StepExecutionListener};
pub use skip::{
    AlwaysSkipItemSkipPolicy, LimitCheckingItemSkipPolicy, NeverSkipItemSkipPolicy, SkipPolicy,
};
pub use transaction::{ResourcelessTransactionManager, Transaction, TransactionManager};

use crate::context::ExecutionContext;
use crate::core::{BatchStatus, ExitStatus};
use crate::domain::{FailureRecord, StepExecution};
use crate::errors::{BatchError, BatchResult};
use crate::repository::JobRepository;
use async_trait::async_trait;
use chrono::Utc;
use std::fmt::{self, Debug};
use std::sync::Arc;
use tracing::{error, info, warn};

/// A unit of a job.
#[async_trait]
pub trait Step: Send + Sync + Debug {
    /// Step name, unique within its job.
    fn name(&self) -> &str;

    /// How many times the step may be started for one job instance.
    fn start_limit(&self) -> usize {
        usize::MAX
    }

    /// Re-run the step on restart even if it already completed.
    fn allow_start_if_complete(&self) -> bool {
        false
    }

    /// Runs the execution to a terminal status.
    ///
    /// Failures of the step's own work end up in the execution's status;
    /// an `Err` means the execution could not be persisted.
    async fn execute(&self, execution: &mut StepExecution) -> BatchResult<()>;
}

/// Lifecycle settings shared by every step implementation.
#[derive(Clone)]
pub struct StepSettings {
    name: String,
    repository: Arc<dyn JobRepository>,
    listeners: Vec<Arc<dyn StepExecutionListener>>,
    start_limit: usize,
    allow_start_if_complete: bool,
}

impl Debug for StepSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepSettings")
            .field("name", &self.name)
            .field("listeners", &self.listeners.len())
            .field("start_limit", &self.start_limit)
            .field("allow_start_if_complete", &self.allow_start_if_complete)
            .finish_non_exhaustive()
    }
}

impl StepSettings {
    /// Creates settings for a step persisted in `repository`.
    #[must_use]
    pub fn new(name: impl Into<String>, repository: Arc<dyn JobRepository>) -> Self {
        Self {
            name: name.into(),
            repository,
            listeners: Vec::new(),
            start_limit: usize::MAX,
            allow_start_if_complete: false,
        }
    }

    /// Adds a listener.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn StepExecutionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Sets the start limit.
    #[must_use]
    pub fn with_start_limit(mut self, start_limit: usize) -> Self {
        self.start_limit = start_limit;
        self
    }

    /// Allows re-running a completed step on restart.
    #[must_use]
    pub fn with_allow_start_if_complete(mut self, allow: bool) -> Self {
        self.allow_start_if_complete = allow;
        self
    }

    /// Step name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The repository the step reports to.
    #[must_use]
    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.repository
    }

    /// The start limit.
    #[must_use]
    pub fn start_limit(&self) -> usize {
        self.start_limit
    }

    /// Whether a completed step runs again on restart.
    #[must_use]
    pub fn allow_start_if_complete(&self) -> bool {
        self.allow_start_if_complete
    }
}

/// The work of a step, run inside [`execute_step`].
#[async_trait]
pub trait StepBody: Send + Sync {
    /// Opens resources, restoring them from the checkpoint.
    async fn open(&self, _ctx: &ExecutionContext) -> BatchResult<()> {
        Ok(())
    }

    /// Does the work.
    async fn do_execute(&self, execution: &mut StepExecution) -> BatchResult<()>;

    /// Releases resources.
    async fn close(&self) -> BatchResult<()> {
        Ok(())
    }
}

/// Runs `body` with the standard step lifecycle.
pub async fn execute_step(
    settings: &StepSettings,
    body: &(dyn StepBody + '_),
    execution: &mut StepExecution,
) -> BatchResult<()> {
    info!(step = %settings.name, execution_id = %execution.id, "Executing step");
    execution.start_time = Utc::now();
    execution.status = BatchStatus::Started;
    settings.repository.update_step_execution(execution).await?;

    for listener in &settings.listeners {
        listener.before_step(execution);
    }

    let mut outcome = body.open(&execution.execution_context).await;
    if outcome.is_ok() {
        outcome = body.do_execute(execution).await;
    }
    if outcome.is_ok() && execution.should_stop() {
        let reason = execution
            .stop_token()
            .reason()
            .unwrap_or_else(|| format!("step '{}' was asked to terminate", settings.name));
        outcome = Err(BatchError::Interrupted(reason));
    }

    execution.exit_status = match outcome {
        Ok(()) => {
            execution.status = BatchStatus::Completed;
            execution.exit_status.and(&ExitStatus::completed())
        }
        Err(err) => finish_with_error(settings, execution, &err),
    };

    for listener in &settings.listeners {
        if let Some(status) = listener.after_step(execution) {
            execution.exit_status = execution.exit_status.and(&status);
        }
    }

    if let Err(err) = body.close().await {
        warn!(step = %settings.name, error = %err, "Failed to close step resources");
        execution.add_failure(FailureRecord::new(settings.name.clone(), &err));
    }

    execution.end_time = Some(Utc::now());
    settings.repository.update_execution_context(execution).await?;
    settings.repository.update_step_execution(execution).await?;

    info!(summary = %execution.summary(), "Step execution complete");
    Ok(())
}

fn finish_with_error(
    settings: &StepSettings,
    execution: &mut StepExecution,
    err: &BatchError,
) -> ExitStatus {
    execution.add_failure(FailureRecord::new(settings.name.clone(), err));
    if err.is_interruption() {
        info!(step = %settings.name, reason = %err, "Step stopped");
        execution.status = BatchStatus::Stopped;
        ExitStatus::stopped().add_exit_description(&err.to_string())
    } else {
        error!(step = %settings.name, error = %err, "Encountered an error executing step");
        execution.status = BatchStatus::Failed;
        ExitStatus::failed().add_exit_description(&err.to_string())
    }
}
