//! The master step of a partitioned step and its helpers.

use super::collect::PartitionReducer;
use super::handler::PartitionHandler;
use super::splitter::StepExecutionSplitter;
use crate::core::{BatchStatus, ExitStatus};
use crate::domain::{FailureRecord, StepExecution};
use crate::errors::{BatchError, BatchResult};
use crate::repository::JobRepository;
use crate::step::{execute_step, Step, StepBody, StepSettings};
use async_trait::async_trait;
use chrono::Utc;
use std::fmt::{self, Debug};
use std::sync::Arc;
use tracing::{info, warn};

/// Folds partition results into the master execution.
pub trait StepExecutionAggregator: Send + Sync + Debug {
    /// Merges `executions` into `result`.
    fn aggregate(&self, result: &mut StepExecution, executions: &[StepExecution]);
}

/// Sums the counters, upgrades the status and `and`s the exit statuses.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultStepExecutionAggregator;

impl StepExecutionAggregator for DefaultStepExecutionAggregator {
    fn aggregate(&self, result: &mut StepExecution, executions: &[StepExecution]) {
        if executions.is_empty() {
            return;
        }
        result.status = BatchStatus::Starting;
        for execution in executions {
            result.status = result.status.upgrade_to(execution.status);
            result.exit_status = result.exit_status.and(&execution.exit_status);
            result.read_count += execution.read_count;
            result.write_count += execution.write_count;
            result.filter_count += execution.filter_count;
            result.commit_count += execution.commit_count;
            result.rollback_count += execution.rollback_count;
            result.read_skip_count += execution.read_skip_count;
            result.process_skip_count += execution.process_skip_count;
            result.write_skip_count += execution.write_skip_count;
            result.recover_count += execution.recover_count;
        }
    }
}

/// Step that splits its work into partitions and waits for all of them.
///
/// The master ends `COMPLETED` only if every partition completed. On
/// restart only the unfinished partitions run again.
pub struct PartitionStep {
    settings: StepSettings,
    handler: Arc<dyn PartitionHandler>,
    splitter: Arc<dyn StepExecutionSplitter>,
    aggregator: Arc<dyn StepExecutionAggregator>,
    reducer: Option<Arc<dyn PartitionReducer>>,
}

impl Debug for PartitionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionStep")
            .field("settings", &self.settings)
            .field("handler", &self.handler)
            .field("splitter", &self.splitter)
            .field("reducer", &self.reducer.is_some())
            .finish_non_exhaustive()
    }
}

impl PartitionStep {
    /// Creates a partitioned step.
    #[must_use]
    pub fn new(
        settings: StepSettings,
        handler: Arc<dyn PartitionHandler>,
        splitter: Arc<dyn StepExecutionSplitter>,
    ) -> Self {
        Self {
            settings,
            handler,
            splitter,
            aggregator: Arc::new(DefaultStepExecutionAggregator),
            reducer: None,
        }
    }

    /// Replaces the aggregator.
    #[must_use]
    pub fn with_aggregator(mut self, aggregator: Arc<dyn StepExecutionAggregator>) -> Self {
        self.aggregator = aggregator;
        self
    }

    /// Sets the reducer.
    #[must_use]
    pub fn with_reducer(mut self, reducer: Arc<dyn PartitionReducer>) -> Self {
        self.reducer = Some(reducer);
        self
    }

    async fn finish_reducer(&self, status: BatchStatus) -> BatchResult<()> {
        let Some(reducer) = &self.reducer else {
            return Ok(());
        };
        if status == BatchStatus::Completed {
            reducer.before_partitioned_step_completion().await?;
        } else {
            reducer.rollback_partitioned_step().await?;
        }
        reducer.after_partitioned_step_completion(status).await
    }
}

#[async_trait]
impl StepBody for PartitionStep {
    async fn do_execute(&self, execution: &mut StepExecution) -> BatchResult<()> {
        if let Some(reducer) = &self.reducer {
            reducer.begin_partitioned_step().await?;
        }

        let partitions = match self.handler.handle(self.splitter.as_ref(), execution).await {
            Ok(partitions) => partitions,
            Err(err) => {
                if let Err(reducer_err) = self.finish_reducer(BatchStatus::Failed).await {
                    warn!(step = %self.settings.name(), error = %reducer_err, "Partition reducer failed");
                }
                return Err(err);
            }
        };

        self.aggregator.aggregate(execution, &partitions);
        let status = execution.status;
        let completed = partitions
            .iter()
            .filter(|partition| partition.status == BatchStatus::Completed)
            .count();
        info!(
            step = %self.settings.name(),
            partitions = partitions.len(),
            completed,
            status = %status,
            "Partitions finished"
        );

        if status.is_unsuccessful() {
            self.finish_reducer(BatchStatus::Failed).await?;
            return Err(if status == BatchStatus::Stopped {
                BatchError::Interrupted(format!(
                    "partitions of step '{}' were stopped",
                    self.settings.name()
                ))
            } else {
                BatchError::Partition(format!(
                    "{} of {} partitions of step '{}' did not complete",
                    partitions.len() - completed,
                    partitions.len(),
                    self.settings.name()
                ))
            });
        }
        self.finish_reducer(BatchStatus::Completed).await
    }
}

#[async_trait]
impl Step for PartitionStep {
    fn name(&self) -> &str {
        self.settings.name()
    }

    fn start_limit(&self) -> usize {
        self.settings.start_limit()
    }

    fn allow_start_if_complete(&self) -> bool {
        self.settings.allow_start_if_complete()
    }

    async fn execute(&self, execution: &mut StepExecution) -> BatchResult<()> {
        execute_step(&self.settings, self, execution).await
    }
}

/// Builds the step for one partition from that partition's execution.
pub type StepFactory = Arc<dyn Fn(&StepExecution) -> BatchResult<Arc<dyn Step>> + Send + Sync>;

/// Step that builds a fresh instance for every execution, so partitions
/// never share readers, writers or retry state.
pub struct ScopedStep {
    name: String,
    repository: Arc<dyn JobRepository>,
    factory: StepFactory,
}

impl Debug for ScopedStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedStep")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ScopedStep {
    /// Creates a scoped step.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        repository: Arc<dyn JobRepository>,
        factory: StepFactory,
    ) -> Self {
        Self {
            name: name.into(),
            repository,
            factory,
        }
    }
}

#[async_trait]
impl Step for ScopedStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, execution: &mut StepExecution) -> BatchResult<()> {
        match (self.factory)(execution) {
            Ok(step) => step.execute(execution).await,
            Err(err) => {
                warn!(step = %self.name, partition = %execution.step_name, error = %err, "Could not build step");
                execution.status = BatchStatus::Failed;
                execution.exit_status = ExitStatus::failed().add_exit_description(&err.to_string());
                execution.end_time = Some(Utc::now());
                execution.add_failure(FailureRecord::new(self.name.clone(), &err));
                self.repository.update_step_execution(execution).await
            }
        }
    }
}
