//! Turning a master step execution into partition step executions.

use super::partitioner::{PartitionMapper, Partitioner};
use crate::context::ExecutionContext;
use crate::core::BatchStatus;
use crate::domain::StepExecution;
use crate::errors::{BatchError, BatchResult};
use crate::repository::JobRepository;
use async_trait::async_trait;
use std::fmt::{self, Debug};
use std::sync::Arc;
use tracing::{debug, info};

/// Creates the step executions a partitioned step should run.
#[async_trait]
pub trait StepExecutionSplitter: Send + Sync + Debug {
    /// Base name of the partition steps.
    fn step_name(&self) -> &str;

    /// Creates and persists the executions to run for `master`.
    ///
    /// On restart only the partitions that did not complete are returned,
    /// each carrying its previous context.
    async fn split(&self, master: &mut StepExecution, grid_size: usize)
        -> BatchResult<Vec<StepExecution>>;
}

#[derive(Debug, Clone)]
enum PartitionSource {
    Partitioner(Arc<dyn Partitioner>),
    Mapper(Arc<dyn PartitionMapper>),
}

/// Splitter that names partitions `{step}:{partition}` and remembers the
/// grid size in the master context so a restart rebuilds the same set.
#[derive(Clone)]
pub struct SimpleStepExecutionSplitter {
    repository: Arc<dyn JobRepository>,
    step_name: String,
    source: PartitionSource,
    allow_start_if_complete: bool,
    override_on_restart: bool,
}

impl Debug for SimpleStepExecutionSplitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleStepExecutionSplitter")
            .field("step_name", &self.step_name)
            .field("source", &self.source)
            .field("allow_start_if_complete", &self.allow_start_if_complete)
            .field("override_on_restart", &self.override_on_restart)
            .finish_non_exhaustive()
    }
}

impl SimpleStepExecutionSplitter {
    /// Master context key holding the grid size of the first run.
    pub const GRID_SIZE_KEY: &'static str = "SimpleStepExecutionSplitter.GRID_SIZE";

    /// Creates a splitter whose partitions come from `partitioner`.
    #[must_use]
    pub fn new(
        repository: Arc<dyn JobRepository>,
        step_name: impl Into<String>,
        partitioner: Arc<dyn Partitioner>,
    ) -> Self {
        Self {
            repository,
            step_name: step_name.into(),
            source: PartitionSource::Partitioner(partitioner),
            allow_start_if_complete: false,
            override_on_restart: false,
        }
    }

    /// Creates a splitter whose partitions come from a plan.
    #[must_use]
    pub fn from_mapper(
        repository: Arc<dyn JobRepository>,
        step_name: impl Into<String>,
        mapper: Arc<dyn PartitionMapper>,
    ) -> Self {
        Self {
            repository,
            step_name: step_name.into(),
            source: PartitionSource::Mapper(mapper),
            allow_start_if_complete: false,
            override_on_restart: false,
        }
    }

    /// Re-runs completed partitions on restart.
    #[must_use]
    pub fn with_allow_start_if_complete(mut self, allow: bool) -> Self {
        self.allow_start_if_complete = allow;
        self
    }

    /// Regenerates every partition on restart.
    #[must_use]
    pub fn with_override_on_restart(mut self, override_on_restart: bool) -> Self {
        self.override_on_restart = override_on_restart;
        self
    }

    /// Named partition contexts plus whether previous partition results are
    /// discarded.
    fn contexts(
        &self,
        master: &mut StepExecution,
        grid_size: usize,
    ) -> BatchResult<(Vec<(String, ExecutionContext)>, bool)> {
        match &self.source {
            PartitionSource::Partitioner(partitioner) => {
                let saved = master
                    .execution_context
                    .get_long(Self::GRID_SIZE_KEY)
                    .and_then(|size| usize::try_from(size).ok());
                let split_size = match saved {
                    Some(size) if !self.override_on_restart => size,
                    _ => {
                        master.execution_context.put_long(
                            Self::GRID_SIZE_KEY,
                            i64::try_from(grid_size).unwrap_or(i64::MAX),
                        );
                        grid_size
                    }
                };
                Ok((partitioner.partition(split_size)?, self.override_on_restart))
            }
            PartitionSource::Mapper(mapper) => {
                let plan = mapper.map_partitions()?;
                master.execution_context.put_long(
                    Self::GRID_SIZE_KEY,
                    i64::try_from(plan.partitions).unwrap_or(i64::MAX),
                );
                let discard = plan.partitions_override || self.override_on_restart;
                Ok((plan.contexts()?, discard))
            }
        }
    }

    /// Decides whether a partition runs and gives it its context.
    fn is_startable(
        &self,
        execution: &mut StepExecution,
        last: Option<StepExecution>,
        ctx: ExecutionContext,
    ) -> BatchResult<bool> {
        match last {
            Some(last) if last.status == BatchStatus::Unknown => Err(BatchError::JobRestart(
                format!("partition '{}' is of status UNKNOWN", last.step_name),
            )),
            Some(last) if last.status != BatchStatus::Completed => {
                debug!(partition = %execution.step_name, status = %last.status, "Restarting partition");
                execution.execution_context = last.execution_context;
                Ok(true)
            }
            Some(_) => {
                execution.execution_context = ctx;
                Ok(self.allow_start_if_complete)
            }
            None => {
                execution.execution_context = ctx;
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl StepExecutionSplitter for SimpleStepExecutionSplitter {
    fn step_name(&self) -> &str {
        &self.step_name
    }

    async fn split(
        &self,
        master: &mut StepExecution,
        grid_size: usize,
    ) -> BatchResult<Vec<StepExecution>> {
        let Some(job_execution) = self.repository.get_job_execution(master.job_execution_id).await?
        else {
            return Err(BatchError::Repository(format!(
                "no job execution with id {}",
                master.job_execution_id
            )));
        };
        let (contexts, discard_previous) = self.contexts(master, grid_size)?;

        let mut executions = Vec::with_capacity(contexts.len());
        for (name, ctx) in contexts {
            let mut execution =
                StepExecution::new(format!("{}:{name}", self.step_name), master.job_execution_id)
                    .with_stop_token(Arc::clone(master.stop_token()));
            let last = if discard_previous {
                None
            } else {
                self.repository
                    .get_last_step_execution(&job_execution.job_instance, &execution.step_name)
                    .await?
            };
            if self.is_startable(&mut execution, last, ctx)? {
                executions.push(execution);
            }
        }

        for execution in &mut executions {
            self.repository.add_step_execution(execution).await?;
        }
        info!(
            step = %self.step_name,
            partitions = executions.len(),
            "Split step into partitions"
        );
        Ok(executions)
    }
}
