//! Running partition step executions.

use super::collect::{PartitionAnalyzer, PartitionData, PartitionDataQueue};
use super::partitioner::PartitionPlan;
use super::splitter::StepExecutionSplitter;
use crate::config::PartitionConfig;
use crate::core::{BatchStatus, ExitStatus};
use crate::domain::{FailureRecord, StepExecution};
use crate::errors::{BatchError, BatchResult};
use crate::repository::JobRepository;
use crate::step::Step;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Runs the partitions of a master step and reports their final state.
#[async_trait]
pub trait PartitionHandler: Send + Sync + Debug {
    /// Splits `master` and runs every partition to a terminal status.
    ///
    /// A failing partition never aborts its siblings.
    async fn handle(
        &self,
        splitter: &dyn StepExecutionSplitter,
        master: &mut StepExecution,
    ) -> BatchResult<Vec<StepExecution>>;
}

/// Runs partitions on tokio tasks, at most `threads` at a time.
///
/// With zero threads partitions run one after another on the caller. With
/// a poll interval, completion is detected by re-reading the partitions
/// from the repository instead of awaiting the workers.
pub struct TaskExecutorPartitionHandler {
    step: Arc<dyn Step>,
    repository: Arc<dyn JobRepository>,
    grid_size: usize,
    threads: usize,
    poll_interval: Option<Duration>,
    timeout: Option<Duration>,
    queue: Arc<PartitionDataQueue>,
    analyzer: Option<Arc<dyn PartitionAnalyzer>>,
}

impl Debug for TaskExecutorPartitionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskExecutorPartitionHandler")
            .field("step", &self.step.name())
            .field("grid_size", &self.grid_size)
            .field("threads", &self.threads)
            .field("poll_interval", &self.poll_interval)
            .field("timeout", &self.timeout)
            .field("analyzer", &self.analyzer.is_some())
            .finish_non_exhaustive()
    }
}

impl TaskExecutorPartitionHandler {
    /// Creates a handler running `step` for every partition.
    #[must_use]
    pub fn new(step: Arc<dyn Step>, repository: Arc<dyn JobRepository>) -> Self {
        let defaults = PartitionConfig::default();
        Self {
            step,
            repository,
            grid_size: defaults.grid_size,
            threads: defaults.threads,
            poll_interval: None,
            timeout: None,
            queue: Arc::new(PartitionDataQueue::new()),
            analyzer: None,
        }
    }

    /// Applies grid size, threads, polling and timeout from configuration.
    #[must_use]
    pub fn with_config(mut self, config: &PartitionConfig) -> Self {
        self.grid_size = config.grid_size;
        self.threads = config.threads;
        self.poll_interval = config.poll_interval_ms.map(Duration::from_millis);
        self.timeout = config.timeout_ms.map(Duration::from_millis);
        self
    }

    /// Takes grid size and threads from a plan.
    #[must_use]
    pub fn with_plan(mut self, plan: &PartitionPlan) -> Self {
        self.grid_size = plan.partitions;
        self.threads = plan.threads;
        self
    }

    /// Sets the grid size.
    #[must_use]
    pub fn with_grid_size(mut self, grid_size: usize) -> Self {
        self.grid_size = grid_size;
        self
    }

    /// Sets the number of concurrent workers.
    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Detects completion by polling the repository.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Gives up waiting for partitions after `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Feeds collector data and partition outcomes to `analyzer`.
    #[must_use]
    pub fn with_analyzer(mut self, analyzer: Arc<dyn PartitionAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// Shares `queue` with the partition collectors.
    #[must_use]
    pub fn with_data_queue(mut self, queue: Arc<PartitionDataQueue>) -> Self {
        self.queue = queue;
        self
    }

    /// The queue partition collectors should push to.
    #[must_use]
    pub fn data_queue(&self) -> Arc<PartitionDataQueue> {
        Arc::clone(&self.queue)
    }

    /// Hands every queued entry to the analyzer, oldest first.
    fn analyze_queue(&self) -> BatchResult<()> {
        let entries = self.queue.drain();
        let Some(analyzer) = &self.analyzer else {
            return Ok(());
        };
        for entry in entries {
            match entry {
                PartitionData::Collected { partition, data } => {
                    analyzer.analyze_collector_data(&partition, &data)?;
                }
                PartitionData::Finished {
                    partition,
                    status,
                    exit_status,
                } => analyzer.analyze_status(&partition, status, &exit_status)?,
            }
        }
        Ok(())
    }

    async fn with_timeout_limit<F>(&self, wait: F) -> BatchResult<Vec<StepExecution>>
    where
        F: Future<Output = BatchResult<Vec<StepExecution>>> + Send,
    {
        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait).await.map_err(|_| {
                BatchError::Partition(format!(
                    "partitions of '{}' did not finish within {timeout:?}",
                    self.step.name()
                ))
            })?,
            None => wait.await,
        }
    }

    async fn run_inline(&self, executions: Vec<StepExecution>) -> BatchResult<Vec<StepExecution>> {
        let mut finished = Vec::with_capacity(executions.len());
        for execution in executions {
            let execution = run_partition(
                Arc::clone(&self.step),
                execution,
                Arc::clone(&self.repository),
                Arc::clone(&self.queue),
                None,
            )
            .await;
            self.analyze_queue()?;
            finished.push(execution);
        }
        Ok(finished)
    }

    fn spawn_workers(
        &self,
        executions: Vec<StepExecution>,
    ) -> FuturesUnordered<JoinHandle<StepExecution>> {
        let permits = Arc::new(Semaphore::new(self.threads));
        executions
            .into_iter()
            .map(|execution| {
                tokio::spawn(run_partition(
                    Arc::clone(&self.step),
                    execution,
                    Arc::clone(&self.repository),
                    Arc::clone(&self.queue),
                    Some(Arc::clone(&permits)),
                ))
            })
            .collect()
    }

    async fn await_workers(
        &self,
        mut workers: FuturesUnordered<JoinHandle<StepExecution>>,
    ) -> BatchResult<Vec<StepExecution>> {
        let mut finished = Vec::with_capacity(workers.len());
        let mut first_error = None;
        while let Some(joined) = workers.next().await {
            match joined {
                Ok(execution) => finished.push(execution),
                Err(err) => {
                    error!(error = %err, "Partition worker panicked");
                    first_error.get_or_insert(BatchError::from(err));
                }
            }
            self.analyze_queue()?;
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(finished),
        }
    }

    async fn poll_repository(
        &self,
        launched: &[(uuid::Uuid, uuid::Uuid)],
        interval: Duration,
    ) -> BatchResult<Vec<StepExecution>> {
        loop {
            let mut finished = Vec::with_capacity(launched.len());
            for (job_execution_id, id) in launched {
                let Some(execution) = self.repository.get_step_execution(*job_execution_id, *id).await?
                else {
                    return Err(BatchError::Partition(format!(
                        "partition execution {id} disappeared from the repository"
                    )));
                };
                if !execution.status.is_running() {
                    finished.push(execution);
                }
            }
            self.analyze_queue()?;
            if finished.len() == launched.len() {
                return Ok(finished);
            }
            debug!(
                finished = finished.len(),
                total = launched.len(),
                "Waiting for partitions"
            );
            tokio::time::sleep(interval).await;
        }
    }
}

#[async_trait]
impl PartitionHandler for TaskExecutorPartitionHandler {
    async fn handle(
        &self,
        splitter: &dyn StepExecutionSplitter,
        master: &mut StepExecution,
    ) -> BatchResult<Vec<StepExecution>> {
        let executions = splitter.split(master, self.grid_size).await?;
        if executions.is_empty() {
            info!(step = %splitter.step_name(), "No partitions left to run");
            return Ok(Vec::new());
        }
        info!(
            step = %splitter.step_name(),
            partitions = executions.len(),
            threads = self.threads,
            "Launching partitions"
        );

        if self.threads == 0 {
            return self.with_timeout_limit(self.run_inline(executions)).await;
        }

        match self.poll_interval {
            Some(interval) => {
                let launched: Vec<_> = executions
                    .iter()
                    .map(|execution| (execution.job_execution_id, execution.id))
                    .collect();
                // Detached: completion is observed through the repository.
                drop(self.spawn_workers(executions));
                self.with_timeout_limit(self.poll_repository(&launched, interval))
                    .await
            }
            None => {
                let workers = self.spawn_workers(executions);
                self.with_timeout_limit(self.await_workers(workers)).await
            }
        }
    }
}

/// Runs one partition and queues its outcome.
///
/// A partition whose step errors out before recording its own status is
/// marked failed and saved here, so pollers watching the repository see
/// it finish.
async fn run_partition(
    step: Arc<dyn Step>,
    mut execution: StepExecution,
    repository: Arc<dyn JobRepository>,
    queue: Arc<PartitionDataQueue>,
    permits: Option<Arc<Semaphore>>,
) -> StepExecution {
    let _permit = match permits {
        Some(permits) => permits.acquire_owned().await.ok(),
        None => None,
    };

    debug!(partition = %execution.step_name, "Partition starting");
    if let Err(err) = step.execute(&mut execution).await {
        error!(partition = %execution.step_name, error = %err, "Partition could not be recorded");
        execution.status = BatchStatus::Failed;
        execution.exit_status = ExitStatus::failed().add_exit_description(&err.to_string());
        execution.end_time = Some(Utc::now());
        execution.add_failure(FailureRecord::new(execution.step_name.clone(), &err));
        if let Err(err) = repository.update_step_execution(&mut execution).await {
            error!(partition = %execution.step_name, error = %err, "Failed partition could not be saved");
        }
    }

    queue.push(PartitionData::Finished {
        partition: execution.step_name.clone(),
        status: execution.status,
        exit_status: execution.exit_status.clone(),
    });
    execution
}
