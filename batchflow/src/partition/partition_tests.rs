//! Partitioned step scenarios: failures, restarts, collectors and polling.

use super::*;
use crate::core::{BatchStatus, ExitStatus};
use crate::domain::{JobParameters, StepExecution};
use crate::errors::{BatchError, BatchResult};
use crate::item::ListItemReader;
use crate::job::{JobLauncher, SimpleJob};
use crate::repository::{InMemoryJobRepository, JobRepository};
use crate::step::{Step, StepBuilder, StepSettings};
use crate::testing::{
    assert_job_status, assert_step_status, numbers, ScriptedItemProcessor, ScriptedItemWriter,
    StepFixture,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Worker over the partition's `min..=max` range that fails on an even
/// lower bound while `fail_even` is set.
fn range_worker(
    repository: Arc<dyn JobRepository>,
    writer: Arc<ScriptedItemWriter<u32>>,
    fail_even: Arc<AtomicBool>,
) -> StepFactory {
    Arc::new(move |execution: &StepExecution| -> BatchResult<Arc<dyn Step>> {
        let ctx = &execution.execution_context;
        let min = ctx.get_long(RangePartitioner::MIN_KEY).unwrap_or_default();
        let max = ctx.get_long(RangePartitioner::MAX_KEY).unwrap_or_default();
        let items: Vec<u32> = (min..=max).map(|n| u32::try_from(n).unwrap()).collect();

        let mut processor = ScriptedItemProcessor::<u32>::new();
        if fail_even.load(Ordering::SeqCst) && min % 2 == 0 {
            processor = processor.fail_always(u32::try_from(min).unwrap(), "bad_record");
        }
        let step = StepBuilder::<u32, u32>::new("worker")
            .with_repository(repository.clone())
            .with_reader(Arc::new(ListItemReader::new("worker", items)))
            .with_processor(Arc::new(processor))
            .with_writer(writer.clone())
            .with_commit_interval(1)
            .build()?;
        Ok(Arc::new(step) as Arc<dyn Step>)
    })
}

/// Worker reading `numbers(4)` in chunks of two.
fn numbers_worker(
    repository: Arc<dyn JobRepository>,
    writer: Arc<ScriptedItemWriter<u32>>,
    listener: Option<Arc<PartitionCollectorListener>>,
) -> StepFactory {
    Arc::new(move |_execution: &StepExecution| -> BatchResult<Arc<dyn Step>> {
        let mut builder = StepBuilder::<u32, u32>::new("worker")
            .with_repository(repository.clone())
            .with_reader(Arc::new(ListItemReader::new("worker", numbers(4))))
            .without_processor()
            .with_writer(writer.clone())
            .with_commit_interval(2);
        if let Some(listener) = &listener {
            builder = builder.with_chunk_listener(listener.clone());
        }
        Ok(Arc::new(builder.build()?) as Arc<dyn Step>)
    })
}

#[tokio::test]
async fn test_failed_partitions_rerun_on_restart() {
    let repository = Arc::new(InMemoryJobRepository::new());
    let writer = Arc::new(ScriptedItemWriter::<u32>::new());
    let fail_even = Arc::new(AtomicBool::new(true));

    let worker = ScopedStep::new(
        "worker",
        repository.clone(),
        range_worker(repository.clone(), writer.clone(), fail_even.clone()),
    );
    let handler = TaskExecutorPartitionHandler::new(Arc::new(worker), repository.clone())
        .with_grid_size(6)
        .with_threads(2);
    let splitter = SimpleStepExecutionSplitter::new(
        repository.clone(),
        "worker",
        Arc::new(RangePartitioner::new(0, 5)),
    );
    let master = PartitionStep::new(
        StepSettings::new("master", repository.clone()),
        Arc::new(handler),
        Arc::new(splitter),
    );
    let job = SimpleJob::new("partitioned", repository.clone()).with_step(Arc::new(master));
    let launcher = JobLauncher::new(repository.clone());
    let params = JobParameters::new().with_long("run", 1);

    let first = launcher.run(&job, &params).await.unwrap();
    assert_job_status(&first, BatchStatus::Failed, "FAILED");
    let master_execution = &first.step_executions[0];
    assert_step_status(master_execution, BatchStatus::Failed, "FAILED");
    assert!(master_execution
        .exit_status
        .exit_description()
        .contains("3 of 6 partitions"));
    assert_eq!(master_execution.write_count, 3);

    let children: Vec<_> = repository
        .step_executions(first.id)
        .into_iter()
        .filter(|step| step.step_name.starts_with("worker:"))
        .collect();
    assert_eq!(children.len(), 6);
    let completed: Vec<_> = children
        .iter()
        .filter(|step| step.status == BatchStatus::Completed)
        .map(|step| step.step_name.as_str())
        .collect();
    assert_eq!(
        completed,
        vec!["worker:partition1", "worker:partition3", "worker:partition5"]
    );

    fail_even.store(false, Ordering::SeqCst);
    let second = launcher.run(&job, &params).await.unwrap();
    assert_job_status(&second, BatchStatus::Completed, "COMPLETED");

    let relaunched: Vec<_> = repository
        .step_executions(second.id)
        .into_iter()
        .filter(|step| step.step_name.starts_with("worker:"))
        .map(|step| step.step_name)
        .collect();
    assert_eq!(
        relaunched,
        vec!["worker:partition0", "worker:partition2", "worker:partition4"]
    );

    let untouched = repository
        .step_executions(first.id)
        .into_iter()
        .filter(|step| step.status == BatchStatus::Completed)
        .count();
    assert_eq!(untouched, 3);

    let mut written = writer.written();
    written.sort_unstable();
    assert_eq!(written, (0..=5).collect::<Vec<u32>>());
}

#[derive(Default)]
struct WriteCountCollector;

impl PartitionCollector for WriteCountCollector {
    fn collect_partition_data(&self, execution: &StepExecution) -> BatchResult<Option<Value>> {
        Ok(Some(json!(execution.write_count)))
    }
}

#[derive(Default)]
struct RecordingAnalyzer {
    events: Mutex<Vec<(String, String)>>,
}

impl RecordingAnalyzer {
    fn events(&self) -> Vec<(String, String)> {
        self.events.lock().clone()
    }
}

impl PartitionAnalyzer for RecordingAnalyzer {
    fn analyze_collector_data(&self, partition: &str, data: &Value) -> BatchResult<()> {
        self.events.lock().push((partition.to_string(), data.to_string()));
        Ok(())
    }

    fn analyze_status(
        &self,
        partition: &str,
        status: BatchStatus,
        _exit_status: &ExitStatus,
    ) -> BatchResult<()> {
        self.events.lock().push((partition.to_string(), status.to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingReducer {
    calls: Mutex<Vec<String>>,
}

impl RecordingReducer {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl PartitionReducer for RecordingReducer {
    async fn begin_partitioned_step(&self) -> BatchResult<()> {
        self.calls.lock().push("begin".to_string());
        Ok(())
    }

    async fn before_partitioned_step_completion(&self) -> BatchResult<()> {
        self.calls.lock().push("before_completion".to_string());
        Ok(())
    }

    async fn rollback_partitioned_step(&self) -> BatchResult<()> {
        self.calls.lock().push("rollback".to_string());
        Ok(())
    }

    async fn after_partitioned_step_completion(&self, status: BatchStatus) -> BatchResult<()> {
        self.calls.lock().push(format!("after:{status}"));
        Ok(())
    }
}

#[tokio::test]
async fn test_inline_partitions_feed_the_analyzer() {
    let fixture = StepFixture::new("partitioned").await.unwrap();
    let writer = Arc::new(ScriptedItemWriter::<u32>::new());
    let queue = Arc::new(PartitionDataQueue::new());
    let listener = Arc::new(PartitionCollectorListener::new(
        Arc::new(WriteCountCollector),
        queue.clone(),
    ));
    let analyzer = Arc::new(RecordingAnalyzer::default());
    let reducer = Arc::new(RecordingReducer::default());

    let worker = ScopedStep::new(
        "worker",
        fixture.repository(),
        numbers_worker(fixture.repository(), writer.clone(), Some(listener)),
    );
    let handler = TaskExecutorPartitionHandler::new(Arc::new(worker), fixture.repository())
        .with_grid_size(3)
        .with_threads(0)
        .with_data_queue(queue)
        .with_analyzer(analyzer.clone());
    let splitter = SimpleStepExecutionSplitter::new(
        fixture.repository(),
        "worker",
        Arc::new(SimplePartitioner),
    );
    let step = PartitionStep::new(
        StepSettings::new("master", fixture.repository()),
        Arc::new(handler),
        Arc::new(splitter),
    )
    .with_reducer(reducer.clone());

    let mut master = fixture.step_execution("master").await.unwrap();
    step.execute(&mut master).await.unwrap();

    assert_step_status(&master, BatchStatus::Completed, "COMPLETED");
    assert_eq!(master.read_count, 12);
    assert_eq!(master.write_count, 12);
    assert_eq!(writer.written().len(), 12);
    assert_eq!(
        master
            .execution_context
            .get_long(SimpleStepExecutionSplitter::GRID_SIZE_KEY),
        Some(3)
    );

    let events = analyzer.events();
    for index in 0..3 {
        let partition = format!("worker:{}", partition_name(index));
        let mine: Vec<_> = events
            .iter()
            .filter(|(name, _)| *name == partition)
            .map(|(_, value)| value.as_str())
            .collect();
        assert_eq!(mine.first(), Some(&"2"));
        assert_eq!(mine.last(), Some(&"COMPLETED"));
        assert!(mine.contains(&"4"));
    }
    // Inline partitions run one after another, so their entries never interleave.
    let mut grouped: Vec<_> = events.iter().map(|(name, _)| name.as_str()).collect();
    grouped.dedup();
    assert_eq!(
        grouped,
        vec!["worker:partition0", "worker:partition1", "worker:partition2"]
    );

    assert_eq!(
        reducer.calls(),
        vec!["begin", "before_completion", "after:COMPLETED"]
    );
}

#[tokio::test]
async fn test_polling_handler_waits_through_the_repository() {
    let fixture = StepFixture::new("partitioned").await.unwrap();
    let writer = Arc::new(ScriptedItemWriter::<u32>::new());
    let worker = ScopedStep::new(
        "worker",
        fixture.repository(),
        numbers_worker(fixture.repository(), writer.clone(), None),
    );
    let config = crate::config::PartitionConfig::new()
        .with_grid_size(4)
        .with_threads(2)
        .with_poll_interval_ms(5);
    let handler =
        TaskExecutorPartitionHandler::new(Arc::new(worker), fixture.repository()).with_config(&config);
    let splitter = SimpleStepExecutionSplitter::new(
        fixture.repository(),
        "worker",
        Arc::new(SimplePartitioner),
    );
    let step = PartitionStep::new(
        StepSettings::new("master", fixture.repository()),
        Arc::new(handler),
        Arc::new(splitter),
    );

    let mut master = fixture.step_execution("master").await.unwrap();
    step.execute(&mut master).await.unwrap();

    assert_step_status(&master, BatchStatus::Completed, "COMPLETED");
    assert_eq!(master.write_count, 16);
    assert_eq!(writer.written().len(), 16);
}

#[tokio::test]
async fn test_failing_partition_rolls_back_reducer() {
    let fixture = StepFixture::new("partitioned").await.unwrap();
    let writer = Arc::new(ScriptedItemWriter::<u32>::new().fail_always(3, "io"));
    let reducer = Arc::new(RecordingReducer::default());
    let worker = ScopedStep::new(
        "worker",
        fixture.repository(),
        numbers_worker(fixture.repository(), writer, None),
    );
    let handler = TaskExecutorPartitionHandler::new(Arc::new(worker), fixture.repository())
        .with_grid_size(2)
        .with_threads(2);
    let splitter = SimpleStepExecutionSplitter::new(
        fixture.repository(),
        "worker",
        Arc::new(SimplePartitioner),
    );
    let step = PartitionStep::new(
        StepSettings::new("master", fixture.repository()),
        Arc::new(handler),
        Arc::new(splitter),
    )
    .with_reducer(reducer.clone());

    let mut master = fixture.step_execution("master").await.unwrap();
    step.execute(&mut master).await.unwrap();

    assert_step_status(&master, BatchStatus::Failed, "FAILED");
    assert_eq!(master.write_count, 4);
    assert_eq!(reducer.calls(), vec!["begin", "rollback", "after:FAILED"]);
}

/// A worker that never finishes in time.
#[derive(Debug)]
struct SlowStep;

#[async_trait]
impl Step for SlowStep {
    fn name(&self) -> &str {
        "slow"
    }

    async fn execute(&self, _execution: &mut StepExecution) -> BatchResult<()> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }
}

#[tokio::test]
async fn test_handler_timeout_fails_the_master() {
    let fixture = StepFixture::new("partitioned").await.unwrap();
    let handler = TaskExecutorPartitionHandler::new(Arc::new(SlowStep), fixture.repository())
        .with_grid_size(2)
        .with_threads(2)
        .with_timeout(Duration::from_millis(50));
    let splitter =
        SimpleStepExecutionSplitter::new(fixture.repository(), "slow", Arc::new(SimplePartitioner));
    let step = PartitionStep::new(
        StepSettings::new("master", fixture.repository()),
        Arc::new(handler),
        Arc::new(splitter),
    );

    let mut master = fixture.step_execution("master").await.unwrap();
    step.execute(&mut master).await.unwrap();

    assert_step_status(&master, BatchStatus::Failed, "FAILED");
    assert!(master.exit_status.exit_description().contains("did not finish"));
}

/// A worker whose execution cannot even be recorded.
#[derive(Debug)]
struct BrokenStep;

#[async_trait]
impl Step for BrokenStep {
    fn name(&self) -> &str {
        "broken"
    }

    async fn execute(&self, _execution: &mut StepExecution) -> BatchResult<()> {
        Err(BatchError::Repository("store unavailable".to_string()))
    }
}

#[tokio::test]
async fn test_polling_handler_sees_partitions_that_error_out() {
    let fixture = StepFixture::new("partitioned").await.unwrap();
    let config = crate::config::PartitionConfig::new()
        .with_grid_size(2)
        .with_threads(2)
        .with_poll_interval_ms(5);
    let handler = TaskExecutorPartitionHandler::new(Arc::new(BrokenStep), fixture.repository())
        .with_config(&config);
    let splitter = SimpleStepExecutionSplitter::new(
        fixture.repository(),
        "broken",
        Arc::new(SimplePartitioner),
    );
    let step = PartitionStep::new(
        StepSettings::new("master", fixture.repository()),
        Arc::new(handler),
        Arc::new(splitter),
    );

    let mut master = fixture.step_execution("master").await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), step.execute(&mut master))
        .await
        .expect("polling never saw the failed partitions")
        .unwrap();

    assert_step_status(&master, BatchStatus::Failed, "FAILED");
    for name in ["broken:partition0", "broken:partition1"] {
        let stored = fixture
            .store()
            .get_last_step_execution(&fixture.job_execution().job_instance, name)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, BatchStatus::Failed);
    }
}

#[tokio::test]
async fn test_scoped_step_factory_error_fails_partition() {
    let fixture = StepFixture::new("partitioned").await.unwrap();
    let factory: StepFactory = Arc::new(|_execution: &StepExecution| -> BatchResult<Arc<dyn Step>> {
        Err(BatchError::Configuration("no input".to_string()))
    });
    let step = ScopedStep::new("worker", fixture.repository(), factory);

    let mut execution = fixture.step_execution("worker:partition0").await.unwrap();
    step.execute(&mut execution).await.unwrap();

    assert_step_status(&execution, BatchStatus::Failed, "FAILED");
    let stored = fixture
        .store()
        .get_step_execution(execution.job_execution_id, execution.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, BatchStatus::Failed);
}

#[derive(Debug)]
struct TwoFiles {
    partitions_override: bool,
}

impl PartitionMapper for TwoFiles {
    fn map_partitions(&self) -> BatchResult<PartitionPlan> {
        let contexts = ["a.csv", "b.csv"]
            .into_iter()
            .map(|file| {
                let mut ctx = crate::context::ExecutionContext::new();
                ctx.put_string("file", file);
                ctx
            })
            .collect();
        Ok(PartitionPlan::new(2)
            .with_properties(contexts)
            .with_override(self.partitions_override))
    }
}

async fn complete_all(fixture: &StepFixture, executions: &mut [StepExecution]) {
    for execution in executions {
        execution.status = BatchStatus::Completed;
        fixture.store().update_step_execution(execution).await.unwrap();
    }
}

#[tokio::test]
async fn test_splitter_skips_completed_partitions_unless_overridden() {
    let fixture = StepFixture::new("partitioned").await.unwrap();
    let plain = SimpleStepExecutionSplitter::from_mapper(
        fixture.repository(),
        "load",
        Arc::new(TwoFiles {
            partitions_override: false,
        }),
    );

    let mut master = fixture.step_execution("master").await.unwrap();
    let mut first = plain.split(&mut master, 6).await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first[1].step_name, "load:partition1");
    assert_eq!(first[1].execution_context.get_string("file"), Some("b.csv"));
    complete_all(&fixture, &mut first).await;

    let mut restarted = fixture.restart(&master).await.unwrap();
    assert!(plain.split(&mut restarted, 6).await.unwrap().is_empty());

    let overriding = SimpleStepExecutionSplitter::from_mapper(
        fixture.repository(),
        "load",
        Arc::new(TwoFiles {
            partitions_override: true,
        }),
    );
    assert_eq!(overriding.split(&mut restarted, 6).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_splitter_reuses_first_grid_size() {
    let fixture = StepFixture::new("partitioned").await.unwrap();
    let splitter = SimpleStepExecutionSplitter::new(
        fixture.repository(),
        "load",
        Arc::new(SimplePartitioner),
    );

    let mut master = fixture.step_execution("master").await.unwrap();
    assert_eq!(splitter.split(&mut master, 2).await.unwrap().len(), 2);

    let mut restarted = fixture.restart(&master).await.unwrap();
    let again = splitter.split(&mut restarted, 5).await.unwrap();
    assert_eq!(again.len(), 2);
}
