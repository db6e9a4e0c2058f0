//! Scenario tests for the chunk-oriented step.

use super::*;
use crate::config::StepConfig;
use crate::core::BatchStatus;
use crate::errors::BatchError;
use crate::item::{FnItemProcessor, ListItemReader};
use crate::testing::{
    assert_step_counts, assert_step_status, numbers, CountingListener, FailingItemReader,
    RecordingRecoverer, RecordingSkipListener, ScriptedItemProcessor, ScriptedItemWriter,
    StepFixture, StopAfterCommits,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn builder(fixture: &StepFixture, items: Vec<u32>) -> StepBuilder<u32, u32> {
    StepBuilder::<u32, u32>::new("numbers")
        .with_repository(fixture.repository())
        .with_reader(Arc::new(ListItemReader::new("numbers", items)))
}

#[tokio::test]
async fn test_retry_within_chunk_completes() {
    let fixture = StepFixture::new("retry").await.unwrap();
    let processor = Arc::new(ScriptedItemProcessor::<u32>::new().fail_times(7, 2, "transient"));
    let writer = Arc::new(ScriptedItemWriter::<u32>::new());
    let listener = Arc::new(CountingListener::new());

    let step = builder(&fixture, numbers(10))
        .with_processor(processor.clone())
        .with_writer(writer.clone())
        .with_config(&StepConfig::new().with_commit_interval(3).with_retry(3, ["transient"]))
        .with_listener(listener.clone())
        .with_chunk_listener(listener.clone())
        .build()
        .unwrap();

    let mut execution = fixture.step_execution("numbers").await.unwrap();
    step.execute(&mut execution).await.unwrap();

    assert_step_status(&execution, BatchStatus::Completed, "COMPLETED");
    assert_step_counts(&execution, 10, 10, 0);
    assert_eq!(writer.chunk_sizes(), vec![3, 3, 3, 1]);
    assert_eq!(writer.written(), numbers(10));
    assert_eq!(execution.commit_count, 4);
    assert_eq!(execution.rollback_count, 2);
    assert_eq!(processor.calls_for(&7), 3);
    assert_eq!(processor.calls_for(&8), 1);

    assert_eq!(listener.before_step_count(), 1);
    assert_eq!(listener.after_step_count(), 1);
    assert_eq!(listener.after_chunk_count(), 4);
    assert_eq!(listener.chunk_error_count(), 2);
    assert!(step.retry_template().cache().get("numbers:process:7").is_none());
}

#[tokio::test]
async fn test_skips_up_to_the_limit() {
    let fixture = StepFixture::new("skip").await.unwrap();
    let processor = ScriptedItemProcessor::<u32>::new()
        .fail_always(2, "poison")
        .fail_always(5, "poison")
        .fail_always(8, "poison");
    let writer = Arc::new(ScriptedItemWriter::<u32>::new());
    let skips = Arc::new(RecordingSkipListener::new());

    let step = builder(&fixture, numbers(10))
        .with_processor(Arc::new(processor))
        .with_writer(writer.clone())
        .with_config(&StepConfig::new().with_commit_interval(2).with_skip(3, ["poison"]))
        .with_skip_listener(skips.clone())
        .build()
        .unwrap();

    let mut execution = fixture.step_execution("numbers").await.unwrap();
    step.execute(&mut execution).await.unwrap();

    assert_step_status(&execution, BatchStatus::Completed, "COMPLETED");
    assert_step_counts(&execution, 10, 7, 3);
    assert_eq!(execution.process_skip_count, 3);
    assert_eq!(writer.written(), vec![1, 3, 4, 6, 7, 9, 10]);
    assert_eq!(skips.events(), vec!["process:2", "process:5", "process:8"]);
}

#[tokio::test]
async fn test_one_skip_past_the_limit_fails() {
    let fixture = StepFixture::new("skip-limit").await.unwrap();
    let processor = ScriptedItemProcessor::<u32>::new()
        .fail_always(2, "poison")
        .fail_always(5, "poison")
        .fail_always(8, "poison");
    let writer = Arc::new(ScriptedItemWriter::<u32>::new());

    let step = builder(&fixture, numbers(10))
        .with_processor(Arc::new(processor))
        .with_writer(writer.clone())
        .with_config(&StepConfig::new().with_commit_interval(2).with_skip(2, ["poison"]))
        .build()
        .unwrap();

    let mut execution = fixture.step_execution("numbers").await.unwrap();
    step.execute(&mut execution).await.unwrap();

    assert_step_status(&execution, BatchStatus::Failed, "FAILED");
    assert_eq!(execution.process_skip_count, 2);
    assert_eq!(writer.written(), vec![1, 3, 4, 6]);
    assert!(execution
        .failures
        .iter()
        .any(|failure| failure.error.contains("Skip limit of 2 exceeded")));
}

#[tokio::test]
async fn test_failed_chunk_is_rewritten_whole_on_restart() {
    let fixture = StepFixture::new("atomic").await.unwrap();
    let writer = Arc::new(ScriptedItemWriter::<u32>::new().fail_times(5, 1, "io"));
    let step = builder(&fixture, numbers(9))
        .without_processor()
        .with_writer(writer.clone())
        .with_commit_interval(3)
        .build()
        .unwrap();

    let mut first = fixture.step_execution("numbers").await.unwrap();
    step.execute(&mut first).await.unwrap();

    assert_step_status(&first, BatchStatus::Failed, "FAILED");
    assert_eq!(writer.written(), vec![1, 2, 3]);
    assert_eq!(first.commit_count, 1);
    assert_eq!(first.rollback_count, 1);
    assert_eq!(first.execution_context.get_long("numbers.read.count"), Some(3));

    let mut second = fixture.restart(&first).await.unwrap();
    step.execute(&mut second).await.unwrap();

    assert_step_status(&second, BatchStatus::Completed, "COMPLETED");
    assert_step_counts(&second, 6, 6, 0);
    assert_eq!(writer.written(), numbers(9));
    assert_eq!(writer.chunk_sizes(), vec![3, 3, 3]);
}

#[tokio::test]
async fn test_restart_of_finished_checkpoint_reads_nothing() {
    let fixture = StepFixture::new("idempotent").await.unwrap();
    let writer = Arc::new(ScriptedItemWriter::<u32>::new());
    let step = builder(&fixture, numbers(4))
        .without_processor()
        .with_writer(writer.clone())
        .with_commit_interval(2)
        .build()
        .unwrap();

    let mut first = fixture.step_execution("numbers").await.unwrap();
    step.execute(&mut first).await.unwrap();
    let mut second = fixture.restart(&first).await.unwrap();
    step.execute(&mut second).await.unwrap();

    assert_step_counts(&second, 0, 0, 0);
    assert_eq!(second.execution_context, first.execution_context);
    assert_eq!(writer.written(), numbers(4));
}

#[tokio::test]
async fn test_filtered_items_are_counted_not_written() {
    let fixture = StepFixture::new("filter").await.unwrap();
    let writer = Arc::new(ScriptedItemWriter::<u32>::new());
    let step = builder(&fixture, numbers(6))
        .with_processor(Arc::new(FnItemProcessor::new(|n: u32| async move {
            Ok::<_, BatchError>((n % 2 == 1).then_some(n * 10))
        })))
        .with_writer(writer.clone())
        .with_commit_interval(3)
        .build()
        .unwrap();

    let mut execution = fixture.step_execution("numbers").await.unwrap();
    step.execute(&mut execution).await.unwrap();

    assert_step_status(&execution, BatchStatus::Completed, "COMPLETED");
    assert_eq!(execution.filter_count, 3);
    assert_eq!(writer.written(), vec![10, 30, 50]);
}

#[tokio::test]
async fn test_write_failure_is_isolated_by_scanning() {
    let fixture = StepFixture::new("scan").await.unwrap();
    let writer = Arc::new(ScriptedItemWriter::<u32>::new().fail_always(5, "poison"));
    let skips = Arc::new(RecordingSkipListener::new());
    let step = builder(&fixture, numbers(6))
        .without_processor()
        .with_writer(writer.clone())
        .with_config(&StepConfig::new().with_commit_interval(3).with_skip(1, ["poison"]))
        .with_skip_listener(skips.clone())
        .build()
        .unwrap();

    let mut execution = fixture.step_execution("numbers").await.unwrap();
    step.execute(&mut execution).await.unwrap();

    assert_step_status(&execution, BatchStatus::Completed, "COMPLETED");
    assert_step_counts(&execution, 6, 5, 1);
    assert_eq!(execution.write_skip_count, 1);
    assert_eq!(execution.rollback_count, 1);
    assert_eq!(writer.written(), vec![1, 2, 3, 4, 6]);
    assert_eq!(writer.chunk_sizes(), vec![3, 1, 1]);
    assert_eq!(skips.events(), vec!["write:5"]);
}

#[tokio::test]
async fn test_recoverer_handles_exhausted_item() {
    let fixture = StepFixture::new("recover").await.unwrap();
    let processor = Arc::new(ScriptedItemProcessor::<u32>::new().fail_always(3, "bad"));
    let recoverer = Arc::new(RecordingRecoverer::new(true));
    let writer = Arc::new(ScriptedItemWriter::<u32>::new());
    let step = builder(&fixture, numbers(5))
        .with_processor(processor.clone())
        .with_writer(writer.clone())
        .with_config(&StepConfig::new().with_commit_interval(5).with_retry(2, ["bad"]))
        .with_recoverer(recoverer.clone())
        .build()
        .unwrap();

    let mut execution = fixture.step_execution("numbers").await.unwrap();
    step.execute(&mut execution).await.unwrap();

    assert_step_status(&execution, BatchStatus::Completed, "COMPLETED");
    assert_eq!(writer.written(), vec![1, 2, 4, 5]);
    assert_eq!(processor.calls_for(&3), 2);
    assert_eq!(recoverer.recovered(), vec!["3"]);
    assert_eq!(execution.recover_count, 1);
    assert_eq!(execution.process_skip_count, 0);
    assert_eq!(execution.rollback_count, 2);
}

#[tokio::test]
async fn test_recovered_items_do_not_consume_skip_limit() {
    let fixture = StepFixture::new("recover-limit").await.unwrap();
    let processor = Arc::new(
        ScriptedItemProcessor::<u32>::new()
            .fail_always(2, "bad")
            .fail_always(4, "bad"),
    );
    let recoverer = Arc::new(RecordingRecoverer::new(true));
    let skips = Arc::new(RecordingSkipListener::new());
    let writer = Arc::new(ScriptedItemWriter::<u32>::new());
    let step = builder(&fixture, numbers(5))
        .with_processor(processor.clone())
        .with_writer(writer.clone())
        .with_config(
            &StepConfig::new()
                .with_commit_interval(5)
                .with_retry(2, ["bad"])
                .with_skip(1, ["bad"]),
        )
        .with_recoverer(recoverer.clone())
        .with_skip_listener(skips.clone())
        .build()
        .unwrap();

    let mut execution = fixture.step_execution("numbers").await.unwrap();
    step.execute(&mut execution).await.unwrap();

    assert_step_status(&execution, BatchStatus::Completed, "COMPLETED");
    assert_eq!(recoverer.recovered(), vec!["2", "4"]);
    assert_eq!(writer.written(), vec![1, 3, 5]);
    assert_eq!(execution.recover_count, 2);
    assert_eq!(execution.process_skip_count, 0);
    assert_eq!(execution.skip_count(), 0);
    assert!(skips.events().is_empty());
}

#[tokio::test]
async fn test_exhausted_item_without_skip_fails_step() {
    let fixture = StepFixture::new("exhausted").await.unwrap();
    let processor = Arc::new(ScriptedItemProcessor::<u32>::new().fail_always(2, "transient"));
    let step = builder(&fixture, numbers(3))
        .with_processor(processor.clone())
        .with_writer(Arc::new(ScriptedItemWriter::<u32>::new()))
        .with_config(&StepConfig::new().with_commit_interval(3).with_retry(2, ["transient"]))
        .build()
        .unwrap();

    let mut execution = fixture.step_execution("numbers").await.unwrap();
    step.execute(&mut execution).await.unwrap();

    assert_step_status(&execution, BatchStatus::Failed, "FAILED");
    assert_eq!(processor.calls_for(&2), 2);
    assert_eq!(execution.write_count, 0);
    assert!(step.retry_template().cache().get("numbers:process:2").is_none());
}

#[tokio::test]
async fn test_no_rollback_errors_retry_in_place() {
    let fixture = StepFixture::new("no-rollback").await.unwrap();
    let processor = Arc::new(ScriptedItemProcessor::<u32>::new().fail_times(2, 1, "soft"));
    let writer = Arc::new(ScriptedItemWriter::<u32>::new());
    let step = builder(&fixture, numbers(4))
        .with_processor(processor.clone())
        .with_writer(writer.clone())
        .with_config(
            &StepConfig::new()
                .with_commit_interval(2)
                .with_retry(2, ["soft"])
                .with_no_rollback(["soft"]),
        )
        .build()
        .unwrap();

    let mut execution = fixture.step_execution("numbers").await.unwrap();
    step.execute(&mut execution).await.unwrap();

    assert_step_status(&execution, BatchStatus::Completed, "COMPLETED");
    assert_eq!(execution.rollback_count, 0);
    assert_eq!(processor.calls_for(&2), 2);
    assert_eq!(writer.written(), numbers(4));
}

#[tokio::test]
async fn test_read_failures_are_skipped() {
    let fixture = StepFixture::new("read-skip").await.unwrap();
    let reader = Arc::new(FailingItemReader::<u32>::new(
        "lines",
        vec![
            Ok(1),
            Err(BatchError::item("parse", "line 2 is garbage")),
            Ok(3),
        ],
    ));
    let writer = Arc::new(ScriptedItemWriter::<u32>::new());
    let skips = Arc::new(RecordingSkipListener::new());
    let step = StepBuilder::<u32, u32>::new("lines")
        .with_repository(fixture.repository())
        .with_reader(reader.clone())
        .without_processor()
        .with_writer(writer.clone())
        .with_config(&StepConfig::new().with_commit_interval(5).with_skip(1, ["parse"]))
        .with_skip_listener(skips.clone())
        .build()
        .unwrap();

    let mut execution = fixture.step_execution("lines").await.unwrap();
    step.execute(&mut execution).await.unwrap();

    assert_step_status(&execution, BatchStatus::Completed, "COMPLETED");
    assert_step_counts(&execution, 2, 2, 1);
    assert_eq!(execution.read_skip_count, 1);
    assert_eq!(writer.written(), vec![1, 3]);
    assert_eq!(skips.events(), vec!["read"]);
    assert_eq!(reader.skipped(), 1);
}

#[tokio::test]
async fn test_unskippable_read_failure_fails_step() {
    let fixture = StepFixture::new("read-fail").await.unwrap();
    let reader = FailingItemReader::<u32>::new("lines", vec![Ok(1), Err(BatchError::item("io", "disk gone"))]);
    let step = StepBuilder::<u32, u32>::new("lines")
        .with_repository(fixture.repository())
        .with_reader(Arc::new(reader))
        .without_processor()
        .with_writer(Arc::new(ScriptedItemWriter::<u32>::new()))
        .build()
        .unwrap();

    let mut execution = fixture.step_execution("lines").await.unwrap();
    step.execute(&mut execution).await.unwrap();

    assert_step_status(&execution, BatchStatus::Failed, "FAILED");
    assert_eq!(execution.commit_count, 0);
    assert!(execution.exit_status.exit_description().contains("disk gone"));
}

#[tokio::test]
async fn test_stop_request_ends_step_at_chunk_boundary() {
    let fixture = StepFixture::new("stop").await.unwrap();
    let writer = Arc::new(ScriptedItemWriter::<u32>::new());
    let step = builder(&fixture, numbers(10))
        .without_processor()
        .with_writer(writer.clone())
        .with_commit_interval(2)
        .with_chunk_listener(Arc::new(StopAfterCommits::new(2)))
        .build()
        .unwrap();

    let mut execution = fixture.step_execution("numbers").await.unwrap();
    step.execute(&mut execution).await.unwrap();

    assert_step_status(&execution, BatchStatus::Stopped, "STOPPED");
    assert_eq!(execution.write_count, 4);
    assert_eq!(writer.written(), numbers(4));

    let stored = fixture
        .store()
        .step_executions(fixture.job_execution().id)
        .into_iter()
        .find(|stored| stored.id == execution.id)
        .unwrap();
    assert_eq!(stored.status, BatchStatus::Stopped);
}

#[tokio::test]
async fn test_terminate_only_flag_stops_before_reading() {
    let fixture = StepFixture::new("terminate").await.unwrap();
    let writer = Arc::new(ScriptedItemWriter::<u32>::new());
    let step = builder(&fixture, numbers(3))
        .without_processor()
        .with_writer(writer.clone())
        .build()
        .unwrap();

    let mut execution = fixture.step_execution("numbers").await.unwrap();
    execution.set_terminate_only();
    step.execute(&mut execution).await.unwrap();

    assert_step_status(&execution, BatchStatus::Stopped, "STOPPED");
    assert!(writer.written().is_empty());
}
