//! The chunk-oriented step.
//!
//! Each iteration of the step loop reads one chunk (outside any
//! transaction), then processes and writes it inside one transaction.
//! Processing and writing go through stateful retry keyed by item, so a
//! rolled-back chunk is re-driven with the same inputs and each item keeps
//! its retry count across rollbacks. Items that exhaust their retries are
//! recovered or skipped; a skippable write failure switches the chunk to
//! scan mode, where every item is written in its own transaction so the
//! poison item can be isolated.

use super::{
    execute_step, ChunkListener, ItemListener, SkipListener, SkipPolicy, Step, StepBody,
    StepSettings, TransactionManager, Transaction,
};
use crate::classify::Classifier;
use crate::context::ExecutionContext;
use crate::core::RepeatStatus;
use crate::domain::{StepContribution, StepExecution};
use crate::errors::{BatchError, BatchResult};
use crate::item::{Chunk, ItemProcessor, ItemReader, ItemRecoverer, ItemWriter};
use crate::repeat::{CompletionPolicy, RepeatCallback, RepeatContext, RepeatTemplate};
use crate::retry::{RecoveryCallback, RetryCallback, RetryContext, RetryState, RetryTemplate};
use async_trait::async_trait;
use std::fmt::{self, Debug};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Derives the retry correlation key of an item.
pub type KeyGenerator<I> = Arc<dyn Fn(&I) -> String + Send + Sync>;

/// A step that reads, processes and writes items in chunks.
///
/// Build one with [`StepBuilder`](super::StepBuilder).
pub struct ChunkOrientedStep<I, O> {
    pub(super) settings: StepSettings,
    pub(super) reader: Arc<dyn ItemReader<I>>,
    pub(super) processor: Arc<dyn ItemProcessor<I, O>>,
    pub(super) writer: Arc<dyn ItemWriter<O>>,
    pub(super) chunk_policy: Arc<dyn CompletionPolicy>,
    pub(super) transaction_manager: Arc<dyn TransactionManager>,
    pub(super) retry_template: RetryTemplate,
    pub(super) rollback_classifier: Arc<dyn Classifier<bool>>,
    pub(super) skip_policy: Arc<dyn SkipPolicy>,
    pub(super) recoverer: Option<Arc<dyn ItemRecoverer<I>>>,
    pub(super) key_generator: KeyGenerator<I>,
    pub(super) chunk_listeners: Vec<Arc<dyn ChunkListener>>,
    pub(super) item_listeners: Vec<Arc<dyn ItemListener<I, O>>>,
    pub(super) skip_listeners: Vec<Arc<dyn SkipListener<I, O>>>,
}

impl<I, O> Debug for ChunkOrientedStep<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkOrientedStep")
            .field("settings", &self.settings)
            .field("chunk_policy", &self.chunk_policy)
            .field("transaction_manager", &self.transaction_manager)
            .field("retry_template", &self.retry_template)
            .field("skip_policy", &self.skip_policy)
            .field("recoverer", &self.recoverer.is_some())
            .finish_non_exhaustive()
    }
}

/// Inputs of a chunk that has been read but not yet committed.
///
/// Read, process-skip and recover counts live here rather than in the
/// contribution: they are not repeated when a rolled-back chunk is
/// re-driven, so they have to survive the rollback.
#[derive(Debug)]
struct PendingChunk<I> {
    inputs: Chunk<I>,
    reads: usize,
    read_skips: usize,
    process_skips: usize,
    recovered: usize,
    scanning: bool,
}

impl<I> PendingChunk<I> {
    fn contribution(&self, execution: &StepExecution) -> StepContribution {
        let mut contribution = execution.create_contribution();
        contribution.read_count = self.reads;
        contribution.read_skip_count = self.read_skips;
        contribution.process_skip_count = self.process_skips;
        contribution.recover_count = self.recovered;
        contribution
    }

    fn committed(&mut self) {
        self.reads = 0;
        self.read_skips = 0;
        self.process_skips = 0;
        self.recovered = 0;
    }
}

/// Drops an item the recoverer took care of. Skip listeners are not told.
fn record_recovery<I>(
    pending: &mut PendingChunk<I>,
    contribution: &mut StepContribution,
    index: usize,
) {
    contribution.increment_recover_count();
    pending.recovered += 1;
    pending.inputs.remove(index);
}

/// Result of one transactional attempt at a chunk.
enum Attempt {
    Commit,
    Rollback(BatchError),
}

/// Result of processing one item.
enum Processed<O> {
    Output(O),
    Filtered,
    Skipped(BatchError),
    Recovered,
    Rollback(BatchError),
}

/// What a stateful retry call produced.
enum ItemAttempt<T> {
    Done(T),
    Exhausted { attempts: usize, cause: BatchError },
}

/// What to do after an attempt failed and rolled back.
enum Redrive {
    Retry,
    Exhausted,
    Fatal,
}

impl<I, O> ChunkOrientedStep<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    /// Lifecycle settings.
    #[must_use]
    pub fn settings(&self) -> &StepSettings {
        &self.settings
    }

    /// The retry template items are processed and written with.
    #[must_use]
    pub fn retry_template(&self) -> &RetryTemplate {
        &self.retry_template
    }

    fn process_key(&self, item: &I) -> String {
        format!("{}:process:{}", self.settings.name(), (self.key_generator)(item))
    }

    async fn read_chunk(&self, execution: &StepExecution) -> BatchResult<PendingChunk<I>> {
        let mut contribution = execution.create_contribution();
        let mut inputs = Chunk::new();
        let template =
            RepeatTemplate::new().with_completion_policy(Arc::clone(&self.chunk_policy));

        let mut reader = ChunkReader {
            step: self,
            chunk: &mut inputs,
            contribution: &mut contribution,
        };
        template.iterate(&mut reader).await?;

        Ok(PendingChunk {
            inputs,
            reads: contribution.read_count,
            read_skips: contribution.read_skip_count,
            process_skips: 0,
            recovered: 0,
            scanning: false,
        })
    }

    async fn read_item(
        &self,
        chunk: &mut Chunk<I>,
        contribution: &mut StepContribution,
    ) -> BatchResult<Option<I>> {
        loop {
            for listener in &self.item_listeners {
                listener.before_read();
            }
            match self.reader.read().await {
                Ok(Some(item)) => {
                    contribution.increment_read_count();
                    for listener in &self.item_listeners {
                        listener.after_read(&item);
                    }
                    return Ok(Some(item));
                }
                Ok(None) => return Ok(None),
                Err(err) => {
                    for listener in &self.item_listeners {
                        listener.on_read_error(&err);
                    }
                    if !self.skip_policy.should_skip(&err, contribution.step_skip_count())? {
                        return Err(err);
                    }
                    warn!(step = %self.settings.name(), error = %err, "Skipping failed read");
                    contribution.increment_read_skip_count();
                    for listener in &self.skip_listeners {
                        listener.on_skip_in_read(&err);
                    }
                    chunk.skip_read(err);
                    self.reader.skip().await?;
                }
            }
        }
    }

    async fn process_and_write(
        &self,
        pending: &mut PendingChunk<I>,
        contribution: &mut StepContribution,
    ) -> BatchResult<Attempt> {
        let mut outputs = Chunk::new();
        let mut keys = Vec::new();
        let mut index = 0;

        while index < pending.inputs.len() {
            let item = pending.inputs.items()[index].clone();
            let key = self.process_key(&item);
            match self
                .process_item(&item, &key, contribution.step_skip_count())
                .await?
            {
                Processed::Output(output) => {
                    outputs.add(output);
                    keys.push(key);
                    index += 1;
                }
                Processed::Filtered => {
                    contribution.increment_filter_count();
                    index += 1;
                }
                Processed::Skipped(err) => {
                    self.record_process_skip(pending, contribution, index, err);
                }
                Processed::Recovered => record_recovery(pending, contribution, index),
                Processed::Rollback(err) => return Ok(Attempt::Rollback(err)),
            }
        }

        if outputs.is_empty() {
            return Ok(Attempt::Commit);
        }
        self.write_chunk(&outputs, &keys, pending, contribution).await
    }

    async fn process_item(&self, item: &I, key: &str, skip_count: usize) -> BatchResult<Processed<O>> {
        let state =
            RetryState::new(key).with_rollback_classifier(Arc::clone(&self.rollback_classifier));
        let mut callback = ProcessCallback { step: self, item };
        let mut recovery = ExhaustedRecovery;

        let outcome = self
            .retry_template
            .execute_stateful(&mut callback, Some(&mut recovery), &state)
            .await;

        match outcome {
            Ok(ItemAttempt::Done(Some(output))) => Ok(Processed::Output(output)),
            Ok(ItemAttempt::Done(None)) => Ok(Processed::Filtered),
            Ok(ItemAttempt::Exhausted { attempts, cause }) => {
                if let Some(recoverer) = &self.recoverer {
                    if recoverer.recover(item, &cause).await? {
                        info!(step = %self.settings.name(), key, "Recovered item after retries were exhausted");
                        return Ok(Processed::Recovered);
                    }
                }
                if self.skip_policy.should_skip(&cause, skip_count)? {
                    warn!(step = %self.settings.name(), key, error = %cause, "Skipping item after failed process");
                    Ok(Processed::Skipped(cause))
                } else {
                    Err(BatchError::RetryExhausted {
                        attempts,
                        cause: Box::new(cause),
                    })
                }
            }
            Err(err) => match self.after_rollback(key, &err, self.recoverer.is_some(), skip_count)? {
                Redrive::Retry | Redrive::Exhausted => Ok(Processed::Rollback(err)),
                Redrive::Fatal => Err(err),
            },
        }
    }

    fn record_process_skip(
        &self,
        pending: &mut PendingChunk<I>,
        contribution: &mut StepContribution,
        index: usize,
        err: BatchError,
    ) {
        contribution.increment_process_skip_count();
        pending.process_skips += 1;
        if let Some(item) = pending.inputs.remove(index) {
            for listener in &self.skip_listeners {
                listener.on_skip_in_process(&item, &err);
            }
            pending.inputs.skip_item(item, err);
        }
    }

    async fn write_chunk(
        &self,
        outputs: &Chunk<O>,
        keys: &[String],
        pending: &mut PendingChunk<I>,
        contribution: &mut StepContribution,
    ) -> BatchResult<Attempt> {
        let key = format!("{}:write:{}", self.settings.name(), keys.join("|"));
        let state =
            RetryState::new(&key).with_rollback_classifier(Arc::clone(&self.rollback_classifier));
        let mut callback = WriteCallback {
            step: self,
            items: outputs,
        };
        let mut recovery = ExhaustedRecovery;
        let skip_count = contribution.step_skip_count();

        let outcome = self
            .retry_template
            .execute_stateful(&mut callback, Some(&mut recovery), &state)
            .await;

        match outcome {
            Ok(ItemAttempt::Done(())) => {
                contribution.increment_write_count(outputs.len());
                Ok(Attempt::Commit)
            }
            Ok(ItemAttempt::Exhausted { attempts, cause }) => {
                if self.skip_policy.should_skip(&cause, skip_count)? {
                    debug!(step = %self.settings.name(), "Write retries exhausted, scanning chunk");
                    pending.scanning = true;
                    Ok(Attempt::Rollback(cause))
                } else {
                    Err(BatchError::RetryExhausted {
                        attempts,
                        cause: Box::new(cause),
                    })
                }
            }
            Err(err) => match self.after_rollback(&key, &err, false, skip_count)? {
                Redrive::Retry => Ok(Attempt::Rollback(err)),
                Redrive::Exhausted => {
                    debug!(step = %self.settings.name(), "Write failed for good, scanning chunk");
                    self.retry_template.cache().remove(&key);
                    pending.scanning = true;
                    Ok(Attempt::Rollback(err))
                }
                Redrive::Fatal => Err(err),
            },
        }
    }

    /// Handles the first remaining item of a chunk in scan mode.
    async fn scan(
        &self,
        pending: &mut PendingChunk<I>,
        contribution: &mut StepContribution,
    ) -> BatchResult<Attempt> {
        let Some(item) = pending.inputs.items().first().cloned() else {
            return Ok(Attempt::Commit);
        };
        let key = self.process_key(&item);

        let output = match self
            .process_item(&item, &key, contribution.step_skip_count())
            .await?
        {
            Processed::Output(output) => output,
            Processed::Filtered => {
                contribution.increment_filter_count();
                pending.inputs.remove(0);
                return Ok(Attempt::Commit);
            }
            Processed::Skipped(err) => {
                self.record_process_skip(pending, contribution, 0, err);
                return Ok(Attempt::Commit);
            }
            Processed::Recovered => {
                record_recovery(pending, contribution, 0);
                return Ok(Attempt::Commit);
            }
            Processed::Rollback(err) => return Ok(Attempt::Rollback(err)),
        };

        let single = Chunk::from(vec![output]);
        for listener in &self.item_listeners {
            listener.before_write(&single);
        }
        match self.writer.write(&single).await {
            Ok(()) => {
                for listener in &self.item_listeners {
                    listener.after_write(&single);
                }
                contribution.increment_write_count(1);
            }
            Err(err) => {
                for listener in &self.item_listeners {
                    listener.on_write_error(&err, &single);
                }
                if !self.skip_policy.should_skip(&err, contribution.step_skip_count())? {
                    return Err(err);
                }
                warn!(step = %self.settings.name(), error = %err, "Skipping item after failed write");
                contribution.increment_write_skip_count();
                for written in &single {
                    for listener in &self.skip_listeners {
                        listener.on_skip_in_write(written, &err);
                    }
                }
            }
        }

        pending.inputs.remove(0);
        Ok(Attempt::Commit)
    }

    fn after_rollback(
        &self,
        key: &str,
        err: &BatchError,
        recoverable: bool,
        skip_count: usize,
    ) -> BatchResult<Redrive> {
        let cache = self.retry_template.cache();
        let Some(ctx) = cache.get(key) else {
            return Ok(Redrive::Fatal);
        };
        if !ctx.is_exhausted_only() && self.retry_template.retry_policy().can_retry(&ctx) {
            return Ok(Redrive::Retry);
        }
        if recoverable {
            return Ok(Redrive::Exhausted);
        }

        let skippable = match self.skip_policy.should_skip(err, skip_count) {
            Ok(skippable) => skippable,
            Err(limit) => {
                cache.remove(key);
                return Err(limit);
            }
        };
        if skippable {
            Ok(Redrive::Exhausted)
        } else {
            cache.remove(key);
            Ok(Redrive::Fatal)
        }
    }

    async fn commit(
        &self,
        tx: Transaction,
        execution: &mut StepExecution,
        contribution: &StepContribution,
        checkpoint: bool,
    ) -> BatchResult<()> {
        if checkpoint {
            if let Err(err) = self.snapshot_streams(&mut execution.execution_context).await {
                self.rollback(tx, execution, &err).await?;
                return Err(err);
            }
        }

        self.transaction_manager.commit(tx).await?;
        execution.apply(contribution);
        execution.commit_count += 1;
        debug!(
            step = %self.settings.name(),
            commit_count = execution.commit_count,
            write_count = contribution.write_count,
            "Chunk committed"
        );

        for listener in &self.chunk_listeners {
            listener.after_chunk(execution);
        }

        let repository = self.settings.repository();
        repository.update_execution_context(execution).await?;
        repository.update_step_execution(execution).await
    }

    async fn rollback(
        &self,
        tx: Transaction,
        execution: &mut StepExecution,
        err: &BatchError,
    ) -> BatchResult<()> {
        self.transaction_manager.rollback(tx).await?;
        execution.rollback_count += 1;
        debug!(
            step = %self.settings.name(),
            rollback_count = execution.rollback_count,
            error = %err,
            "Chunk rolled back"
        );
        for listener in &self.chunk_listeners {
            listener.after_chunk_error(execution, err);
        }
        Ok(())
    }

    async fn snapshot_streams(&self, ctx: &mut ExecutionContext) -> BatchResult<()> {
        self.reader.snapshot(ctx).await?;
        self.writer.snapshot(ctx).await
    }
}

struct ChunkReader<'a, I, O> {
    step: &'a ChunkOrientedStep<I, O>,
    chunk: &'a mut Chunk<I>,
    contribution: &'a mut StepContribution,
}

#[async_trait]
impl<'a, I, O> RepeatCallback for ChunkReader<'a, I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    async fn do_in_iteration(&mut self, _ctx: &Arc<RepeatContext>) -> BatchResult<RepeatStatus> {
        match self.step.read_item(self.chunk, self.contribution).await? {
            Some(item) => {
                self.chunk.add(item);
                Ok(RepeatStatus::Continuable)
            }
            None => {
                self.chunk.set_end();
                Ok(RepeatStatus::Finished)
            }
        }
    }
}

struct ChunkLoop<'a, I, O> {
    step: &'a ChunkOrientedStep<I, O>,
    execution: &'a mut StepExecution,
    pending: Option<PendingChunk<I>>,
}

#[async_trait]
impl<'a, I, O> RepeatCallback for ChunkLoop<'a, I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    async fn do_in_iteration(&mut self, _ctx: &Arc<RepeatContext>) -> BatchResult<RepeatStatus> {
        let step = self.step;
        let mut pending = match self.pending.take() {
            Some(pending) => pending,
            None => {
                if self.execution.should_stop() {
                    let reason = self
                        .execution
                        .stop_token()
                        .reason()
                        .unwrap_or_else(|| "step was asked to terminate".to_string());
                    return Err(BatchError::Interrupted(reason));
                }
                step.read_chunk(self.execution).await?
            }
        };

        let tx = step.transaction_manager.begin().await?;
        for listener in &step.chunk_listeners {
            listener.before_chunk(self.execution);
        }

        let mut contribution = pending.contribution(self.execution);
        let attempt = if pending.scanning {
            step.scan(&mut pending, &mut contribution).await
        } else {
            step.process_and_write(&mut pending, &mut contribution).await
        };

        match attempt {
            Ok(Attempt::Commit) => {
                let unfinished = pending.scanning && !pending.inputs.is_empty();
                step.commit(tx, self.execution, &contribution, !unfinished)
                    .await?;
                pending.committed();
                if unfinished {
                    self.pending = Some(pending);
                    return Ok(RepeatStatus::Continuable);
                }
                Ok(RepeatStatus::continue_if(!pending.inputs.is_end()))
            }
            Ok(Attempt::Rollback(err)) => {
                step.rollback(tx, self.execution, &err).await?;
                self.pending = Some(pending);
                Ok(RepeatStatus::Continuable)
            }
            Err(err) => {
                step.rollback(tx, self.execution, &err).await?;
                Err(err)
            }
        }
    }
}

struct ProcessCallback<'a, I, O> {
    step: &'a ChunkOrientedStep<I, O>,
    item: &'a I,
}

#[async_trait]
impl<'a, I, O> RetryCallback<ItemAttempt<Option<O>>> for ProcessCallback<'a, I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    async fn do_with_retry(&mut self, _ctx: &Arc<RetryContext>) -> BatchResult<ItemAttempt<Option<O>>> {
        for listener in &self.step.item_listeners {
            listener.before_process(self.item);
        }
        match self.step.processor.process(self.item.clone()).await {
            Ok(result) => {
                for listener in &self.step.item_listeners {
                    listener.after_process(self.item, result.as_ref());
                }
                Ok(ItemAttempt::Done(result))
            }
            Err(err) => {
                for listener in &self.step.item_listeners {
                    listener.on_process_error(self.item, &err);
                }
                Err(err)
            }
        }
    }
}

struct WriteCallback<'a, I, O> {
    step: &'a ChunkOrientedStep<I, O>,
    items: &'a Chunk<O>,
}

#[async_trait]
impl<'a, I, O> RetryCallback<ItemAttempt<()>> for WriteCallback<'a, I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    async fn do_with_retry(&mut self, _ctx: &Arc<RetryContext>) -> BatchResult<ItemAttempt<()>> {
        for listener in &self.step.item_listeners {
            listener.before_write(self.items);
        }
        match self.step.writer.write(self.items).await {
            Ok(()) => {
                for listener in &self.step.item_listeners {
                    listener.after_write(self.items);
                }
                Ok(ItemAttempt::Done(()))
            }
            Err(err) => {
                for listener in &self.step.item_listeners {
                    listener.on_write_error(&err, self.items);
                }
                Err(err)
            }
        }
    }
}

/// Hands the exhausted failure back to the step, which decides between
/// recovery, skip and failure.
struct ExhaustedRecovery;

#[async_trait]
impl<T: Send + 'static> RecoveryCallback<ItemAttempt<T>> for ExhaustedRecovery {
    async fn recover(&mut self, ctx: &Arc<RetryContext>) -> BatchResult<ItemAttempt<T>> {
        let cause = ctx.last_error().unwrap_or_else(|| {
            BatchError::IllegalState("retry exhausted without a recorded error".to_string())
        });
        Ok(ItemAttempt::Exhausted {
            attempts: ctx.attempt_count(),
            cause,
        })
    }
}

#[async_trait]
impl<I, O> StepBody for ChunkOrientedStep<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    async fn open(&self, ctx: &ExecutionContext) -> BatchResult<()> {
        self.reader.restore(ctx).await?;
        self.writer.restore(ctx).await
    }

    async fn do_execute(&self, execution: &mut StepExecution) -> BatchResult<()> {
        let mut chunk_loop = ChunkLoop {
            step: self,
            execution,
            pending: None,
        };
        RepeatTemplate::new().iterate(&mut chunk_loop).await?;
        Ok(())
    }

    async fn close(&self) -> BatchResult<()> {
        let reader = self.reader.close().await;
        let writer = self.writer.close().await;
        reader.and(writer)
    }
}

#[async_trait]
impl<I, O> Step for ChunkOrientedStep<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
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
