//! Scripted collaborators for testing steps and jobs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::context::ExecutionContext;
use crate::core::ExitStatus;
use crate::domain::{JobExecution, StepExecution};
use crate::errors::{BatchError, BatchResult};
use crate::item::{Chunk, ItemProcessor, ItemReader, ItemRecoverer, ItemStream, ItemWriter, ListItemReader, ListItemWriter};
use crate::job::JobExecutionListener;
use crate::step::{ChunkListener, SkipListener, StepExecutionListener};

/// A scripted failure: `remaining` failures left, or `None` for always.
#[derive(Debug, Clone)]
struct Fault {
    remaining: Option<usize>,
    kind: String,
}

impl Fault {
    /// Consumes one failure if any is left.
    fn trip(&mut self) -> bool {
        match &mut self.remaining {
            None => true,
            Some(0) => false,
            Some(left) => {
                *left -= 1;
                true
            }
        }
    }
}

/// Reads a script of items and read failures.
///
/// A failure entry is consumed like an item, so the next read moves on.
#[derive(Debug)]
pub struct FailingItemReader<T> {
    inner: ListItemReader<BatchResult<T>>,
    skips: AtomicUsize,
}

impl<T> FailingItemReader<T> {
    /// Creates a reader over `script`.
    #[must_use]
    pub fn new(name: impl Into<String>, script: Vec<BatchResult<T>>) -> Self {
        Self {
            inner: ListItemReader::new(name, script),
            skips: AtomicUsize::new(0),
        }
    }

    /// How many times the step told the reader a failed read was skipped.
    pub fn skipped(&self) -> usize {
        self.skips.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: Send + Sync> ItemStream for FailingItemReader<T> {
    async fn restore(&self, ctx: &ExecutionContext) -> BatchResult<()> {
        self.inner.restore(ctx).await
    }

    async fn snapshot(&self, ctx: &mut ExecutionContext) -> BatchResult<()> {
        self.inner.snapshot(ctx).await
    }

    async fn close(&self) -> BatchResult<()> {
        self.inner.close().await
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> ItemReader<T> for FailingItemReader<T> {
    async fn read(&self) -> BatchResult<Option<T>> {
        self.inner.read().await?.transpose()
    }

    async fn skip(&self) -> BatchResult<()> {
        self.skips.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A pass-through processor that fails or filters chosen items.
#[derive(Debug)]
pub struct ScriptedItemProcessor<T> {
    faults: Mutex<HashMap<T, Fault>>,
    filtered: HashSet<T>,
    calls: Mutex<HashMap<T, usize>>,
}

impl<T: Eq + Hash> Default for ScriptedItemProcessor<T> {
    fn default() -> Self {
        Self {
            faults: Mutex::new(HashMap::new()),
            filtered: HashSet::new(),
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Eq + Hash + Clone> ScriptedItemProcessor<T> {
    /// Creates a processor that passes every item through.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails `item` `times` times with an error of `kind`, then succeeds.
    #[must_use]
    pub fn fail_times(self, item: T, times: usize, kind: impl Into<String>) -> Self {
        self.faults.lock().insert(
            item,
            Fault {
                remaining: Some(times),
                kind: kind.into(),
            },
        );
        self
    }

    /// Fails `item` on every attempt.
    #[must_use]
    pub fn fail_always(self, item: T, kind: impl Into<String>) -> Self {
        self.faults.lock().insert(
            item,
            Fault {
                remaining: None,
                kind: kind.into(),
            },
        );
        self
    }

    /// Filters `item` out.
    #[must_use]
    pub fn filter(mut self, item: T) -> Self {
        self.filtered.insert(item);
        self
    }

    /// Number of times `item` was processed.
    #[must_use]
    pub fn calls_for(&self, item: &T) -> usize {
        self.calls.lock().get(item).copied().unwrap_or(0)
    }
}

#[async_trait]
impl<T> ItemProcessor<T, T> for ScriptedItemProcessor<T>
where
    T: Debug + Eq + Hash + Clone + Send + Sync + 'static,
{
    async fn process(&self, item: T) -> BatchResult<Option<T>> {
        *self.calls.lock().entry(item.clone()).or_insert(0) += 1;

        if let Some(fault) = self.faults.lock().get_mut(&item) {
            if fault.trip() {
                return Err(BatchError::item(
                    fault.kind.clone(),
                    format!("processing {item:?} failed"),
                ));
            }
        }
        if self.filtered.contains(&item) {
            return Ok(None);
        }
        Ok(Some(item))
    }
}

/// Collects written chunks, failing any chunk that contains a chosen item.
#[derive(Debug)]
pub struct ScriptedItemWriter<T> {
    inner: ListItemWriter<T>,
    faults: Mutex<HashMap<T, Fault>>,
    attempts: AtomicUsize,
}

impl<T: Eq + Hash> Default for ScriptedItemWriter<T> {
    fn default() -> Self {
        Self {
            inner: ListItemWriter::new(),
            faults: Mutex::new(HashMap::new()),
            attempts: AtomicUsize::new(0),
        }
    }
}

impl<T: Eq + Hash + Clone> ScriptedItemWriter<T> {
    /// Creates a writer that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the first `times` writes containing `item`.
    #[must_use]
    pub fn fail_times(self, item: T, times: usize, kind: impl Into<String>) -> Self {
        self.faults.lock().insert(
            item,
            Fault {
                remaining: Some(times),
                kind: kind.into(),
            },
        );
        self
    }

    /// Fails every write containing `item`.
    #[must_use]
    pub fn fail_always(self, item: T, kind: impl Into<String>) -> Self {
        self.faults.lock().insert(
            item,
            Fault {
                remaining: None,
                kind: kind.into(),
            },
        );
        self
    }

    /// Items written by successful writes, in order.
    #[must_use]
    pub fn written(&self) -> Vec<T> {
        self.inner.written()
    }

    /// Sizes of the successful writes.
    #[must_use]
    pub fn chunk_sizes(&self) -> Vec<usize> {
        self.inner.chunk_sizes()
    }

    /// Number of write calls, failed ones included.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: Send + Sync> ItemStream for ScriptedItemWriter<T> {}

#[async_trait]
impl<T> ItemWriter<T> for ScriptedItemWriter<T>
where
    T: Debug + Eq + Hash + Clone + Send + Sync + 'static,
{
    async fn write(&self, chunk: &Chunk<T>) -> BatchResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failure = {
            let mut faults = self.faults.lock();
            chunk.iter().find_map(|item| {
                let fault = faults.get_mut(item)?;
                fault
                    .trip()
                    .then(|| BatchError::item(fault.kind.clone(), format!("writing {item:?} failed")))
            })
        };
        match failure {
            Some(err) => Err(err),
            None => self.inner.write(chunk).await,
        }
    }
}

/// Records skip callbacks as `read`, `process:<item>` and `write:<item>`.
#[derive(Debug, Default)]
pub struct RecordingSkipListener {
    events: Mutex<Vec<String>>,
}

impl RecordingSkipListener {
    /// Creates the listener.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded events in order.
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl<I: Debug, O: Debug> SkipListener<I, O> for RecordingSkipListener {
    fn on_skip_in_read(&self, _error: &BatchError) {
        self.events.lock().push("read".to_string());
    }

    fn on_skip_in_process(&self, item: &I, _error: &BatchError) {
        self.events.lock().push(format!("process:{item:?}"));
    }

    fn on_skip_in_write(&self, item: &O, _error: &BatchError) {
        self.events.lock().push(format!("write:{item:?}"));
    }
}

/// Records the items it recovers.
#[derive(Debug)]
pub struct RecordingRecoverer {
    handled: bool,
    recovered: Mutex<Vec<String>>,
}

impl RecordingRecoverer {
    /// Creates a recoverer that reports every item as `handled`.
    #[must_use]
    pub fn new(handled: bool) -> Self {
        Self {
            handled,
            recovered: Mutex::new(Vec::new()),
        }
    }

    /// Debug renderings of the recovered items.
    #[must_use]
    pub fn recovered(&self) -> Vec<String> {
        self.recovered.lock().clone()
    }
}

#[async_trait]
impl<I: Debug + Sync> ItemRecoverer<I> for RecordingRecoverer {
    async fn recover(&self, item: &I, _cause: &BatchError) -> BatchResult<bool> {
        self.recovered.lock().push(format!("{item:?}"));
        Ok(self.handled)
    }
}

/// Counts lifecycle callbacks of jobs, steps and chunks.
#[derive(Debug, Default)]
pub struct CountingListener {
    before_job: AtomicUsize,
    after_job: AtomicUsize,
    before_step: AtomicUsize,
    after_step: AtomicUsize,
    after_chunk: AtomicUsize,
    chunk_errors: AtomicUsize,
}

impl CountingListener {
    /// Creates the listener.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs started.
    #[must_use]
    pub fn before_job_count(&self) -> usize {
        self.before_job.load(Ordering::SeqCst)
    }

    /// Jobs finished.
    #[must_use]
    pub fn after_job_count(&self) -> usize {
        self.after_job.load(Ordering::SeqCst)
    }

    /// Steps started.
    #[must_use]
    pub fn before_step_count(&self) -> usize {
        self.before_step.load(Ordering::SeqCst)
    }

    /// Steps finished.
    #[must_use]
    pub fn after_step_count(&self) -> usize {
        self.after_step.load(Ordering::SeqCst)
    }

    /// Chunks committed.
    #[must_use]
    pub fn after_chunk_count(&self) -> usize {
        self.after_chunk.load(Ordering::SeqCst)
    }

    /// Chunks rolled back.
    #[must_use]
    pub fn chunk_error_count(&self) -> usize {
        self.chunk_errors.load(Ordering::SeqCst)
    }
}

impl JobExecutionListener for CountingListener {
    fn before_job(&self, _execution: &JobExecution) {
        self.before_job.fetch_add(1, Ordering::SeqCst);
    }

    fn after_job(&self, _execution: &JobExecution) {
        self.after_job.fetch_add(1, Ordering::SeqCst);
    }
}

impl StepExecutionListener for CountingListener {
    fn before_step(&self, _execution: &StepExecution) {
        self.before_step.fetch_add(1, Ordering::SeqCst);
    }

    fn after_step(&self, _execution: &StepExecution) -> Option<ExitStatus> {
        self.after_step.fetch_add(1, Ordering::SeqCst);
        None
    }
}

impl ChunkListener for CountingListener {
    fn after_chunk(&self, _execution: &StepExecution) {
        self.after_chunk.fetch_add(1, Ordering::SeqCst);
    }

    fn after_chunk_error(&self, _execution: &StepExecution, _error: &BatchError) {
        self.chunk_errors.fetch_add(1, Ordering::SeqCst);
    }
}

/// Requests a stop once the step has committed a number of chunks.
#[derive(Debug)]
pub struct StopAfterCommits {
    commits: usize,
}

impl StopAfterCommits {
    /// Stops after `commits` commits.
    #[must_use]
    pub fn new(commits: usize) -> Self {
        Self { commits }
    }
}

impl ChunkListener for StopAfterCommits {
    fn after_chunk(&self, execution: &StepExecution) {
        if execution.commit_count >= self.commits {
            execution
                .stop_token()
                .cancel(format!("stop after {} commits", self.commits));
        }
    }
}
