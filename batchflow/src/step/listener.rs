//! Step, chunk, item and skip listeners.
//!
//! Each concern is its own trait with no-op defaults; a step is wired with
//! the listeners it needs when it is built.

use crate::core::ExitStatus;
use crate::domain::StepExecution;
use crate::errors::BatchError;
use crate::item::Chunk;

/// Observes the start and end of a step execution.
pub trait StepExecutionListener: Send + Sync {
    /// Called before the step opens its streams.
    fn before_step(&self, _execution: &StepExecution) {}

    /// Called once the step finished; a returned status is ANDed into the
    /// step's exit status.
    fn after_step(&self, _execution: &StepExecution) -> Option<ExitStatus> {
        None
    }
}

/// Observes chunk transactions.
pub trait ChunkListener: Send + Sync {
    /// Called after the transaction began.
    fn before_chunk(&self, _execution: &StepExecution) {}

    /// Called after a successful commit.
    fn after_chunk(&self, _execution: &StepExecution) {}

    /// Called after a rollback.
    fn after_chunk_error(&self, _execution: &StepExecution, _error: &BatchError) {}
}

/// Observes individual reads, processing and writes.
pub trait ItemListener<I, O>: Send + Sync {
    /// Called before each read.
    fn before_read(&self) {}

    /// Called with each item read.
    fn after_read(&self, _item: &I) {}

    /// Called when a read fails.
    fn on_read_error(&self, _error: &BatchError) {}

    /// Called before an item is processed.
    fn before_process(&self, _item: &I) {}

    /// Called with the processing result; `None` means filtered.
    fn after_process(&self, _item: &I, _result: Option<&O>) {}

    /// Called when processing fails.
    fn on_process_error(&self, _item: &I, _error: &BatchError) {}

    /// Called before a chunk is written.
    fn before_write(&self, _items: &Chunk<O>) {}

    /// Called after a chunk was written.
    fn after_write(&self, _items: &Chunk<O>) {}

    /// Called when a write fails.
    fn on_write_error(&self, _error: &BatchError, _items: &Chunk<O>) {}
}

/// Observes skipped items.
pub trait SkipListener<I, O>: Send + Sync {
    /// A read failure was skipped.
    fn on_skip_in_read(&self, _error: &BatchError) {}

    /// An item was skipped during processing.
    fn on_skip_in_process(&self, _item: &I, _error: &BatchError) {}

    /// An item was skipped during writing.
    fn on_skip_in_write(&self, _item: &O, _error: &BatchError) {}
}
