//! Item-level collaborators of a chunk-oriented step.
//!
//! A step reads items one at a time from an [`ItemReader`], transforms them
//! with an [`ItemProcessor`] and hands each chunk to an [`ItemWriter`].
//! Readers and writers are [`ItemStream`]s so the step can checkpoint them at
//! every commit and restore them on restart.

mod chunk;
mod support;

pub use chunk::{Chunk, SkippedItem};
pub use support::{FnItemProcessor, ListItemReader, ListItemWriter, PassThroughItemProcessor};

use crate::context::{ExecutionContext, RestartData};
use crate::errors::{BatchError, BatchResult};
use async_trait::async_trait;

/// A stateful collaborator that can be checkpointed and restored.
///
/// `restore(snapshot())` with no reads in between must leave the stream
/// where it was. Restoring a stream that has already produced output fails
/// with [`BatchError::IllegalState`] unless it was closed first.
#[async_trait]
pub trait ItemStream: Send + Sync {
    /// Resumes from a saved checkpoint. Missing keys mean "start fresh".
    async fn restore(&self, _ctx: &ExecutionContext) -> BatchResult<()> {
        Ok(())
    }

    /// Writes the current position into the checkpoint.
    async fn snapshot(&self, _ctx: &mut ExecutionContext) -> BatchResult<()> {
        Ok(())
    }

    /// Releases resources. A closed stream may be restored again.
    async fn close(&self) -> BatchResult<()> {
        Ok(())
    }

    /// Returns the current position as flat properties.
    async fn restart_data(&self) -> BatchResult<RestartData> {
        let mut ctx = ExecutionContext::new();
        self.snapshot(&mut ctx).await?;
        Ok(RestartData::from(&ctx))
    }

    /// Resumes from flat properties produced by [`ItemStream::restart_data`].
    async fn restore_from(&self, data: &RestartData) -> BatchResult<()> {
        self.restore(&ExecutionContext::from(data)).await
    }
}

/// Source of items. `Ok(None)` signals end of data.
#[async_trait]
pub trait ItemReader<T>: ItemStream {
    /// Reads the next item.
    async fn read(&self) -> BatchResult<Option<T>>;

    /// Called once a failed read has been skipped, before the next read.
    ///
    /// Readers that must step over the bad record themselves do it here.
    async fn skip(&self) -> BatchResult<()> {
        Ok(())
    }
}

/// Transforms one item. `Ok(None)` filters the item out of the chunk.
#[async_trait]
pub trait ItemProcessor<I, O>: Send + Sync {
    /// Processes an item.
    async fn process(&self, item: I) -> BatchResult<Option<O>>;
}

/// Sink for chunks of items.
///
/// A chunk is one transactional unit: a write either takes effect for every
/// item or for none of them.
#[async_trait]
pub trait ItemWriter<T>: ItemStream {
    /// Writes a chunk.
    async fn write(&self, chunk: &Chunk<T>) -> BatchResult<()>;
}

/// Last resort for an item whose retries are exhausted.
#[async_trait]
pub trait ItemRecoverer<I>: Send + Sync {
    /// Returns true if the item was dealt with (logged, quarantined, ...) and
    /// the step may carry on without it.
    async fn recover(&self, item: &I, cause: &BatchError) -> BatchResult<bool>;
}
