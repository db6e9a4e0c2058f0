//! In-memory readers, writers and processors.

use super::{Chunk, ItemProcessor, ItemReader, ItemStream, ItemWriter};
use crate::context::ExecutionContext;
use crate::errors::{BatchError, BatchResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt::{self, Debug};
use std::future::Future;
use std::marker::PhantomData;
use tracing::debug;

#[derive(Debug, Default)]
struct ReaderState {
    position: usize,
    dirty: bool,
}

/// Reads items from a vector, checkpointing the number of items read.
#[derive(Debug)]
pub struct ListItemReader<T> {
    name: String,
    items: Vec<T>,
    state: Mutex<ReaderState>,
}

impl<T> ListItemReader<T> {
    /// Creates a reader named `name` over `items`.
    #[must_use]
    pub fn new(name: impl Into<String>, items: Vec<T>) -> Self {
        Self {
            name: name.into(),
            items,
            state: Mutex::new(ReaderState::default()),
        }
    }

    /// Key under which the read position is checkpointed.
    #[must_use]
    pub fn position_key(&self) -> String {
        format!("{}.read.count", self.name)
    }

    /// Number of items handed out so far.
    #[must_use]
    pub fn position(&self) -> usize {
        self.state.lock().position
    }
}

#[async_trait]
impl<T: Send + Sync> ItemStream for ListItemReader<T> {
    async fn restore(&self, ctx: &ExecutionContext) -> BatchResult<()> {
        let mut state = self.state.lock();
        if state.dirty {
            return Err(BatchError::IllegalState(format!(
                "reader '{}' cannot be restored after it has been read from",
                self.name
            )));
        }

        let Some(position) = ctx.get_long(&self.position_key()) else {
            return Ok(());
        };
        let position = usize::try_from(position).map_err(|_| {
            BatchError::IllegalState(format!("negative read position {position} for '{}'", self.name))
        })?;
        debug!(reader = %self.name, position, "Restoring reader position");
        state.position = position.min(self.items.len());
        Ok(())
    }

    async fn snapshot(&self, ctx: &mut ExecutionContext) -> BatchResult<()> {
        let position = self.state.lock().position;
        ctx.put(self.position_key(), &position)
    }

    async fn close(&self) -> BatchResult<()> {
        let mut state = self.state.lock();
        state.dirty = false;
        state.position = 0;
        Ok(())
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> ItemReader<T> for ListItemReader<T> {
    async fn read(&self) -> BatchResult<Option<T>> {
        let mut state = self.state.lock();
        state.dirty = true;
        let item = self.items.get(state.position).cloned();
        if item.is_some() {
            state.position += 1;
        }
        Ok(item)
    }
}

/// Collects written chunks in memory.
#[derive(Debug)]
pub struct ListItemWriter<T> {
    chunks: Mutex<Vec<Vec<T>>>,
}

impl<T> Default for ListItemWriter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ListItemWriter<T> {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            chunks: Mutex::new(Vec::new()),
        }
    }

    /// Sizes of the chunks written so far.
    #[must_use]
    pub fn chunk_sizes(&self) -> Vec<usize> {
        self.chunks.lock().iter().map(Vec::len).collect()
    }
}

impl<T: Clone> ListItemWriter<T> {
    /// All written items, in write order.
    #[must_use]
    pub fn written(&self) -> Vec<T> {
        self.chunks.lock().iter().flatten().cloned().collect()
    }
}

impl<T: Send + Sync> ItemStream for ListItemWriter<T> {}

#[async_trait]
impl<T: Clone + Send + Sync> ItemWriter<T> for ListItemWriter<T> {
    async fn write(&self, chunk: &Chunk<T>) -> BatchResult<()> {
        self.chunks.lock().push(chunk.items().to_vec());
        Ok(())
    }
}

/// Returns every item unchanged.
pub struct PassThroughItemProcessor<T> {
    _marker: PhantomData<fn(T) -> T>,
}

impl<T> PassThroughItemProcessor<T> {
    /// Creates the processor.
    #[must_use]
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for PassThroughItemProcessor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Debug for PassThroughItemProcessor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PassThroughItemProcessor")
    }
}

#[async_trait]
impl<T: Send + 'static> ItemProcessor<T, T> for PassThroughItemProcessor<T> {
    async fn process(&self, item: T) -> BatchResult<Option<T>> {
        Ok(Some(item))
    }
}

/// Adapter turning an async closure into an [`ItemProcessor`].
pub struct FnItemProcessor<F, Fut> {
    func: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnItemProcessor<F, Fut> {
    /// Wraps a closure.
    pub fn new(func: F) -> Self {
        Self {
            func,
            _marker: PhantomData,
        }
    }
}

impl<F, Fut> Debug for FnItemProcessor<F, Fut> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnItemProcessor")
    }
}

#[async_trait]
impl<I, O, F, Fut> ItemProcessor<I, O> for FnItemProcessor<F, Fut>
where
    I: Send + 'static,
    O: Send,
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = BatchResult<Option<O>>> + Send,
{
    async fn process(&self, item: I) -> BatchResult<Option<O>> {
        (self.func)(item).await
    }
}
