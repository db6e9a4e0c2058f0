//! Fluent assembly of a [`ChunkOrientedStep`].

use super::{
    ChunkListener, ChunkOrientedStep, ItemListener, KeyGenerator, LimitCheckingItemSkipPolicy,
    ResourcelessTransactionManager, SkipListener, SkipPolicy, StepExecutionListener, StepSettings,
    TransactionManager,
};
use crate::classify::ErrorKindClassifier;
use crate::config::StepConfig;
use crate::errors::{BatchError, BatchResult};
use crate::item::{ItemProcessor, ItemReader, ItemRecoverer, ItemWriter, PassThroughItemProcessor};
use crate::repeat::{CompletionPolicy, SimpleCompletionPolicy};
use crate::repository::JobRepository;
use crate::retry::{
    BackOffPolicy, MapRetryContextCache, RetryListener, RetryPolicy, RetryTemplate,
    SimpleRetryPolicy,
};
use std::fmt::Debug;
use std::sync::Arc;

/// Builds a chunk-oriented step.
///
/// Fault tolerance comes from a [`StepConfig`] (commit interval, skip and
/// retry limits with their error kinds, no-rollback kinds, backoff) and can
/// be overridden piece by piece with custom policies.
///
/// ```ignore
/// let step = StepBuilder::new("load")
///     .with_repository(repository)
///     .with_reader(reader)
///     .with_processor(processor)
///     .with_writer(writer)
///     .with_config(&StepConfig::new().with_commit_interval(100).with_skip(10, ["parse"]))
///     .build()?;
/// ```
pub struct StepBuilder<I, O> {
    name: String,
    config: StepConfig,
    repository: Option<Arc<dyn JobRepository>>,
    reader: Option<Arc<dyn ItemReader<I>>>,
    processor: Option<Arc<dyn ItemProcessor<I, O>>>,
    writer: Option<Arc<dyn ItemWriter<O>>>,
    completion_policy: Option<Arc<dyn CompletionPolicy>>,
    skip_policy: Option<Arc<dyn SkipPolicy>>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    backoff_policy: Option<Arc<dyn BackOffPolicy>>,
    retry_listeners: Vec<Arc<dyn RetryListener>>,
    retry_cache_capacity: usize,
    recoverer: Option<Arc<dyn ItemRecoverer<I>>>,
    key_generator: Option<KeyGenerator<I>>,
    transaction_manager: Option<Arc<dyn TransactionManager>>,
    step_listeners: Vec<Arc<dyn StepExecutionListener>>,
    chunk_listeners: Vec<Arc<dyn ChunkListener>>,
    item_listeners: Vec<Arc<dyn ItemListener<I, O>>>,
    skip_listeners: Vec<Arc<dyn SkipListener<I, O>>>,
}

impl<I, O> StepBuilder<I, O>
where
    I: Clone + Debug + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    /// Starts a builder with the default configuration.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: StepConfig::default(),
            repository: None,
            reader: None,
            processor: None,
            writer: None,
            completion_policy: None,
            skip_policy: None,
            retry_policy: None,
            backoff_policy: None,
            retry_listeners: Vec::new(),
            retry_cache_capacity: MapRetryContextCache::DEFAULT_CAPACITY,
            recoverer: None,
            key_generator: None,
            transaction_manager: None,
            step_listeners: Vec::new(),
            chunk_listeners: Vec::new(),
            item_listeners: Vec::new(),
            skip_listeners: Vec::new(),
        }
    }

    /// Replaces the whole fault-tolerance configuration.
    #[must_use]
    pub fn with_config(mut self, config: &StepConfig) -> Self {
        self.config = config.clone();
        self
    }

    /// Sets the repository the step reports to.
    #[must_use]
    pub fn with_repository(mut self, repository: Arc<dyn JobRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Sets the reader.
    #[must_use]
    pub fn with_reader(mut self, reader: Arc<dyn ItemReader<I>>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Sets the processor.
    #[must_use]
    pub fn with_processor(mut self, processor: Arc<dyn ItemProcessor<I, O>>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Sets the writer.
    #[must_use]
    pub fn with_writer(mut self, writer: Arc<dyn ItemWriter<O>>) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Sets the number of items per chunk.
    #[must_use]
    pub fn with_commit_interval(mut self, commit_interval: usize) -> Self {
        self.config.commit_interval = commit_interval;
        self
    }

    /// Ends chunks with a custom policy instead of a fixed item count.
    #[must_use]
    pub fn with_completion_policy(mut self, policy: Arc<dyn CompletionPolicy>) -> Self {
        self.completion_policy = Some(policy);
        self
    }

    /// Sets the skip limit.
    #[must_use]
    pub fn with_skip_limit(mut self, skip_limit: usize) -> Self {
        self.config.skip_limit = skip_limit;
        self
    }

    /// Allows skipping errors of `kind`.
    #[must_use]
    pub fn with_skippable(mut self, kind: impl Into<String>) -> Self {
        self.config.skippable_kinds.push(kind.into());
        self
    }

    /// Replaces the limit-checking skip policy.
    #[must_use]
    pub fn with_skip_policy(mut self, policy: Arc<dyn SkipPolicy>) -> Self {
        self.skip_policy = Some(policy);
        self
    }

    /// Sets the maximum attempts per item.
    #[must_use]
    pub fn with_retry_limit(mut self, retry_limit: usize) -> Self {
        self.config.retry_limit = retry_limit;
        self
    }

    /// Allows retrying errors of `kind`.
    #[must_use]
    pub fn with_retryable(mut self, kind: impl Into<String>) -> Self {
        self.config.retryable_kinds.push(kind.into());
        self
    }

    /// Replaces the limit-based retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Replaces the configured backoff.
    #[must_use]
    pub fn with_backoff_policy(mut self, policy: Arc<dyn BackOffPolicy>) -> Self {
        self.backoff_policy = Some(policy);
        self
    }

    /// Adds a retry listener.
    #[must_use]
    pub fn with_retry_listener(mut self, listener: Arc<dyn RetryListener>) -> Self {
        self.retry_listeners.push(listener);
        self
    }

    /// Sets the capacity of the retry context cache.
    #[must_use]
    pub fn with_retry_cache_capacity(mut self, capacity: usize) -> Self {
        self.retry_cache_capacity = capacity;
        self
    }

    /// Errors of `kind` are retried in place without rolling back the chunk.
    #[must_use]
    pub fn with_no_rollback(mut self, kind: impl Into<String>) -> Self {
        self.config.no_rollback_kinds.push(kind.into());
        self
    }

    /// Sets the recoverer consulted when an item's retries are exhausted.
    #[must_use]
    pub fn with_recoverer(mut self, recoverer: Arc<dyn ItemRecoverer<I>>) -> Self {
        self.recoverer = Some(recoverer);
        self
    }

    /// Sets how retry keys are derived from items. Defaults to the item's
    /// `Debug` representation.
    #[must_use]
    pub fn with_key_generator(mut self, generator: KeyGenerator<I>) -> Self {
        self.key_generator = Some(generator);
        self
    }

    /// Sets the transaction manager.
    #[must_use]
    pub fn with_transaction_manager(mut self, manager: Arc<dyn TransactionManager>) -> Self {
        self.transaction_manager = Some(manager);
        self
    }

    /// Adds a step listener.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn StepExecutionListener>) -> Self {
        self.step_listeners.push(listener);
        self
    }

    /// Adds a chunk listener.
    #[must_use]
    pub fn with_chunk_listener(mut self, listener: Arc<dyn ChunkListener>) -> Self {
        self.chunk_listeners.push(listener);
        self
    }

    /// Adds an item listener.
    #[must_use]
    pub fn with_item_listener(mut self, listener: Arc<dyn ItemListener<I, O>>) -> Self {
        self.item_listeners.push(listener);
        self
    }

    /// Adds a skip listener.
    #[must_use]
    pub fn with_skip_listener(mut self, listener: Arc<dyn SkipListener<I, O>>) -> Self {
        self.skip_listeners.push(listener);
        self
    }

    /// Sets the start limit.
    #[must_use]
    pub fn with_start_limit(mut self, start_limit: usize) -> Self {
        self.config.start_limit = Some(start_limit);
        self
    }

    /// Allows re-running a completed step on restart.
    #[must_use]
    pub fn with_allow_start_if_complete(mut self, allow: bool) -> Self {
        self.config.allow_start_if_complete = allow;
        self
    }

    /// Validates the configuration and assembles the step.
    pub fn build(self) -> BatchResult<ChunkOrientedStep<I, O>> {
        self.config.validate()?;
        let name = self.name;
        let missing =
            |what: &str| BatchError::Configuration(format!("step '{name}' has no {what}"));

        let repository = self.repository.ok_or_else(|| missing("repository"))?;
        let reader = self.reader.ok_or_else(|| missing("reader"))?;
        let processor = self.processor.ok_or_else(|| missing("processor"))?;
        let writer = self.writer.ok_or_else(|| missing("writer"))?;

        let config = self.config;
        let retry_policy = self.retry_policy.unwrap_or_else(|| {
            Arc::new(SimpleRetryPolicy::for_kinds(
                config.retry_limit.max(1),
                config.retryable_kinds.iter().cloned(),
            ))
        });
        let mut retry_template = RetryTemplate::new()
            .with_retry_policy(retry_policy)
            .with_backoff_policy(self.backoff_policy.unwrap_or_else(|| config.backoff.build()))
            .with_cache(Arc::new(MapRetryContextCache::new(self.retry_cache_capacity)));
        for listener in self.retry_listeners {
            retry_template = retry_template.with_listener(listener);
        }

        let skip_policy = self.skip_policy.unwrap_or_else(|| {
            Arc::new(LimitCheckingItemSkipPolicy::new(
                config.skip_limit,
                config.skippable_kinds.iter().cloned(),
            ))
        });
        let chunk_policy = self
            .completion_policy
            .unwrap_or_else(|| Arc::new(SimpleCompletionPolicy::new(config.commit_interval)));

        let mut settings = StepSettings::new(name, repository)
            .with_allow_start_if_complete(config.allow_start_if_complete);
        if let Some(start_limit) = config.start_limit {
            settings = settings.with_start_limit(start_limit);
        }
        for listener in self.step_listeners {
            settings = settings.with_listener(listener);
        }

        Ok(ChunkOrientedStep {
            settings,
            reader,
            processor,
            writer,
            chunk_policy,
            transaction_manager: self
                .transaction_manager
                .unwrap_or_else(|| Arc::new(ResourcelessTransactionManager::new())),
            retry_template,
            rollback_classifier: Arc::new(ErrorKindClassifier::excluding(
                config.no_rollback_kinds.iter().cloned(),
            )),
            skip_policy,
            recoverer: self.recoverer,
            key_generator: self
                .key_generator
                .unwrap_or_else(|| Arc::new(|item: &I| format!("{item:?}"))),
            chunk_listeners: self.chunk_listeners,
            item_listeners: self.item_listeners,
            skip_listeners: self.skip_listeners,
        })
    }
}

impl<T> StepBuilder<T, T>
where
    T: Clone + Debug + Send + Sync + 'static,
{
    /// Passes items to the writer unchanged.
    #[must_use]
    pub fn without_processor(mut self) -> Self {
        self.processor = Some(Arc::new(PassThroughItemProcessor::new()));
        self
    }
}
