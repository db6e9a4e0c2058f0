//! # Batchflow
//!
//! A chunk-oriented batch job engine.
//!
//! Batchflow runs jobs made of steps. A chunk-oriented step reads items one
//! at a time, transforms them and writes them in transactional chunks, with
//! support for:
//!
//! - **Repeat and retry**: policy-driven loops with back-off, stateless or
//!   stateful retry and recovery
//! - **Skip**: bounded skipping of bad records during read, process or write
//! - **Restart**: checkpoints in an execution context persisted with every
//!   commit, so a failed or stopped job resumes where it left off
//! - **Partitioning**: splitting a step across concurrent workers and
//!   re-running only the failed partitions on restart
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use batchflow::prelude::*;
//!
//! let repository = Arc::new(InMemoryJobRepository::new());
//! let step = StepBuilder::<Record, Record>::new("import")
//!     .with_repository(repository.clone())
//!     .with_reader(reader)
//!     .without_processor()
//!     .with_writer(writer)
//!     .with_commit_interval(100)
//!     .with_skip_limit(10)
//!     .with_skippable("parse")
//!     .build()?;
//!
//! let job = SimpleJob::new("nightly-import", repository.clone()).with_step(Arc::new(step));
//! let execution = JobLauncher::new(repository).run(&job, &params).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod classify;
pub mod config;
pub mod context;
pub mod core;
pub mod domain;
pub mod errors;
pub mod exception;
pub mod item;
pub mod job;
pub mod observability;
pub mod partition;
pub mod repeat;
pub mod repository;
pub mod retry;
pub mod step;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{BackOffConfig, BatchConfig, PartitionConfig, StepConfig};
    pub use crate::context::ExecutionContext;
    pub use crate::core::{BatchStatus, ExitStatus, RepeatStatus};
    pub use crate::domain::{
        FailureRecord, JobExecution, JobInstance, JobParameters, StepContribution, StepExecution,
    };
    pub use crate::errors::{BatchError, BatchResult};
    pub use crate::item::{
        ItemProcessor, ItemReader, ItemRecoverer, ItemStream, ItemWriter, ListItemReader,
        ListItemWriter,
    };
    pub use crate::job::{Job, JobExecutionListener, JobLauncher, SimpleJob};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::partition::{
        PartitionStep, Partitioner, ScopedStep, SimpleStepExecutionSplitter,
        TaskExecutorPartitionHandler,
    };
    pub use crate::repeat::{RepeatCallback, RepeatTemplate};
    pub use crate::repository::{InMemoryJobRepository, JobRepository};
    pub use crate::retry::{RetryCallback, RetryPolicy, RetryState, RetryTemplate};
    pub use crate::step::{ChunkListener, SkipListener, Step, StepBuilder, StepExecutionListener};
}
