//! Partitioned steps.
//!
//! A [`PartitionStep`] asks a [`StepExecutionSplitter`] for one step
//! execution per partition, hands them to a [`PartitionHandler`] and folds
//! the results back into the master execution. Partition step names have
//! the form `{step}:{partition}` and stay stable across restarts, which is
//! how a restart finds the partitions that still need to run.

mod collect;
mod handler;
mod partitioner;
mod splitter;
mod step;

#[cfg(test)]
mod partition_tests;

pub use collect::{
    PartitionAnalyzer, PartitionCollector, PartitionCollectorListener, PartitionData,
    PartitionDataQueue, PartitionReducer,
};
pub use handler::{PartitionHandler, TaskExecutorPartitionHandler};
pub use partitioner::{
    partition_name, PartitionMapper, PartitionPlan, Partitioner, RangePartitioner,
    SimplePartitioner,
};
pub use splitter::{SimpleStepExecutionSplitter, StepExecutionSplitter};
pub use step::{
    DefaultStepExecutionAggregator, PartitionStep, ScopedStep, StepExecutionAggregator,
    StepFactory,
};
