//! Dividing a step's input into partitions.

use crate::context::ExecutionContext;
use crate::errors::{BatchError, BatchResult};
use std::fmt::Debug;

/// Produces the input slice of each partition as a named context.
///
/// Names must be unique; they become the suffix of the partition's step
/// name and must be stable across restarts.
pub trait Partitioner: Send + Sync + Debug {
    /// Splits the input into (at most) `grid_size` partitions.
    fn partition(&self, grid_size: usize) -> BatchResult<Vec<(String, ExecutionContext)>>;
}

/// Name of the `index`th partition.
#[must_use]
pub fn partition_name(index: usize) -> String {
    format!("partition{index}")
}

/// Creates `grid_size` partitions with empty contexts.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimplePartitioner;

impl Partitioner for SimplePartitioner {
    fn partition(&self, grid_size: usize) -> BatchResult<Vec<(String, ExecutionContext)>> {
        Ok((0..grid_size)
            .map(|index| (partition_name(index), ExecutionContext::new()))
            .collect())
    }
}

/// Splits an inclusive range of numbers into contiguous sub-ranges.
///
/// Each context holds [`RangePartitioner::MIN_KEY`] and
/// [`RangePartitioner::MAX_KEY`]. When the range is shorter than the grid,
/// fewer partitions are created.
#[derive(Debug, Clone, Copy)]
pub struct RangePartitioner {
    min: i64,
    max: i64,
}

impl RangePartitioner {
    /// Context key of a partition's lower bound.
    pub const MIN_KEY: &'static str = "min_value";
    /// Context key of a partition's upper bound.
    pub const MAX_KEY: &'static str = "max_value";

    /// Partitions `min..=max`.
    #[must_use]
    pub fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }
}

impl Partitioner for RangePartitioner {
    fn partition(&self, grid_size: usize) -> BatchResult<Vec<(String, ExecutionContext)>> {
        if self.max < self.min {
            return Err(BatchError::Configuration(format!(
                "empty range {}..={}",
                self.min, self.max
            )));
        }
        let grid = i64::try_from(grid_size.max(1)).unwrap_or(i64::MAX);
        let span = self.max - self.min + 1;
        let size = (span + grid - 1) / grid;

        let mut partitions = Vec::new();
        let mut start = self.min;
        while start <= self.max {
            let end = (start + size - 1).min(self.max);
            let mut ctx = ExecutionContext::new();
            ctx.put_long(Self::MIN_KEY, start);
            ctx.put_long(Self::MAX_KEY, end);
            partitions.push((partition_name(partitions.len()), ctx));
            start = end + 1;
        }
        Ok(partitions)
    }
}

/// The partitions, concurrency and restart behaviour decided up front by a
/// [`PartitionMapper`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PartitionPlan {
    /// Number of partitions.
    pub partitions: usize,
    /// Workers to run them on; 0 runs them on the caller.
    pub threads: usize,
    /// Context of each partition, indexed by partition number.
    pub partition_properties: Vec<ExecutionContext>,
    /// On restart, regenerate every partition instead of re-running only
    /// the unfinished ones.
    pub partitions_override: bool,
}

impl PartitionPlan {
    /// Creates a plan of `partitions` empty partitions run on as many
    /// workers.
    #[must_use]
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions,
            threads: partitions,
            partition_properties: Vec::new(),
            partitions_override: false,
        }
    }

    /// Sets the number of workers.
    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Sets the per-partition contexts.
    #[must_use]
    pub fn with_properties(mut self, properties: Vec<ExecutionContext>) -> Self {
        self.partition_properties = properties;
        self
    }

    /// Sets the override flag.
    #[must_use]
    pub fn with_override(mut self, partitions_override: bool) -> Self {
        self.partitions_override = partitions_override;
        self
    }

    /// Named partition contexts described by the plan.
    pub fn contexts(&self) -> BatchResult<Vec<(String, ExecutionContext)>> {
        if !self.partition_properties.is_empty()
            && self.partition_properties.len() != self.partitions
        {
            return Err(BatchError::Configuration(format!(
                "partition plan has {} partitions but {} property sets",
                self.partitions,
                self.partition_properties.len()
            )));
        }
        Ok((0..self.partitions)
            .map(|index| {
                let ctx = self
                    .partition_properties
                    .get(index)
                    .cloned()
                    .unwrap_or_default();
                (partition_name(index), ctx)
            })
            .collect())
    }
}

/// Plans the partitions of a step in one go.
pub trait PartitionMapper: Send + Sync + Debug {
    /// Returns the plan.
    fn map_partitions(&self) -> BatchResult<PartitionPlan>;
}
