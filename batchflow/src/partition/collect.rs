//! Out-of-band data flowing from partitions to the master step.
//!
//! Workers push collector data onto a shared [`PartitionDataQueue`] after
//! every chunk, followed by one entry when the partition finishes. The
//! handler drains the queue in FIFO order and feeds it to a
//! [`PartitionAnalyzer`] on the master side.

use crate::core::{BatchStatus, ExitStatus};
use crate::domain::StepExecution;
use crate::errors::{BatchError, BatchResult};
use crate::step::ChunkListener;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::sync::Arc;
use tracing::warn;

/// One entry of the partition data queue.
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionData {
    /// Data produced by a partition's collector.
    Collected {
        /// Partition step name.
        partition: String,
        /// The collected value.
        data: Value,
    },
    /// A partition finished.
    Finished {
        /// Partition step name.
        partition: String,
        /// Final status.
        status: BatchStatus,
        /// Final exit status.
        exit_status: ExitStatus,
    },
}

/// Thread-safe FIFO shared by partition workers and the master.
#[derive(Debug, Default)]
pub struct PartitionDataQueue {
    entries: Mutex<VecDeque<PartitionData>>,
}

impl PartitionDataQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn push(&self, data: PartitionData) {
        self.entries.lock().push_back(data);
    }

    /// Removes and returns every queued entry, oldest first.
    pub fn drain(&self) -> Vec<PartitionData> {
        self.entries.lock().drain(..).collect()
    }

    /// Number of queued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Gathers data from a partition at chunk boundaries.
pub trait PartitionCollector: Send + Sync {
    /// Returns the data to send to the master, if any.
    fn collect_partition_data(&self, execution: &StepExecution) -> BatchResult<Option<Value>>;
}

/// Chunk listener that runs a [`PartitionCollector`] after every chunk,
/// committed or rolled back, and queues the result.
pub struct PartitionCollectorListener {
    collector: Arc<dyn PartitionCollector>,
    queue: Arc<PartitionDataQueue>,
}

impl Debug for PartitionCollectorListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionCollectorListener")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl PartitionCollectorListener {
    /// Creates a listener feeding `queue`.
    #[must_use]
    pub fn new(collector: Arc<dyn PartitionCollector>, queue: Arc<PartitionDataQueue>) -> Self {
        Self { collector, queue }
    }

    fn collect(&self, execution: &StepExecution) {
        match self.collector.collect_partition_data(execution) {
            Ok(Some(data)) => self.queue.push(PartitionData::Collected {
                partition: execution.step_name.clone(),
                data,
            }),
            Ok(None) => {}
            Err(err) => {
                warn!(partition = %execution.step_name, error = %err, "Partition collector failed");
            }
        }
    }
}

impl ChunkListener for PartitionCollectorListener {
    fn after_chunk(&self, execution: &StepExecution) {
        self.collect(execution);
    }

    fn after_chunk_error(&self, execution: &StepExecution, _error: &BatchError) {
        self.collect(execution);
    }
}

/// Receives collector data and partition outcomes on the master side.
pub trait PartitionAnalyzer: Send + Sync {
    /// Called with each collected value, in queue order.
    fn analyze_collector_data(&self, _partition: &str, _data: &Value) -> BatchResult<()> {
        Ok(())
    }

    /// Called once per finished partition.
    fn analyze_status(
        &self,
        _partition: &str,
        _status: BatchStatus,
        _exit_status: &ExitStatus,
    ) -> BatchResult<()> {
        Ok(())
    }
}

/// Hooks around a whole partitioned step, called once however many
/// partitions fail.
#[async_trait]
pub trait PartitionReducer: Send + Sync {
    /// Before any partition is created.
    async fn begin_partitioned_step(&self) -> BatchResult<()> {
        Ok(())
    }

    /// After every partition completed successfully.
    async fn before_partitioned_step_completion(&self) -> BatchResult<()> {
        Ok(())
    }

    /// After the partitioned step failed.
    async fn rollback_partitioned_step(&self) -> BatchResult<()> {
        Ok(())
    }

    /// At the very end, with the outcome.
    async fn after_partitioned_step_completion(&self, _status: BatchStatus) -> BatchResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct CountCollector;

    impl PartitionCollector for CountCollector {
        fn collect_partition_data(&self, execution: &StepExecution) -> BatchResult<Option<Value>> {
            Ok(Some(json!(execution.write_count)))
        }
    }

    #[test]
    fn test_queue_is_fifo() {
        let queue = PartitionDataQueue::new();
        for n in 0..3 {
            queue.push(PartitionData::Collected {
                partition: "p".to_string(),
                data: json!(n),
            });
        }
        assert_eq!(queue.len(), 3);

        let drained: Vec<_> = queue
            .drain()
            .into_iter()
            .map(|entry| match entry {
                PartitionData::Collected { data, .. } => data,
                PartitionData::Finished { .. } => Value::Null,
            })
            .collect();
        assert_eq!(drained, vec![json!(0), json!(1), json!(2)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_collector_listener_pushes_after_chunks() {
        let queue = Arc::new(PartitionDataQueue::new());
        let listener = PartitionCollectorListener::new(Arc::new(CountCollector), queue.clone());
        let mut execution = StepExecution::new("worker:partition0", uuid::Uuid::new_v4());
        execution.write_count = 4;

        listener.after_chunk(&execution);
        listener.after_chunk_error(&execution, &BatchError::item("io", "down"));

        assert_eq!(
            queue.drain(),
            vec![
                PartitionData::Collected {
                    partition: "worker:partition0".to_string(),
                    data: json!(4),
                };
                2
            ]
        );
    }
}
