//! Per-chunk counters.

use crate::core::ExitStatus;

/// Counters accumulated during one chunk attempt.
///
/// A contribution is applied to its [`StepExecution`](super::StepExecution)
/// only when the chunk commits, so a rolled-back attempt leaves the step's
/// counters untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepContribution {
    /// Items read.
    pub read_count: usize,
    /// Items written.
    pub write_count: usize,
    /// Items filtered.
    pub filter_count: usize,
    /// Read skips.
    pub read_skip_count: usize,
    /// Process skips.
    pub process_skip_count: usize,
    /// Write skips.
    pub write_skip_count: usize,
    /// Items handed to the recoverer after retries ran out.
    pub recover_count: usize,
    /// Exit status contributed by this chunk.
    pub exit_status: ExitStatus,
    parent_skip_count: usize,
}

impl StepContribution {
    /// Creates a contribution on top of the step's committed skip count.
    #[must_use]
    pub fn new(parent_skip_count: usize) -> Self {
        Self {
            read_count: 0,
            write_count: 0,
            filter_count: 0,
            read_skip_count: 0,
            process_skip_count: 0,
            write_skip_count: 0,
            recover_count: 0,
            exit_status: ExitStatus::executing(),
            parent_skip_count,
        }
    }

    /// Increments the read count.
    pub fn increment_read_count(&mut self) {
        self.read_count += 1;
    }

    /// Adds to the write count.
    pub fn increment_write_count(&mut self, count: usize) {
        self.write_count += count;
    }

    /// Increments the filter count.
    pub fn increment_filter_count(&mut self) {
        self.filter_count += 1;
    }

    /// Increments the read skip count.
    pub fn increment_read_skip_count(&mut self) {
        self.read_skip_count += 1;
    }

    /// Increments the process skip count.
    pub fn increment_process_skip_count(&mut self) {
        self.process_skip_count += 1;
    }

    /// Increments the write skip count.
    pub fn increment_write_skip_count(&mut self) {
        self.write_skip_count += 1;
    }

    /// Increments the recover count.
    pub fn increment_recover_count(&mut self) {
        self.recover_count += 1;
    }

    /// Skips in this contribution. Recovered items are not skips.
    #[must_use]
    pub fn skip_count(&self) -> usize {
        self.read_skip_count + self.process_skip_count + self.write_skip_count
    }

    /// Committed skips plus this contribution's skips.
    #[must_use]
    pub fn step_skip_count(&self) -> usize {
        self.parent_skip_count + self.skip_count()
    }

    /// Folds an exit status into this contribution.
    pub fn set_exit_status(&mut self, status: &ExitStatus) {
        self.exit_status = self.exit_status.and(status);
    }
}
