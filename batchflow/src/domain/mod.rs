//! Job and step execution domain model.
//!
//! Instances and executions are created by the job repository; the engine
//! mutates them while driving a run and hands them back for persistence.

mod contribution;
mod failure;
mod job;
mod step_execution;

pub use contribution::StepContribution;
pub use failure::FailureRecord;
pub use job::{JobExecution, JobInstance, JobParameter, JobParameters};
pub use step_execution::StepExecution;
