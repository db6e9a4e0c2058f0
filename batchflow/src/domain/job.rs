//! Job parameters, instances and executions.

use super::StepExecution;
use crate::cancellation::CancellationToken;
use crate::context::ExecutionContext;
use crate::core::{BatchStatus, ExitStatus};
use crate::domain::FailureRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// A typed job parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum JobParameter {
    /// A string value.
    String(String),
    /// An integer value.
    Long(i64),
    /// A floating point value.
    Double(f64),
    /// A timestamp.
    Date(DateTime<Utc>),
}

impl fmt::Display for JobParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(value) => write!(f, "{value}"),
            Self::Long(value) => write!(f, "{value}"),
            Self::Double(value) => write!(f, "{value}"),
            Self::Date(value) => write!(f, "{}", value.to_rfc3339()),
        }
    }
}

/// The parameters identifying one job instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobParameters {
    parameters: BTreeMap<String, JobParameter>,
}

impl JobParameters {
    /// Creates empty parameters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a string parameter.
    #[must_use]
    pub fn with_string(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), JobParameter::String(value.into()));
        self
    }

    /// Adds an integer parameter.
    #[must_use]
    pub fn with_long(mut self, key: impl Into<String>, value: i64) -> Self {
        self.parameters.insert(key.into(), JobParameter::Long(value));
        self
    }

    /// Adds a float parameter.
    #[must_use]
    pub fn with_double(mut self, key: impl Into<String>, value: f64) -> Self {
        self.parameters.insert(key.into(), JobParameter::Double(value));
        self
    }

    /// Adds a date parameter.
    #[must_use]
    pub fn with_date(mut self, key: impl Into<String>, value: DateTime<Utc>) -> Self {
        self.parameters.insert(key.into(), JobParameter::Date(value));
        self
    }

    /// Returns a parameter.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&JobParameter> {
        self.parameters.get(key)
    }

    /// Returns a string parameter.
    #[must_use]
    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.parameters.get(key) {
            Some(JobParameter::String(value)) => Some(value),
            _ => None,
        }
    }

    /// Returns an integer parameter.
    #[must_use]
    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.parameters.get(key) {
            Some(JobParameter::Long(value)) => Some(*value),
            _ => None,
        }
    }

    /// Returns true if there are no parameters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Deterministic identity string, stable across runs.
    #[must_use]
    pub fn identity_key(&self) -> String {
        self.parameters
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// A logical job run: job name plus identifying parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInstance {
    /// Unique id.
    pub id: Uuid,
    /// Job name.
    pub job_name: String,
    /// Identifying parameters.
    pub parameters: JobParameters,
}

impl JobInstance {
    /// Creates a new instance.
    #[must_use]
    pub fn new(job_name: impl Into<String>, parameters: JobParameters) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_name: job_name.into(),
            parameters,
        }
    }

    /// The (name, parameters) key that makes an instance unique.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}[{}]", self.job_name, self.parameters.identity_key())
    }
}

/// One physical attempt to run a [`JobInstance`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    /// Unique id.
    pub id: Uuid,
    /// The instance being run.
    pub job_instance: JobInstance,
    /// Current status.
    pub status: BatchStatus,
    /// Current exit status.
    pub exit_status: ExitStatus,
    /// Creation time.
    pub create_time: DateTime<Utc>,
    /// Start time, once started.
    pub start_time: Option<DateTime<Utc>>,
    /// End time, once finished.
    pub end_time: Option<DateTime<Utc>>,
    /// Last time the repository persisted this execution.
    pub last_updated: Option<DateTime<Utc>>,
    /// Job-level checkpoint.
    pub execution_context: ExecutionContext,
    /// Step executions in start order.
    pub step_executions: Vec<StepExecution>,
    /// Failures that ended the job.
    pub failures: Vec<FailureRecord>,
    #[serde(skip)]
    stop_token: Arc<CancellationToken>,
}

impl JobExecution {
    /// Creates a new execution in `Starting` status.
    #[must_use]
    pub fn new(job_instance: JobInstance) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_instance,
            status: BatchStatus::Starting,
            exit_status: ExitStatus::unknown(),
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
            last_updated: None,
            execution_context: ExecutionContext::new(),
            step_executions: Vec::new(),
            failures: Vec::new(),
            stop_token: Arc::new(CancellationToken::new()),
        }
    }

    /// Returns the job name.
    #[must_use]
    pub fn job_name(&self) -> &str {
        &self.job_instance.job_name
    }

    /// Creates a step execution owned by this job execution.
    ///
    /// The step shares this execution's stop token.
    #[must_use]
    pub fn create_step_execution(&self, step_name: impl Into<String>) -> StepExecution {
        StepExecution::new(step_name, self.id).with_stop_token(Arc::clone(&self.stop_token))
    }

    /// Adds or replaces the step execution with the same id.
    pub fn record_step_execution(&mut self, step_execution: &StepExecution) {
        match self
            .step_executions
            .iter_mut()
            .find(|existing| existing.id == step_execution.id)
        {
            Some(existing) => *existing = step_execution.clone(),
            None => self.step_executions.push(step_execution.clone()),
        }
    }

    /// Returns the stop token shared with this execution's steps.
    #[must_use]
    pub fn stop_token(&self) -> &Arc<CancellationToken> {
        &self.stop_token
    }

    /// Requests a cooperative stop.
    pub fn stop(&mut self) {
        if self.status.is_running() {
            self.status = BatchStatus::Stopping;
        }
        self.stop_token.cancel(format!("Stop requested for job '{}'", self.job_name()));
    }

    /// Returns true while starting or running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }

    /// Records a failure.
    pub fn add_failure(&mut self, failure: FailureRecord) {
        self.failures.push(failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_key_is_sorted() {
        let a = JobParameters::new().with_string("file", "in.csv").with_long("run", 1);
        let b = JobParameters::new().with_long("run", 1).with_string("file", "in.csv");

        assert_eq!(a.identity_key(), b.identity_key());
        assert_eq!(a.identity_key(), "file=in.csv;run=1");
        assert_eq!(a.get_string("file"), Some("in.csv"));
        assert_eq!(a.get_long("run"), Some(1));
    }

    #[test]
    fn test_instance_key() {
        let instance = JobInstance::new("import", JobParameters::new().with_long("run", 2));
        assert_eq!(instance.key(), "import[run=2]");
    }

    #[test]
    fn test_step_executions_share_stop_token() {
        let mut execution = JobExecution::new(JobInstance::new("import", JobParameters::new()));
        execution.status = BatchStatus::Started;
        let step = execution.create_step_execution("load");

        execution.stop();

        assert_eq!(execution.status, BatchStatus::Stopping);
        assert!(step.should_stop());
    }

    #[test]
    fn test_record_step_execution_replaces_by_id() {
        let mut execution = JobExecution::new(JobInstance::new("import", JobParameters::new()));
        let mut step = execution.create_step_execution("load");
        execution.record_step_execution(&step);

        step.read_count = 5;
        execution.record_step_execution(&step);

        assert_eq!(execution.step_executions.len(), 1);
        assert_eq!(execution.step_executions[0].read_count, 5);
    }
}
