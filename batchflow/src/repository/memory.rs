//! In-memory job repository.

use super::JobRepository;
use crate::core::BatchStatus;
use crate::domain::{JobExecution, JobInstance, JobParameters, StepExecution};
use crate::errors::{BatchError, BatchResult};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Store {
    instances: HashMap<String, JobInstance>,
    job_executions_by_instance: HashMap<Uuid, Vec<Uuid>>,
    job_executions: HashMap<Uuid, JobExecution>,
    step_executions_by_job: HashMap<Uuid, Vec<Uuid>>,
    step_executions: HashMap<Uuid, StepExecution>,
}

impl Store {
    fn instance_key(job_name: &str, params: &JobParameters) -> String {
        format!("{job_name}[{}]", params.identity_key())
    }

    fn job_execution(&self, id: Uuid) -> Option<JobExecution> {
        let mut execution = self.job_executions.get(&id)?.clone();
        execution.step_executions = self
            .step_executions_by_job
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|step_id| self.step_executions.get(step_id).cloned())
            .collect();
        Some(execution)
    }

    fn step_executions_of<'a>(
        &'a self,
        instance: &JobInstance,
        step_name: &'a str,
    ) -> impl Iterator<Item = &'a StepExecution> + 'a {
        self.job_executions_by_instance
            .get(&instance.id)
            .into_iter()
            .flatten()
            .filter_map(|job_id| self.step_executions_by_job.get(job_id))
            .flatten()
            .filter_map(|step_id| self.step_executions.get(step_id))
            .filter(move |step| step.step_name == step_name)
    }
}

/// A [`JobRepository`] that keeps everything in process memory.
///
/// Stored executions share their stop token with the copies handed out, so
/// a stop requested through one copy reaches the running steps.
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    store: RwLock<Store>,
}

impl InMemoryJobRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of job instances created so far.
    #[must_use]
    pub fn job_instance_count(&self) -> usize {
        self.store.read().instances.len()
    }

    /// All executions of a step within one job execution, in creation order.
    #[must_use]
    pub fn step_executions(&self, job_execution_id: Uuid) -> Vec<StepExecution> {
        let store = self.store.read();
        store
            .step_executions_by_job
            .get(&job_execution_id)
            .into_iter()
            .flatten()
            .filter_map(|id| store.step_executions.get(id).cloned())
            .collect()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn job_instance_exists(&self, job_name: &str, params: &JobParameters) -> BatchResult<bool> {
        Ok(self
            .store
            .read()
            .instances
            .contains_key(&Store::instance_key(job_name, params)))
    }

    async fn create_job_execution(
        &self,
        job_name: &str,
        params: &JobParameters,
    ) -> BatchResult<JobExecution> {
        let key = Store::instance_key(job_name, params);
        let mut store = self.store.write();

        let (instance, context) = match store.instances.get(&key).cloned() {
            Some(instance) => {
                let ids = store
                    .job_executions_by_instance
                    .get(&instance.id)
                    .cloned()
                    .unwrap_or_default();
                for id in &ids {
                    let Some(previous) = store.job_executions.get(id) else {
                        continue;
                    };
                    if previous.is_running() {
                        return Err(BatchError::JobExecutionAlreadyRunning(format!(
                            "{key} (execution {id})"
                        )));
                    }
                    match previous.status {
                        BatchStatus::Completed => {
                            return Err(BatchError::JobInstanceAlreadyComplete(key));
                        }
                        BatchStatus::Abandoned => {
                            return Err(BatchError::JobRestart(format!(
                                "{key} has an abandoned execution and cannot be restarted"
                            )));
                        }
                        _ => {}
                    }
                }
                let context = ids
                    .last()
                    .and_then(|id| store.job_executions.get(id))
                    .map(|last| last.execution_context.clone())
                    .unwrap_or_default();
                (instance, context)
            }
            None => {
                let instance = JobInstance::new(job_name, params.clone());
                store.instances.insert(key.clone(), instance.clone());
                (instance, Default::default())
            }
        };

        let mut execution = JobExecution::new(instance);
        execution.execution_context = context;
        execution.last_updated = Some(Utc::now());

        store
            .job_executions_by_instance
            .entry(execution.job_instance.id)
            .or_default()
            .push(execution.id);
        store.job_executions.insert(execution.id, execution.clone());

        debug!(job = %key, execution_id = %execution.id, "Created job execution");
        Ok(execution)
    }

    async fn update_job_execution(&self, execution: &mut JobExecution) -> BatchResult<()> {
        let mut store = self.store.write();
        let Some(stored) = store.job_executions.get_mut(&execution.id) else {
            return Err(BatchError::Repository(format!(
                "job execution {} must be created before it is updated",
                execution.id
            )));
        };

        if execution.status.is_running() {
            execution.status = execution.status.upgrade_to(stored.status);
        }
        execution.last_updated = Some(Utc::now());

        let mut copy = execution.clone();
        copy.step_executions.clear();
        *stored = copy;
        Ok(())
    }

    async fn update_job_execution_context(&self, execution: &JobExecution) -> BatchResult<()> {
        let mut store = self.store.write();
        let stored = store.job_executions.get_mut(&execution.id).ok_or_else(|| {
            BatchError::Repository(format!("unknown job execution {}", execution.id))
        })?;
        stored.execution_context = execution.execution_context.clone();
        Ok(())
    }

    async fn add_step_execution(&self, execution: &mut StepExecution) -> BatchResult<()> {
        let mut store = self.store.write();
        if !store.job_executions.contains_key(&execution.job_execution_id) {
            return Err(BatchError::Repository(format!(
                "step execution '{}' belongs to unknown job execution {}",
                execution.step_name, execution.job_execution_id
            )));
        }

        execution.last_updated = Some(Utc::now());
        store
            .step_executions_by_job
            .entry(execution.job_execution_id)
            .or_default()
            .push(execution.id);
        store.step_executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn update_step_execution(&self, execution: &mut StepExecution) -> BatchResult<()> {
        let mut store = self.store.write();
        if !store.step_executions.contains_key(&execution.id) {
            return Err(BatchError::Repository(format!(
                "step execution '{}' must be added before it is updated",
                execution.step_name
            )));
        }

        let job_stopping = store
            .job_executions
            .get(&execution.job_execution_id)
            .is_some_and(|job| job.status == BatchStatus::Stopping);
        if job_stopping && !execution.is_terminate_only() {
            debug!(step = %execution.step_name, "Job is stopping, flagging step to terminate");
            execution.set_terminate_only();
        }

        execution.last_updated = Some(Utc::now());
        store.step_executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn update_execution_context(&self, execution: &StepExecution) -> BatchResult<()> {
        let mut store = self.store.write();
        let stored = store.step_executions.get_mut(&execution.id).ok_or_else(|| {
            BatchError::Repository(format!("unknown step execution '{}'", execution.step_name))
        })?;
        stored.execution_context = execution.execution_context.clone();
        Ok(())
    }

    async fn get_last_step_execution(
        &self,
        instance: &JobInstance,
        step_name: &str,
    ) -> BatchResult<Option<StepExecution>> {
        let store = self.store.read();
        let last = store.step_executions_of(instance, step_name).last().cloned();
        Ok(last)
    }

    async fn get_step_execution_count(
        &self,
        instance: &JobInstance,
        step_name: &str,
    ) -> BatchResult<usize> {
        let store = self.store.read();
        let count = store.step_executions_of(instance, step_name).count();
        Ok(count)
    }

    async fn get_step_execution(
        &self,
        job_execution_id: Uuid,
        step_execution_id: Uuid,
    ) -> BatchResult<Option<StepExecution>> {
        let store = self.store.read();
        Ok(store
            .step_executions
            .get(&step_execution_id)
            .filter(|step| step.job_execution_id == job_execution_id)
            .cloned())
    }

    async fn get_job_execution(&self, id: Uuid) -> BatchResult<Option<JobExecution>> {
        Ok(self.store.read().job_execution(id))
    }

    async fn get_last_job_execution(
        &self,
        job_name: &str,
        params: &JobParameters,
    ) -> BatchResult<Option<JobExecution>> {
        let store = self.store.read();
        let last = store
            .instances
            .get(&Store::instance_key(job_name, params))
            .and_then(|instance| store.job_executions_by_instance.get(&instance.id))
            .and_then(|ids| ids.last())
            .and_then(|id| store.job_execution(*id));
        Ok(last)
    }

    async fn find_running_executions(&self, job_name: &str) -> BatchResult<Vec<JobExecution>> {
        let store = self.store.read();
        let ids: Vec<Uuid> = store
            .job_executions
            .values()
            .filter(|execution| execution.job_name() == job_name && execution.is_running())
            .map(|execution| execution.id)
            .collect();
        Ok(ids.into_iter().filter_map(|id| store.job_execution(id)).collect())
    }
}
