//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use jobworks_core::{InstanceId, JobId, JobStatus, WorkerError};

use super::types::{InstanceRecord, InstanceState, JobRecord};

/// Durable home of jobs and their instances.
///
/// `save_instance` and `compare_and_set_status` mirror the new status onto the
/// owning job, so a job reports its latest instance's status.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a freshly created job.
    async fn create_job(&self, job: &JobRecord) -> Result<(), JobStoreError>;

    async fn get_job(&self, job_id: JobId) -> Result<JobRecord, JobStoreError>;

    /// Persist a new instance and make it the job's latest one.
    async fn create_instance(&self, instance: &InstanceRecord) -> Result<(), JobStoreError>;

    /// Overwrite the job's denormalized status.
    async fn update_job_status(&self, job_id: JobId, status: JobStatus) -> Result<(), JobStoreError>;

    async fn get_instance(&self, instance_id: InstanceId) -> Result<InstanceRecord, JobStoreError>;

    /// Most recently created instance of a job.
    async fn latest_instance(&self, job_id: JobId) -> Result<InstanceRecord, JobStoreError>;

    /// Overwrite the mutable part of an instance.
    async fn save_instance(
        &self,
        instance_id: InstanceId,
        state: &InstanceState,
    ) -> Result<(), JobStoreError>;

    /// Atomically move `instance_id` from `expected` to `next`.
    ///
    /// Returns `false` without writing when the stored status is not `expected`.
    async fn compare_and_set_status(
        &self,
        instance_id: InstanceId,
        expected: JobStatus,
        next: JobStatus,
    ) -> Result<bool, JobStoreError>;

    /// Newest jobs first.
    async fn list_jobs(&self, limit: usize) -> Result<Vec<JobRecord>, JobStoreError>;

    /// All instances of a job, oldest first.
    async fn list_instances(&self, job_id: JobId) -> Result<Vec<InstanceRecord>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    pub fn job_not_found(job_id: JobId) -> Self {
        Self::NotFound(format!("job {job_id}"))
    }

    pub fn instance_not_found(instance_id: InstanceId) -> Self {
        Self::NotFound(format!("job instance {instance_id}"))
    }
}

impl From<JobStoreError> for WorkerError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(what) => WorkerError::not_found(what),
            JobStoreError::Storage(msg) => WorkerError::storage(msg),
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<JobId, JobRecord>,
    instances: HashMap<InstanceId, InstanceRecord>,
    /// Instance ids per job in creation order.
    history: HashMap<JobId, Vec<InstanceId>>,
}

impl Tables {
    fn mirror_status(&mut self, job_id: JobId, status: JobStatus) {
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.status = status;
        }
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    tables: RwLock<Tables>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, JobStoreError> {
        self.tables
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, JobStoreError> {
        self.tables
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, job: &JobRecord) -> Result<(), JobStoreError> {
        let mut tables = self.write()?;
        if tables.jobs.contains_key(&job.id) {
            return Err(JobStoreError::Storage(format!("job {} already exists", job.id)));
        }
        tables.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> Result<JobRecord, JobStoreError> {
        self.read()?
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| JobStoreError::job_not_found(job_id))
    }

    async fn create_instance(&self, instance: &InstanceRecord) -> Result<(), JobStoreError> {
        let mut tables = self.write()?;
        if !tables.jobs.contains_key(&instance.job_id) {
            return Err(JobStoreError::job_not_found(instance.job_id));
        }
        if tables.instances.contains_key(&instance.id) {
            return Err(JobStoreError::Storage(format!(
                "job instance {} already exists",
                instance.id
            )));
        }
        tables.instances.insert(instance.id, instance.clone());
        tables.history.entry(instance.job_id).or_default().push(instance.id);
        Ok(())
    }

    async fn update_job_status(&self, job_id: JobId, status: JobStatus) -> Result<(), JobStoreError> {
        let mut tables = self.write()?;
        let job = tables
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| JobStoreError::job_not_found(job_id))?;
        job.status = status;
        Ok(())
    }

    async fn get_instance(&self, instance_id: InstanceId) -> Result<InstanceRecord, JobStoreError> {
        self.read()?
            .instances
            .get(&instance_id)
            .cloned()
            .ok_or_else(|| JobStoreError::instance_not_found(instance_id))
    }

    async fn latest_instance(&self, job_id: JobId) -> Result<InstanceRecord, JobStoreError> {
        let tables = self.read()?;
        tables
            .history
            .get(&job_id)
            .and_then(|ids| ids.last())
            .and_then(|id| tables.instances.get(id))
            .cloned()
            .ok_or_else(|| JobStoreError::NotFound(format!("instance of job {job_id}")))
    }

    async fn save_instance(
        &self,
        instance_id: InstanceId,
        state: &InstanceState,
    ) -> Result<(), JobStoreError> {
        let mut tables = self.write()?;
        let instance = tables
            .instances
            .get_mut(&instance_id)
            .ok_or_else(|| JobStoreError::instance_not_found(instance_id))?;
        instance.state = state.clone();
        let job_id = instance.job_id;
        tables.mirror_status(job_id, state.status);
        Ok(())
    }

    async fn compare_and_set_status(
        &self,
        instance_id: InstanceId,
        expected: JobStatus,
        next: JobStatus,
    ) -> Result<bool, JobStoreError> {
        let mut tables = self.write()?;
        let instance = tables
            .instances
            .get_mut(&instance_id)
            .ok_or_else(|| JobStoreError::instance_not_found(instance_id))?;
        if instance.state.status != expected {
            return Ok(false);
        }
        instance.state.status = next;
        let job_id = instance.job_id;
        tables.mirror_status(job_id, next);
        Ok(true)
    }

    async fn list_jobs(&self, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        let tables = self.read()?;
        let mut result: Vec<_> = tables.jobs.values().cloned().collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        result.truncate(limit);
        Ok(result)
    }

    async fn list_instances(&self, job_id: JobId) -> Result<Vec<InstanceRecord>, JobStoreError> {
        let tables = self.read()?;
        if !tables.jobs.contains_key(&job_id) {
            return Err(JobStoreError::job_not_found(job_id));
        }
        Ok(tables
            .history
            .get(&job_id)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.instances.get(id).cloned())
            .collect())
    }
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn create_job(&self, job: &JobRecord) -> Result<(), JobStoreError> {
        (**self).create_job(job).await
    }

    async fn get_job(&self, job_id: JobId) -> Result<JobRecord, JobStoreError> {
        (**self).get_job(job_id).await
    }

    async fn create_instance(&self, instance: &InstanceRecord) -> Result<(), JobStoreError> {
        (**self).create_instance(instance).await
    }

    async fn update_job_status(&self, job_id: JobId, status: JobStatus) -> Result<(), JobStoreError> {
        (**self).update_job_status(job_id, status).await
    }

    async fn get_instance(&self, instance_id: InstanceId) -> Result<InstanceRecord, JobStoreError> {
        (**self).get_instance(instance_id).await
    }

    async fn latest_instance(&self, job_id: JobId) -> Result<InstanceRecord, JobStoreError> {
        (**self).latest_instance(job_id).await
    }

    async fn save_instance(
        &self,
        instance_id: InstanceId,
        state: &InstanceState,
    ) -> Result<(), JobStoreError> {
        (**self).save_instance(instance_id, state).await
    }

    async fn compare_and_set_status(
        &self,
        instance_id: InstanceId,
        expected: JobStatus,
        next: JobStatus,
    ) -> Result<bool, JobStoreError> {
        (**self).compare_and_set_status(instance_id, expected, next).await
    }

    async fn list_jobs(&self, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).list_jobs(limit).await
    }

    async fn list_instances(&self, job_id: JobId) -> Result<Vec<InstanceRecord>, JobStoreError> {
        (**self).list_instances(job_id).await
    }
}
