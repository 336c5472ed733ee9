//! The job worker facade: submission and lifecycle commands over one backend.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use jobworks_core::{InstanceId, JobId, JobStatus, WorkerError, WorkerResult, args::encode};

use crate::jobs::{
    InstanceRecord, JobInstance, JobRecord, JobRegistry, JobStore, Registry, Runner, RunnerConfig,
};
use crate::queue::Queue;
use crate::queue::cron::{ChildExit, CronQueue, ProcessControl, SchedulingSideChannel};
use crate::queue::lease::{LeaseQueue, LeaseStore, LeaseWorkerConfig};

enum Backend {
    Cron(Arc<CronQueue>),
    Lease(Arc<LeaseQueue>),
}

impl Backend {
    fn queue(&self) -> &dyn Queue {
        match self {
            Backend::Cron(queue) => &**queue,
            Backend::Lease(queue) => &**queue,
        }
    }
}

enum BackendChoice {
    Cron {
        crontab: Arc<dyn SchedulingSideChannel>,
        processes: Arc<dyn ProcessControl>,
    },
    Lease {
        store: Arc<dyn LeaseStore>,
        config: LeaseWorkerConfig,
    },
}

/// Builder for [`Worker`]. Exactly one backend must be chosen.
pub struct WorkerBuilder {
    store: Arc<dyn JobStore>,
    registry: Registry,
    runner_config: RunnerConfig,
    backend: Option<BackendChoice>,
}

impl WorkerBuilder {
    pub fn runner_config(mut self, config: RunnerConfig) -> Self {
        self.runner_config = config;
        self
    }

    /// Use the local cron backend.
    pub fn with_cron(
        mut self,
        crontab: Arc<dyn SchedulingSideChannel>,
        processes: Arc<dyn ProcessControl>,
    ) -> Self {
        self.backend = Some(BackendChoice::Cron { crontab, processes });
        self
    }

    /// Use the distributed lease backend.
    pub fn with_lease(mut self, store: Arc<dyn LeaseStore>, config: LeaseWorkerConfig) -> Self {
        self.backend = Some(BackendChoice::Lease { store, config });
        self
    }

    /// Seal the registry and assemble the worker.
    pub fn build(self) -> WorkerResult<Worker> {
        let choice = self
            .backend
            .ok_or_else(|| WorkerError::configuration("no execution backend configured"))?;
        if self.registry.is_empty() {
            return Err(WorkerError::configuration("no job definitions registered"));
        }

        let registry = self.registry.seal();
        let runner = Runner::new(Arc::clone(&registry), Arc::clone(&self.store), self.runner_config);
        let backend = match choice {
            BackendChoice::Cron { crontab, processes } => {
                Backend::Cron(Arc::new(CronQueue::new(runner.clone(), crontab, processes)))
            }
            BackendChoice::Lease { store, config } => {
                Backend::Lease(Arc::new(LeaseQueue::new(runner.clone(), store, config)))
            }
        };

        info!(
            backend = backend.queue().name(),
            jobs = registry.names().count(),
            "worker assembled"
        );
        Ok(Worker {
            store: self.store,
            registry,
            runner,
            backend,
        })
    }
}

/// Submits jobs and drives their instances through the configured backend.
pub struct Worker {
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
    runner: Runner,
    backend: Backend,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("backend", &self.queue().name())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn builder(store: Arc<dyn JobStore>, registry: Registry) -> WorkerBuilder {
        WorkerBuilder {
            store,
            registry,
            runner_config: RunnerConfig::default(),
            backend: None,
        }
    }

    pub fn queue(&self) -> &dyn Queue {
        self.backend.queue()
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Create a job and its first instance, then hand it to the backend.
    #[instrument(skip(self, args), fields(job_name = %name), err)]
    pub async fn create_job(
        &self,
        name: &str,
        args: JsonValue,
        operator: Option<String>,
    ) -> WorkerResult<JobRecord> {
        let definition = self.registry.resolve(name)?;
        definition.validate_args(&args)?;

        let job = JobRecord::new(definition.name());
        self.store.create_job(&job).await?;
        let record = InstanceRecord::new(&job, args, operator);
        self.store.create_instance(&record).await?;

        let instance = self.instance(record);
        self.queue().enqueue(instance).await?;
        info!(job_id = %job.id, "job submitted");
        Ok(job)
    }

    /// [`create_job`](Self::create_job) with typed arguments.
    pub async fn submit<T: Serialize + ?Sized>(
        &self,
        name: &str,
        args: &T,
        operator: Option<String>,
    ) -> WorkerResult<JobRecord> {
        self.create_job(name, encode(args)?, operator).await
    }

    /// Stop the job's latest instance: kill it if it runs, drop it if it waits.
    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn abort_job(&self, job_id: JobId) -> WorkerResult<()> {
        let instance = self.latest(job_id).await?;
        match instance.status().await {
            JobStatus::Running => self.queue().kill(instance).await,
            JobStatus::New | JobStatus::Scheduled => self.queue().remove(instance).await,
            status => Err(WorkerError::invalid_state(status, "job cannot be aborted")),
        }
    }

    /// Run a finished job again as a new instance with the same arguments.
    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn rerun_job(&self, job_id: JobId) -> WorkerResult<InstanceId> {
        let previous = self.store.latest_instance(job_id).await?;
        if !previous.state.status.is_terminal() {
            return Err(WorkerError::invalid_state(
                previous.state.status,
                "only a finished job can be rerun",
            ));
        }
        self.registry.resolve(&previous.job_name)?;

        let job = self.store.get_job(job_id).await?;
        self.start_instance(&job, previous.args, previous.operator).await
    }

    /// Replace the arguments of a job that has not started yet.
    #[instrument(skip(self, args), fields(job_id = %job_id), err)]
    pub async fn update_job(&self, job_id: JobId, args: JsonValue) -> WorkerResult<InstanceId> {
        let job = self.store.get_job(job_id).await?;
        self.registry.resolve(&job.name)?.validate_args(&args)?;

        let current = self.latest(job_id).await?;
        let status = current.status().await;
        if !status.is_dispatchable() {
            return Err(WorkerError::invalid_state(status, "only a pending job can be updated"));
        }
        let operator = current.operator().map(str::to_string);
        self.queue().remove(current).await?;

        self.start_instance(&job, args, operator).await
    }

    /// Administrative cancel of a job that has not started.
    ///
    /// Scheduling metadata stays in place; a later dispatch finds the instance
    /// `Cancelled` and discards it.
    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn cancel_job(&self, job_id: JobId) -> WorkerResult<()> {
        let instance = self.latest(job_id).await?;
        instance.set_status(JobStatus::Cancelled).await?;
        instance.add_log("job cancelled").await
    }

    /// Run one instance in this process to completion.
    ///
    /// This is what a `--job-instance` process does.
    pub async fn run_instance(&self, instance_id: InstanceId) -> WorkerResult<ChildExit> {
        match &self.backend {
            Backend::Cron(queue) => queue.run_instance(instance_id).await,
            Backend::Lease(queue) => {
                let instance = self.runner.load_instance(instance_id).await?;
                queue
                    .run(CancellationToken::new(), instance)
                    .await
                    .map(ChildExit::Finished)
            }
        }
    }

    pub async fn listen(&self) -> WorkerResult<()> {
        self.queue().listen().await
    }

    pub async fn shutdown(&self) -> WorkerResult<()> {
        self.queue().shutdown().await
    }

    pub async fn job(&self, job_id: JobId) -> WorkerResult<JobRecord> {
        Ok(self.store.get_job(job_id).await?)
    }

    pub async fn latest_instance(&self, job_id: JobId) -> WorkerResult<InstanceRecord> {
        Ok(self.store.latest_instance(job_id).await?)
    }

    pub async fn list_jobs(&self, limit: usize) -> WorkerResult<Vec<JobRecord>> {
        Ok(self.store.list_jobs(limit).await?)
    }

    pub async fn list_instances(&self, job_id: JobId) -> WorkerResult<Vec<InstanceRecord>> {
        Ok(self.store.list_instances(job_id).await?)
    }

    async fn start_instance(
        &self,
        job: &JobRecord,
        args: JsonValue,
        operator: Option<String>,
    ) -> WorkerResult<InstanceId> {
        let record = InstanceRecord::new(job, args, operator);
        self.store.create_instance(&record).await?;
        self.store.update_job_status(job.id, JobStatus::New).await?;

        let instance_id = record.id;
        self.queue().enqueue(self.instance(record)).await?;
        info!(job_id = %job.id, instance_id = %instance_id, "job instance started");
        Ok(instance_id)
    }

    async fn latest(&self, job_id: JobId) -> WorkerResult<Arc<JobInstance>> {
        let record = self.store.latest_instance(job_id).await?;
        Ok(self.instance(record))
    }

    fn instance(&self, record: InstanceRecord) -> Arc<JobInstance> {
        JobInstance::from_record(record, Arc::clone(&self.store))
    }
}
