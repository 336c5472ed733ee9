//! Runtime view of a job instance: guarded mutable state, heartbeat persistence
//! and the handle given to job handlers.
//!
//! ## Save discipline
//!
//! Every setter mutates the state under the instance mutex. While the heartbeat
//! is accepting, the heartbeat task persists the state on each tick; otherwise the
//! setter saves synchronously before releasing the mutex. The accepting flag is
//! only flipped while the mutex is held, and stopping the heartbeat performs one
//! last save under the same lock, so no mutation can fall between the two modes.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use jobworks_core::{InstanceId, JobId, JobStatus, WorkerError, WorkerResult};

use super::store::JobStore;
use super::types::{InstanceRecord, InstanceState};

struct Heartbeat {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// A job instance loaded into memory.
pub struct JobInstance {
    id: InstanceId,
    job_id: JobId,
    job_name: String,
    args: JsonValue,
    operator: Option<String>,
    created_at: DateTime<Utc>,
    state: Mutex<InstanceState>,
    accepting_heartbeat: AtomicBool,
    heartbeat: std::sync::Mutex<Option<Heartbeat>>,
    store: Arc<dyn JobStore>,
}

impl std::fmt::Debug for JobInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobInstance")
            .field("id", &self.id)
            .field("job_id", &self.job_id)
            .field("job_name", &self.job_name)
            .finish_non_exhaustive()
    }
}

impl JobInstance {
    pub fn from_record(record: InstanceRecord, store: Arc<dyn JobStore>) -> Arc<Self> {
        Arc::new(Self {
            id: record.id,
            job_id: record.job_id,
            job_name: record.job_name,
            args: record.args,
            operator: record.operator,
            created_at: record.created_at,
            state: Mutex::new(record.state),
            accepting_heartbeat: AtomicBool::new(false),
            heartbeat: std::sync::Mutex::new(None),
            store,
        })
    }

    /// Load an instance from the store.
    pub async fn load(store: Arc<dyn JobStore>, instance_id: InstanceId) -> WorkerResult<Arc<Self>> {
        let record = store.get_instance(instance_id).await?;
        Ok(Self::from_record(record, store))
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn args(&self) -> &JsonValue {
        &self.args
    }

    pub fn operator(&self) -> Option<&str> {
        self.operator.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Copy of the current in-memory state.
    pub async fn snapshot(&self) -> InstanceState {
        self.state.lock().await.clone()
    }

    pub async fn status(&self) -> JobStatus {
        self.state.lock().await.status
    }

    /// Record as it would be stored right now.
    pub async fn to_record(&self) -> InstanceRecord {
        InstanceRecord {
            id: self.id,
            job_id: self.job_id,
            job_name: self.job_name.clone(),
            args: self.args.clone(),
            operator: self.operator.clone(),
            state: self.snapshot().await,
            created_at: self.created_at,
        }
    }

    pub fn is_heartbeat_active(&self) -> bool {
        self.accepting_heartbeat.load(Ordering::Acquire)
    }

    async fn mutate<F>(&self, f: F) -> WorkerResult<()>
    where
        F: FnOnce(&mut InstanceState) -> WorkerResult<()>,
    {
        let mut state = self.state.lock().await;
        f(&mut state)?;
        if !self.accepting_heartbeat.load(Ordering::Acquire) {
            self.store.save_instance(self.id, &state).await?;
        }
        Ok(())
    }

    /// Move to `next`, failing with `InvalidState` on an illegal transition.
    pub async fn set_status(&self, next: JobStatus) -> WorkerResult<()> {
        self.mutate(|state| state.set_status(next)).await
    }

    pub async fn set_progress(&self, progress: u32) -> WorkerResult<()> {
        self.mutate(|state| {
            state.set_progress(progress);
            Ok(())
        })
        .await
    }

    pub async fn set_progress_text(&self, text: impl Into<String>) -> WorkerResult<()> {
        let text = text.into();
        self.mutate(|state| {
            state.progress_text = text;
            Ok(())
        })
        .await
    }

    pub async fn add_log(&self, line: impl Display) -> WorkerResult<()> {
        let line = line.to_string();
        self.mutate(|state| {
            state.append_log(&line);
            Ok(())
        })
        .await
    }

    /// Claim the instance for execution.
    ///
    /// Refreshes the state from the store, checks that it is `New` or `Scheduled`
    /// and moves it to `Running` with a store-level compare-and-set, so that two
    /// dispatches of the same instance (in any process) start it at most once.
    pub async fn begin_run(&self) -> WorkerResult<()> {
        let mut state = self.state.lock().await;
        *state = self.store.get_instance(self.id).await?.state;

        let current = state.status;
        current.ensure_dispatchable()?;

        if !self
            .store
            .compare_and_set_status(self.id, current, JobStatus::Running)
            .await?
        {
            *state = self.store.get_instance(self.id).await?.state;
            return Err(WorkerError::invalid_state(
                state.status,
                "invalid job status for dispatch",
            ));
        }

        state.status = JobStatus::Running;
        Ok(())
    }

    /// Move the stored instance to `Killed` on behalf of another actor and log
    /// `reason`.
    ///
    /// The status change is a compare-and-set against the stored status, and the
    /// log line is appended to the freshly loaded state, so progress and log
    /// written by the running process are kept. Not for use from the process
    /// running the instance; that one uses [`set_status`](Self::set_status).
    pub async fn mark_killed(&self, reason: &str) -> WorkerResult<()> {
        let mut state = self.state.lock().await;
        let current = self.store.get_instance(self.id).await?.state.status;
        current.transition(JobStatus::Killed)?;

        if !self
            .store
            .compare_and_set_status(self.id, current, JobStatus::Killed)
            .await?
        {
            *state = self.store.get_instance(self.id).await?.state;
            return Err(WorkerError::invalid_state(
                state.status,
                "job status changed while killing it",
            ));
        }

        let mut fresh = self.store.get_instance(self.id).await?.state;
        fresh.append_log(reason);
        self.store.save_instance(self.id, &fresh).await?;
        *state = fresh;
        Ok(())
    }

    /// Start periodic persistence. A second call while running is a no-op.
    pub async fn start_heartbeat(self: &Arc<Self>, interval: Duration) {
        let _state = self.state.lock().await;
        if self.accepting_heartbeat.swap(true, Ordering::AcqRel) {
            return;
        }

        let stop = CancellationToken::new();
        let instance = Arc::clone(self);
        let task = tokio::spawn(instance.heartbeat_loop(interval, stop.clone()));

        *self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner) = Some(Heartbeat { stop, task });
        debug!(instance_id = %self.id, ?interval, "heartbeat started");
    }

    async fn heartbeat_loop(self: Arc<Self>, interval: Duration, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let state = self.state.lock().await;
                    if !self.accepting_heartbeat.load(Ordering::Acquire) {
                        break;
                    }
                    if let Err(err) = self.store.save_instance(self.id, &state).await {
                        warn!(instance_id = %self.id, error = %err, "heartbeat save failed");
                    }
                }
            }
        }
    }

    /// Stop the heartbeat and persist the current state.
    ///
    /// Always saves, even when no heartbeat was running.
    pub async fn stop_heartbeat(&self) -> WorkerResult<()> {
        let (saved, heartbeat) = {
            let state = self.state.lock().await;
            self.accepting_heartbeat.store(false, Ordering::Release);
            let saved = self.store.save_instance(self.id, &state).await;
            let heartbeat = self
                .heartbeat
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            (saved, heartbeat)
        };

        if let Some(Heartbeat { stop, task }) = heartbeat {
            stop.cancel();
            if let Err(err) = task.await {
                warn!(instance_id = %self.id, error = %err, "heartbeat task ended abnormally");
            }
            debug!(instance_id = %self.id, "heartbeat stopped");
        }

        saved.map_err(Into::into)
    }
}

/// What a job handler sees of its instance.
#[derive(Debug, Clone)]
pub struct JobHandle {
    instance: Arc<JobInstance>,
}

impl JobHandle {
    pub fn new(instance: Arc<JobInstance>) -> Self {
        Self { instance }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance.id()
    }

    pub fn job_id(&self) -> JobId {
        self.instance.job_id()
    }

    pub fn job_name(&self) -> &str {
        self.instance.job_name()
    }

    pub fn operator(&self) -> Option<&str> {
        self.instance.operator()
    }

    /// Decode the arguments into the job's argument type.
    pub fn argument<T: DeserializeOwned>(&self) -> WorkerResult<T> {
        jobworks_core::args::decode(self.instance.args())
    }

    pub fn raw_argument(&self) -> &JsonValue {
        self.instance.args()
    }

    /// Set progress; values above 100 are clamped.
    pub async fn set_progress(&self, progress: u32) -> WorkerResult<()> {
        self.instance.set_progress(progress).await
    }

    pub async fn set_progress_text(&self, text: impl Into<String>) -> WorkerResult<()> {
        self.instance.set_progress_text(text).await
    }

    pub async fn add_log(&self, line: impl Display) -> WorkerResult<()> {
        self.instance.add_log(line).await
    }
}
