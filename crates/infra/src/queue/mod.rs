//! Execution backends.
//!
//! A [`Queue`] decides when and where a job instance runs. Two backends exist:
//!
//! - [`cron::CronQueue`]: forks the current executable, or writes a crontab line
//!   that re-invokes it at the scheduled time.
//! - [`lease::LeaseQueue`]: inserts a row into a shared lease table consumed by
//!   long-lived worker tasks.
//!
//! Both delegate the actual execution to the shared [`Runner`](crate::jobs::Runner).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use jobworks_core::{WorkerResult, deferred_until};

use crate::jobs::{JobInstance, JobRegistry, RunOutcome};

pub mod cron;
pub mod lease;

/// Pluggable execution backend.
///
/// Errors from `enqueue`, `kill` and `remove` are returned to the caller as is.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Schedule the first execution of `instance`.
    ///
    /// An instance whose arguments carry a schedule beyond the minimal lead
    /// time is persisted as `Scheduled` and dispatched later.
    async fn enqueue(&self, instance: Arc<JobInstance>) -> WorkerResult<()>;

    /// Execute the handler for `instance` in the current process.
    async fn run(&self, ctx: CancellationToken, instance: Arc<JobInstance>) -> WorkerResult<RunOutcome>;

    /// Stop a running instance, or drop one that has not started.
    ///
    /// Fails with `InvalidState` for an instance that already ended.
    async fn kill(&self, instance: Arc<JobInstance>) -> WorkerResult<()>;

    /// Drop a `New`/`Scheduled` instance before it runs.
    ///
    /// Fails with `InvalidState` for a running or ended instance.
    async fn remove(&self, instance: Arc<JobInstance>) -> WorkerResult<()>;

    /// Start consuming work, if this backend has long-lived consumers.
    async fn listen(&self) -> WorkerResult<()> {
        Ok(())
    }

    /// Stop consuming work and wait for in-flight handlers.
    async fn shutdown(&self) -> WorkerResult<()> {
        Ok(())
    }
}

/// When `instance` should run, if later than the minimal lead time from `now`.
pub(crate) fn deferred_run_time(
    registry: &JobRegistry,
    instance: &JobInstance,
    now: DateTime<Utc>,
) -> WorkerResult<Option<DateTime<Utc>>> {
    let definition = registry.resolve(instance.job_name())?;
    Ok(deferred_until(definition.schedule_time(instance.args())?, now))
}
