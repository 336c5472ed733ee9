//! Local cron backend.
//!
//! Immediate work is started by re-executing the current binary with
//! `--job-instance <id>`; deferred work becomes a crontab line that does the same
//! at the scheduled wall-clock minute. Each job owns at most one crontab block,
//! which also records the PID of the process running it.

mod crontab;
mod process;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Local, TimeZone, Timelike, Utc};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use jobworks_core::{InstanceId, JobStatus, WorkerError, WorkerResult};

use super::{Queue, deferred_run_time};
use crate::jobs::{JobInstance, RunOutcome, Runner};

pub use crontab::{CronEntry, CrontabDocument, InMemorySideChannel, SchedulingSideChannel, SystemCrontab};
pub use process::{JOB_INSTANCE_FLAG, ProcessControl, SelfExec};

#[cfg(test)]
pub(crate) use process::fake::RecordingProcesses;

/// Crontab time fields (`minute hour day month *`) for `at` in `tz`.
pub fn cron_fields<Tz: TimeZone>(at: DateTime<Utc>, tz: &Tz) -> String {
    let local = at.with_timezone(tz);
    format!(
        "{} {} {} {} *",
        local.minute(),
        local.hour(),
        local.day(),
        local.month()
    )
}

/// How a `--job-instance` process ended.
#[derive(Debug)]
pub enum ChildExit {
    /// The runner returned.
    Finished(RunOutcome),
    /// SIGINT/SIGTERM arrived first.
    Signalled { signo: i32, name: &'static str },
}

impl ChildExit {
    /// Process exit code: 0 on success, 1 on failure, 128+n after signal n.
    pub fn exit_code(&self) -> i32 {
        match self {
            ChildExit::Finished(outcome) if outcome.is_success() => 0,
            ChildExit::Finished(_) => 1,
            ChildExit::Signalled { signo, .. } => 128 + signo,
        }
    }

    pub fn error(&self) -> Option<WorkerError> {
        match self {
            ChildExit::Finished(outcome) => outcome.error(),
            ChildExit::Signalled { name, .. } => Some(WorkerError::invalid_state(
                JobStatus::Killed,
                format!("worker killed by signal {name}"),
            )),
        }
    }
}

/// Queue backed by the user crontab and forked processes.
pub struct CronQueue {
    runner: Runner,
    crontab: Arc<dyn SchedulingSideChannel>,
    processes: Arc<dyn ProcessControl>,
    /// Serializes read-modify-write cycles on the crontab within this process.
    edit: Mutex<()>,
}

impl CronQueue {
    pub fn new(
        runner: Runner,
        crontab: Arc<dyn SchedulingSideChannel>,
        processes: Arc<dyn ProcessControl>,
    ) -> Self {
        Self {
            runner,
            crontab,
            processes,
            edit: Mutex::new(()),
        }
    }

    /// Entry point of a `--job-instance` process.
    ///
    /// Claims the instance, records this process as its runner, runs it, and
    /// removes the instance's crontab block however the run ends. A process that
    /// loses the claim leaves the block alone.
    #[instrument(skip(self), fields(instance_id = %instance_id), err)]
    pub async fn run_instance(&self, instance_id: InstanceId) -> WorkerResult<ChildExit> {
        let mut interrupt = signal(SignalKind::interrupt())
            .map_err(|e| WorkerError::backend(format!("cannot install SIGINT handler: {e}")))?;
        let mut terminate = signal(SignalKind::terminate())
            .map_err(|e| WorkerError::backend(format!("cannot install SIGTERM handler: {e}")))?;

        let signalled = async move {
            tokio::select! {
                Some(()) = interrupt.recv() => (libc::SIGINT, "interrupt"),
                Some(()) = terminate.recv() => (libc::SIGTERM, "terminated"),
                else => std::future::pending().await,
            }
        };
        self.run_until_signal(instance_id, signalled).await
    }

    async fn run_until_signal<S>(&self, instance_id: InstanceId, signalled: S) -> WorkerResult<ChildExit>
    where
        S: Future<Output = (i32, &'static str)>,
    {
        let instance = self.runner.load_instance(instance_id).await?;
        let claimed = self.runner.claim(Arc::clone(&instance)).await?;

        if let Err(err) = self.record_pid(&instance, std::process::id()).await {
            warn!(error = %err, "failed to record job process in crontab");
        }

        let ctx = CancellationToken::new();
        let exit = tokio::select! {
            result = self.runner.execute(ctx.clone(), claimed) => result.map(ChildExit::Finished),
            (signo, name) = signalled => Ok(ChildExit::Signalled { signo, name }),
        };

        let recorded = match &exit {
            Ok(ChildExit::Signalled { name, .. }) => {
                ctx.cancel();
                self.record_signal(&instance, name).await
            }
            _ => Ok(()),
        };

        if let Err(err) = self.forget_instance(instance_id).await {
            warn!(error = %err, "failed to remove crontab entry");
        }
        recorded.and(exit)
    }

    async fn record_pid(&self, instance: &JobInstance, pid: u32) -> WorkerResult<()> {
        let _edit = self.edit.lock().await;
        let mut doc = self.crontab.read().await?;
        let entry = match doc.find(instance.job_id()) {
            Some(entry) if entry.instance_id == instance.id() => CronEntry {
                pid: Some(pid),
                ..entry.clone()
            },
            _ => CronEntry::forked(instance.job_id(), instance.id(), pid),
        };
        doc.upsert(entry);
        self.crontab.write(&doc).await
    }

    /// Record the signal on the instance. Every step runs; the first error wins.
    async fn record_signal(&self, instance: &JobInstance, name: &str) -> WorkerResult<()> {
        let message = format!("Worker killed by signal {name}");
        warn!(instance_id = %instance.id(), "{message}");

        let text = instance.set_progress_text(message.as_str()).await;
        let log = instance.add_log(&message).await;
        let status = match instance.set_status(JobStatus::Killed).await {
            Err(err) if err.current_status().is_some_and(|s| s.is_terminal()) => Ok(()),
            other => other,
        };
        let stopped = instance.stop_heartbeat().await;
        text.and(log).and(status).and(stopped)
    }

    async fn forget_instance(&self, instance_id: InstanceId) -> WorkerResult<()> {
        let _edit = self.edit.lock().await;
        let mut doc = self.crontab.read().await?;
        if doc.remove_instance(instance_id).is_some() {
            self.crontab.write(&doc).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Queue for CronQueue {
    fn name(&self) -> &'static str {
        "cron"
    }

    #[instrument(skip(self, instance), fields(instance_id = %instance.id(), job_name = %instance.job_name()), err)]
    async fn enqueue(&self, instance: Arc<JobInstance>) -> WorkerResult<()> {
        let deferred = deferred_run_time(self.runner.registry(), &instance, Utc::now())?;

        let _edit = self.edit.lock().await;
        let mut doc = self.crontab.read().await?;

        match deferred {
            Some(at) => {
                let command = format!(
                    "{} {}",
                    cron_fields(at, &Local),
                    self.processes.command_line(instance.id())
                );
                doc.upsert(CronEntry::scheduled(instance.job_id(), instance.id(), command));
                self.crontab.write(&doc).await?;
                instance.set_status(JobStatus::Scheduled).await?;
                info!(run_at = %at, "job scheduled in crontab");
            }
            None => {
                let pid = self.processes.spawn_job(instance.id())?;
                doc.upsert(CronEntry::forked(instance.job_id(), instance.id(), pid));
                self.crontab.write(&doc).await?;
                info!(pid, "job process forked");
            }
        }
        Ok(())
    }

    async fn run(&self, ctx: CancellationToken, instance: Arc<JobInstance>) -> WorkerResult<RunOutcome> {
        self.runner.run(ctx, instance).await
    }

    #[instrument(skip(self, instance), fields(instance_id = %instance.id()), err)]
    async fn kill(&self, instance: Arc<JobInstance>) -> WorkerResult<()> {
        let status = instance.status().await;
        if status.is_terminal() {
            return Err(WorkerError::invalid_state(status, "cannot kill a finished job"));
        }

        let _edit = self.edit.lock().await;
        let mut doc = self.crontab.read().await?;
        match doc.remove(instance.job_id()) {
            Some(entry) => {
                if let Some(pid) = entry.pid {
                    self.processes.kill(pid)?;
                    info!(pid, "job process killed");
                }
                self.crontab.write(&doc).await?;
            }
            None if status == JobStatus::Running => {
                return Err(WorkerError::not_found(format!(
                    "crontab entry of running job {}",
                    instance.job_id()
                )));
            }
            None => {}
        }

        instance.mark_killed("job aborted").await
    }

    #[instrument(skip(self, instance), fields(instance_id = %instance.id()), err)]
    async fn remove(&self, instance: Arc<JobInstance>) -> WorkerResult<()> {
        let status = instance.status().await;
        if !status.is_dispatchable() {
            return Err(WorkerError::invalid_state(status, "cannot remove a running job"));
        }

        let _edit = self.edit.lock().await;
        let mut doc = self.crontab.read().await?;
        if let Some(entry) = doc.find(instance.job_id()) {
            if entry.pid.is_some() {
                return Err(WorkerError::invalid_state(status, "cannot remove a running job"));
            }
            doc.remove(instance.job_id());
            self.crontab.write(&doc).await?;
        }

        instance.mark_killed("job removed before it ran").await
    }

    async fn listen(&self) -> WorkerResult<()> {
        info!("cron backend: jobs are started by the system cron daemon");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InMemoryJobStore, InstanceRecord, JobHandle, JobRecord, JobStore, Registry, RunnerConfig};
    use chrono::Duration;
    use jobworks_core::Schedule;
    use serde_json::json;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    async fn noop(_ctx: CancellationToken, _job: JobHandle) -> anyhow::Result<()> {
        Ok(())
    }

    async fn until_cancelled(ctx: CancellationToken, job: JobHandle) -> anyhow::Result<()> {
        job.set_progress(30).await?;
        ctx.cancelled().await;
        Ok(())
    }

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        crontab: Arc<InMemorySideChannel>,
        processes: Arc<RecordingProcesses>,
        queue: Arc<CronQueue>,
    }

    fn fixture() -> Fixture {
        let store = InMemoryJobStore::arc();
        let mut registry = Registry::new();
        registry
            .define_with_args::<Schedule, _>("digest", noop)
            .define("blocking", until_cancelled);
        let runner = Runner::new(registry.seal(), store.clone(), RunnerConfig::default());
        let crontab = Arc::new(InMemorySideChannel::with_text("MAILTO=ops\n"));
        let processes = Arc::new(RecordingProcesses::default());
        let queue = Arc::new(CronQueue::new(runner, crontab.clone(), processes.clone()));
        Fixture {
            store,
            crontab,
            processes,
            queue,
        }
    }

    impl Fixture {
        async fn instance(&self, args: serde_json::Value) -> Arc<JobInstance> {
            self.instance_of("digest", args).await
        }

        async fn instance_of(&self, name: &str, args: serde_json::Value) -> Arc<JobInstance> {
            let job = JobRecord::new(name);
            self.store.create_job(&job).await.unwrap();
            let record = InstanceRecord::new(&job, args, None);
            self.store.create_instance(&record).await.unwrap();
            JobInstance::from_record(record, self.store.clone())
        }

        async fn wait_for_status(&self, instance_id: InstanceId, status: JobStatus) {
            for _ in 0..200 {
                if self.store.get_instance(instance_id).await.unwrap().state.status == status {
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            panic!("instance {instance_id} never reached {status}");
        }

        async fn wait_for_pid(&self, instance: &JobInstance, pid: u32) {
            for _ in 0..200 {
                let doc = self.crontab.read().await.unwrap();
                if doc.find(instance.job_id()).and_then(|entry| entry.pid) == Some(pid) {
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            panic!("pid {pid} never recorded for {}", instance.id());
        }

        /// Run the instance in the background until `signal` fires.
        fn spawn_run(
            &self,
            instance_id: InstanceId,
        ) -> (oneshot::Sender<i32>, JoinHandle<WorkerResult<ChildExit>>) {
            let (signal, received) = oneshot::channel::<i32>();
            let queue = Arc::clone(&self.queue);
            let task = tokio::spawn(async move {
                let signalled = async move {
                    match received.await {
                        Ok(libc::SIGINT) => (libc::SIGINT, "interrupt"),
                        Ok(signo) => (signo, "terminated"),
                        Err(_) => std::future::pending().await,
                    }
                };
                queue.run_until_signal(instance_id, signalled).await
            });
            (signal, task)
        }
    }

    #[test]
    fn cron_fields_use_minute_hour_day_month() {
        let at = Utc.with_ymd_and_hms(2026, 3, 9, 14, 5, 0).unwrap();
        assert_eq!(cron_fields(at, &Utc), "5 14 9 3 *");
    }

    #[tokio::test]
    async fn immediate_job_is_forked() {
        let fx = fixture();
        let instance = fx.instance(json!({})).await;

        fx.queue.enqueue(instance.clone()).await.unwrap();

        assert_eq!(fx.processes.spawned(), vec![instance.id()]);
        let doc = fx.crontab.read().await.unwrap();
        assert_eq!(doc.find(instance.job_id()).unwrap().pid, Some(RecordingProcesses::FIRST_PID));
        assert_eq!(instance.status().await, JobStatus::New);
    }

    #[tokio::test]
    async fn future_job_gets_a_cron_line() {
        let fx = fixture();
        let at = Utc::now() + Duration::hours(1);
        let instance = fx.instance(json!({"schedule_time": at})).await;

        fx.queue.enqueue(instance.clone()).await.unwrap();

        assert!(fx.processes.spawned().is_empty());
        assert_eq!(instance.status().await, JobStatus::Scheduled);
        assert_eq!(
            fx.store.get_instance(instance.id()).await.unwrap().state.status,
            JobStatus::Scheduled
        );
        let text = fx.crontab.text();
        assert!(text.starts_with("MAILTO=ops\n"));
        assert!(text.contains(&format!("{} cd /srv/app", cron_fields(at, &Local))));
        assert!(text.contains(&format!("--job-instance {}", instance.id())));
    }

    #[tokio::test]
    async fn kill_before_fork_deletes_line_and_blocks_run() {
        let fx = fixture();
        let at = Utc::now() + Duration::hours(2);
        let instance = fx.instance(json!({"schedule_time": at})).await;
        fx.queue.enqueue(instance.clone()).await.unwrap();

        fx.queue.kill(instance.clone()).await.unwrap();

        assert_eq!(fx.crontab.text(), "MAILTO=ops\n");
        assert!(fx.processes.killed().is_empty());
        assert_eq!(instance.status().await, JobStatus::Killed);

        let err = fx
            .queue
            .run(CancellationToken::new(), instance.clone())
            .await
            .unwrap_err();
        assert_eq!(err.current_status(), Some(JobStatus::Killed));
    }

    #[tokio::test]
    async fn kill_signals_recorded_pid() {
        let fx = fixture();
        let instance = fx.instance(json!({})).await;
        fx.queue.enqueue(instance.clone()).await.unwrap();

        fx.queue.kill(instance.clone()).await.unwrap();

        assert_eq!(fx.processes.killed(), vec![RecordingProcesses::FIRST_PID]);
        assert!(fx.crontab.read().await.unwrap().entries().is_empty());
        assert_eq!(instance.status().await, JobStatus::Killed);
    }

    #[tokio::test]
    async fn kill_of_finished_job_is_invalid() {
        let fx = fixture();
        let instance = fx.instance(json!({})).await;
        instance.set_status(JobStatus::Cancelled).await.unwrap();

        let err = fx.queue.kill(instance).await.unwrap_err();
        assert_eq!(err.current_status(), Some(JobStatus::Cancelled));
    }

    #[tokio::test]
    async fn remove_refuses_forked_job() {
        let fx = fixture();
        let instance = fx.instance(json!({})).await;
        fx.queue.enqueue(instance.clone()).await.unwrap();

        let err = fx.queue.remove(instance.clone()).await.unwrap_err();
        assert!(err.to_string().contains("cannot remove a running job"));
        assert!(fx.crontab.read().await.unwrap().find(instance.job_id()).is_some());
    }

    #[tokio::test]
    async fn remove_deletes_scheduled_line() {
        let fx = fixture();
        let at = Utc::now() + Duration::days(1);
        let instance = fx.instance(json!({"schedule_time": at})).await;
        fx.queue.enqueue(instance.clone()).await.unwrap();

        fx.queue.remove(instance.clone()).await.unwrap();

        assert_eq!(fx.crontab.text(), "MAILTO=ops\n");
        assert_eq!(instance.status().await, JobStatus::Killed);
    }

    #[tokio::test]
    async fn child_process_run_cleans_up_its_entry() {
        let fx = fixture();
        let instance = fx.instance(json!({})).await;
        fx.queue.enqueue(instance.clone()).await.unwrap();

        let exit = fx.queue.run_instance(instance.id()).await.unwrap();

        assert_eq!(exit.exit_code(), 0);
        assert_eq!(fx.crontab.text(), "MAILTO=ops\n");
        let stored = fx.store.get_instance(instance.id()).await.unwrap().state;
        assert_eq!(stored.status, JobStatus::Done);
    }

    #[tokio::test]
    async fn duplicate_fire_runs_once() {
        let fx = fixture();
        let instance = fx.instance(json!({})).await;

        assert_eq!(fx.queue.run_instance(instance.id()).await.unwrap().exit_code(), 0);
        let err = fx.queue.run_instance(instance.id()).await.unwrap_err();
        assert_eq!(err.current_status(), Some(JobStatus::Done));
    }

    #[tokio::test]
    async fn duplicate_fire_during_live_run_leaves_its_block() {
        let fx = fixture();
        let instance = fx.instance_of("blocking", json!({})).await;
        let (signal, live) = fx.spawn_run(instance.id());
        fx.wait_for_status(instance.id(), JobStatus::Running).await;
        fx.wait_for_pid(&instance, std::process::id()).await;

        let err = fx.queue.run_instance(instance.id()).await.unwrap_err();
        assert_eq!(err.current_status(), Some(JobStatus::Running));
        let doc = fx.crontab.read().await.unwrap();
        assert_eq!(doc.find(instance.job_id()).unwrap().pid, Some(std::process::id()));

        let running = JobInstance::load(fx.store.clone(), instance.id()).await.unwrap();
        fx.queue.kill(running).await.unwrap();
        assert_eq!(fx.processes.killed(), vec![std::process::id()]);
        assert_eq!(
            fx.store.get_instance(instance.id()).await.unwrap().state.status,
            JobStatus::Killed
        );

        signal.send(libc::SIGTERM).unwrap();
        live.await.unwrap().unwrap();
        assert_eq!(fx.crontab.text(), "MAILTO=ops\n");
    }

    #[tokio::test]
    async fn sigterm_marks_instance_killed() {
        let fx = fixture();
        let instance = fx.instance_of("blocking", json!({})).await;
        fx.queue.enqueue(instance.clone()).await.unwrap();
        let (signal, live) = fx.spawn_run(instance.id());
        fx.wait_for_status(instance.id(), JobStatus::Running).await;

        signal.send(libc::SIGTERM).unwrap();
        let exit = live.await.unwrap().unwrap();

        assert!(matches!(exit, ChildExit::Signalled { name: "terminated", .. }));
        assert_eq!(exit.exit_code(), 128 + libc::SIGTERM);
        assert!(exit.error().is_some());
        let stored = fx.store.get_instance(instance.id()).await.unwrap().state;
        assert_eq!(stored.status, JobStatus::Killed);
        assert_eq!(stored.progress, 30);
        assert_eq!(stored.progress_text, "Worker killed by signal terminated");
        assert!(stored.log.ends_with("Worker killed by signal terminated"));
        assert_eq!(fx.crontab.text(), "MAILTO=ops\n");
    }

    #[tokio::test]
    async fn sigint_exit_code_is_130() {
        let fx = fixture();
        let instance = fx.instance_of("blocking", json!({})).await;
        let (signal, live) = fx.spawn_run(instance.id());
        fx.wait_for_status(instance.id(), JobStatus::Running).await;

        signal.send(libc::SIGINT).unwrap();
        let exit = live.await.unwrap().unwrap();

        assert_eq!(exit.exit_code(), 130);
        assert_eq!(
            fx.store.get_instance(instance.id()).await.unwrap().state.progress_text,
            "Worker killed by signal interrupt"
        );
    }

    #[tokio::test]
    async fn kill_keeps_progress_of_the_live_run() {
        let fx = fixture();
        let instance = fx.instance(json!({})).await;
        fx.queue.enqueue(instance.clone()).await.unwrap();

        let child = JobInstance::load(fx.store.clone(), instance.id()).await.unwrap();
        child.begin_run().await.unwrap();
        child.set_progress(60).await.unwrap();
        child.add_log("half way").await.unwrap();

        fx.queue.kill(instance.clone()).await.unwrap();

        let stored = fx.store.get_instance(instance.id()).await.unwrap().state;
        assert_eq!(stored.status, JobStatus::Killed);
        assert_eq!(stored.progress, 60);
        assert_eq!(stored.log, "half way\njob aborted");
    }
}
