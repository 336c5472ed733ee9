//! End-to-end tests for the worker over both backends.
//!
//! Tests: Worker → Queue → Runner → JobStore
//!
//! Verifies:
//! - Immediate and scheduled submissions reach the right status
//! - A job is dispatched at most once
//! - Abort, rerun, update and cancel follow the status machine

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{Duration as ChronoDuration, Utc};
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use jobworks_core::{JobArgs, JobId, JobStatus, Schedule, WorkerError};

    use crate::jobs::{InMemoryJobStore, JobHandle, JobStore, Registry, RunnerConfig};
    use crate::queue::cron::{ChildExit, CrontabDocument, InMemorySideChannel, RecordingProcesses};
    use crate::queue::lease::{InMemoryLeaseStore, ItemState, LeaseWorkerConfig};
    use crate::worker::Worker;

    #[derive(Debug, Serialize, Deserialize)]
    struct ReportArgs {
        region: String,
        #[serde(flatten)]
        schedule: Schedule,
    }

    impl JobArgs for ReportArgs {
        fn schedule_time(&self) -> Option<chrono::DateTime<Utc>> {
            self.schedule.schedule_time
        }
    }

    async fn report(_ctx: CancellationToken, job: JobHandle) -> anyhow::Result<()> {
        let args: ReportArgs = job.argument()?;
        job.add_log(format!("building report for {}", args.region)).await?;
        job.set_progress(50).await?;
        Ok(())
    }

    async fn flaky(_ctx: CancellationToken, job: JobHandle) -> anyhow::Result<()> {
        if job.raw_argument()["fail"].as_bool().unwrap_or(false) {
            anyhow::bail!("upstream unavailable");
        }
        Ok(())
    }

    async fn long_running(ctx: CancellationToken, job: JobHandle) -> anyhow::Result<()> {
        job.set_progress_text("waiting for cancellation").await?;
        ctx.cancelled().await;
        Ok(())
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .define_with_args::<ReportArgs, _>("report", report)
            .define("flaky", flaky)
            .define("long_running", long_running);
        registry
    }

    fn runner_config() -> RunnerConfig {
        RunnerConfig {
            heartbeat_interval: Duration::from_millis(50),
            expiration_poll_interval: Duration::from_millis(20),
        }
    }

    struct LeaseSetup {
        store: Arc<InMemoryJobStore>,
        leases: Arc<InMemoryLeaseStore>,
        worker: Worker,
    }

    fn lease_setup() -> LeaseSetup {
        let store = InMemoryJobStore::arc();
        let leases = InMemoryLeaseStore::arc();
        let worker = Worker::builder(store.clone(), registry())
            .runner_config(runner_config())
            .with_lease(
                leases.clone(),
                LeaseWorkerConfig {
                    max_lease_per_second: 100,
                    max_concurrent: 2,
                    idle_poll_interval: Duration::from_millis(10),
                    ..LeaseWorkerConfig::default()
                },
            )
            .build()
            .unwrap();
        LeaseSetup {
            store,
            leases,
            worker,
        }
    }

    struct CronSetup {
        store: Arc<InMemoryJobStore>,
        crontab: Arc<InMemorySideChannel>,
        processes: Arc<RecordingProcesses>,
        worker: Worker,
    }

    fn cron_setup() -> CronSetup {
        let store = InMemoryJobStore::arc();
        let crontab = Arc::new(InMemorySideChannel::with_text("SHELL=/bin/sh\n0 3 * * * /usr/bin/backup\n"));
        let processes = Arc::new(RecordingProcesses::default());
        let worker = Worker::builder(store.clone(), registry())
            .runner_config(runner_config())
            .with_cron(crontab.clone(), processes.clone())
            .build()
            .unwrap();
        CronSetup {
            store,
            crontab,
            processes,
            worker,
        }
    }

    async fn wait_for_status(store: &InMemoryJobStore, job_id: JobId, expected: JobStatus) {
        for _ in 0..500 {
            if store.latest_instance(job_id).await.unwrap().state.status == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} never reached {expected}");
    }

    fn report_args(schedule: Option<chrono::DateTime<Utc>>) -> serde_json::Value {
        json!({ "region": "emea", "schedule_time": schedule })
    }

    #[tokio::test]
    async fn lease_immediate_job_runs_to_done() {
        let setup = lease_setup();
        setup.worker.listen().await.unwrap();

        let job = setup
            .worker
            .create_job("report", report_args(None), Some("alice".into()))
            .await
            .unwrap();
        wait_for_status(&setup.store, job.id, JobStatus::Done).await;
        setup.worker.shutdown().await.unwrap();

        let instance = setup.worker.latest_instance(job.id).await.unwrap();
        assert_eq!(instance.state.progress, 100);
        assert_eq!(instance.state.log, "building report for emea");
        assert_eq!(instance.operator.as_deref(), Some("alice"));
        assert_eq!(setup.worker.job(job.id).await.unwrap().status, JobStatus::Done);
        assert_eq!(setup.leases.item_states(instance.id), vec![ItemState::Done]);
    }

    #[tokio::test]
    async fn lease_scheduled_job_is_not_dispatched_early() {
        let setup = lease_setup();
        setup.worker.listen().await.unwrap();

        let at = Utc::now() + ChronoDuration::hours(1);
        let job = setup
            .worker
            .create_job("report", report_args(Some(at)), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        setup.worker.shutdown().await.unwrap();

        let instance = setup.worker.latest_instance(job.id).await.unwrap();
        assert_eq!(instance.state.status, JobStatus::Scheduled);
        assert_eq!(setup.leases.item_states(instance.id), vec![ItemState::Pending]);
    }

    #[tokio::test]
    async fn lease_abort_of_running_job_kills_it() {
        let setup = lease_setup();
        setup.worker.listen().await.unwrap();

        let job = setup.worker.create_job("long_running", json!(null), None).await.unwrap();
        wait_for_status(&setup.store, job.id, JobStatus::Running).await;

        setup.worker.abort_job(job.id).await.unwrap();
        wait_for_status(&setup.store, job.id, JobStatus::Killed).await;
        setup.worker.shutdown().await.unwrap();

        let instance = setup.worker.latest_instance(job.id).await.unwrap();
        assert_eq!(instance.state.progress_text, "waiting for cancellation");
        assert_eq!(setup.leases.item_states(instance.id), vec![ItemState::Expired]);
    }

    #[tokio::test]
    async fn concurrent_runs_dispatch_once() {
        let setup = lease_setup();
        let job = setup.worker.create_job("flaky", json!({}), None).await.unwrap();
        let instance_id = setup.worker.latest_instance(job.id).await.unwrap().id;

        let (first, second) = tokio::join!(
            setup.worker.run_instance(instance_id),
            setup.worker.run_instance(instance_id)
        );

        let (won, lost): (Vec<_>, Vec<_>) = [first, second].into_iter().partition(Result::is_ok);
        assert_eq!(won.len(), 1);
        let err = lost.into_iter().next().unwrap().unwrap_err();
        assert!(matches!(err, WorkerError::InvalidState { .. }));
        assert_eq!(
            setup.store.latest_instance(job.id).await.unwrap().state.status,
            JobStatus::Done
        );
    }

    #[tokio::test]
    async fn rerun_creates_a_new_instance() {
        let setup = lease_setup();
        let job = setup
            .worker
            .create_job("flaky", json!({"fail": true}), Some("ops".into()))
            .await
            .unwrap();
        let first = setup.worker.latest_instance(job.id).await.unwrap();

        let exit = setup.worker.run_instance(first.id).await.unwrap();
        assert_eq!(exit.exit_code(), 1);
        assert_eq!(setup.worker.job(job.id).await.unwrap().status, JobStatus::Exception);

        let second_id = setup.worker.rerun_job(job.id).await.unwrap();
        assert_ne!(second_id, first.id);
        assert_eq!(setup.worker.job(job.id).await.unwrap().status, JobStatus::New);

        let instances = setup.worker.list_instances(job.id).await.unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].state.status, JobStatus::Exception);
        assert_eq!(instances[0].state.progress_text, "upstream unavailable");
        assert_eq!(instances[1].state.status, JobStatus::New);
        assert_eq!(instances[1].args, json!({"fail": true}));
        assert_eq!(instances[1].operator.as_deref(), Some("ops"));
    }

    #[tokio::test]
    async fn rerun_of_pending_job_is_rejected() {
        let setup = lease_setup();
        let job = setup.worker.create_job("flaky", json!({}), None).await.unwrap();

        let err = setup.worker.rerun_job(job.id).await.unwrap_err();
        assert_eq!(err.current_status(), Some(JobStatus::New));
    }

    #[tokio::test]
    async fn invalid_arguments_are_rejected_before_storage() {
        let setup = lease_setup();
        let err = setup
            .worker
            .create_job("report", json!({"region": 7}), None)
            .await
            .unwrap_err();

        assert!(matches!(err, WorkerError::Argument(_)));
        assert!(setup.worker.list_jobs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cron_child_runs_and_cleans_up() {
        let setup = cron_setup();
        let job = setup
            .worker
            .submit("report", &ReportArgs { region: "apac".into(), schedule: Schedule::default() }, None)
            .await
            .unwrap();
        let instance_id = setup.worker.latest_instance(job.id).await.unwrap().id;
        assert_eq!(setup.processes.spawned(), vec![instance_id]);

        let exit = setup.worker.run_instance(instance_id).await.unwrap();

        assert!(matches!(exit, ChildExit::Finished(_)));
        assert_eq!(exit.exit_code(), 0);
        let instance = setup.worker.latest_instance(job.id).await.unwrap();
        assert_eq!(instance.state.status, JobStatus::Done);
        assert_eq!(instance.state.progress, 100);
        assert_eq!(
            setup.crontab.text(),
            "SHELL=/bin/sh\n0 3 * * * /usr/bin/backup\n"
        );
    }

    #[tokio::test]
    async fn cron_kill_before_dispatch_blocks_later_run() {
        let setup = cron_setup();
        let at = Utc::now() + ChronoDuration::hours(2);
        let job = setup
            .worker
            .create_job("report", report_args(Some(at)), None)
            .await
            .unwrap();
        let instance = setup.worker.latest_instance(job.id).await.unwrap();
        assert_eq!(instance.state.status, JobStatus::Scheduled);
        assert!(CrontabDocument::parse(&setup.crontab.text()).find(job.id).is_some());

        setup.worker.abort_job(job.id).await.unwrap();

        assert_eq!(
            setup.store.latest_instance(job.id).await.unwrap().state.status,
            JobStatus::Killed
        );
        assert!(CrontabDocument::parse(&setup.crontab.text()).find(job.id).is_none());

        let err = setup.worker.run_instance(instance.id).await.unwrap_err();
        assert_eq!(err.current_status(), Some(JobStatus::Killed));
        assert!(CrontabDocument::parse(&setup.crontab.text()).entries().is_empty());
    }

    #[tokio::test]
    async fn cron_update_moves_the_schedule() {
        let setup = cron_setup();
        let first_at = Utc::now() + ChronoDuration::hours(1);
        let second_at = Utc::now() + ChronoDuration::days(1);
        let job = setup
            .worker
            .create_job("report", report_args(Some(first_at)), None)
            .await
            .unwrap();
        let old = setup.worker.latest_instance(job.id).await.unwrap();

        let new_id = setup
            .worker
            .update_job(job.id, report_args(Some(second_at)))
            .await
            .unwrap();

        let instances = setup.worker.list_instances(job.id).await.unwrap();
        assert_eq!(instances[0].id, old.id);
        assert_eq!(instances[0].state.status, JobStatus::Killed);
        assert_eq!(instances[1].id, new_id);
        assert_eq!(instances[1].state.status, JobStatus::Scheduled);

        let doc = CrontabDocument::parse(&setup.crontab.text());
        assert_eq!(doc.entries().len(), 1);
        assert_eq!(doc.find(job.id).unwrap().instance_id, new_id);
    }

    #[tokio::test]
    async fn cancelled_job_is_discarded_on_dispatch() {
        let setup = cron_setup();
        let at = Utc::now() + ChronoDuration::hours(1);
        let job = setup
            .worker
            .create_job("report", report_args(Some(at)), None)
            .await
            .unwrap();
        let instance_id = setup.worker.latest_instance(job.id).await.unwrap().id;

        setup.worker.cancel_job(job.id).await.unwrap();
        assert_eq!(setup.worker.job(job.id).await.unwrap().status, JobStatus::Cancelled);

        let err = setup.worker.run_instance(instance_id).await.unwrap_err();
        assert_eq!(err.current_status(), Some(JobStatus::Cancelled));
        assert!(setup.processes.spawned().is_empty());

        let err = setup.worker.abort_job(job.id).await.unwrap_err();
        assert_eq!(err.current_status(), Some(JobStatus::Cancelled));
    }
}
