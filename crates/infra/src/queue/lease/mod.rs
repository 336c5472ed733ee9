//! Distributed lease backend.
//!
//! `enqueue` inserts an item into the lease table on the channel
//! `worker_<job name>`. `listen` starts one consumer task per registered job;
//! each consumer leases items at a bounded rate and runs at most
//! `max_concurrent` of them at once.
//!
//! Cancellation is cooperative: `kill`/`remove` set the item's expiration, and a
//! poller beside every running handler checks it each
//! `expiration_poll_interval`, cancelling the handler's token and marking the
//! instance `Killed` once it has passed. The same poller renews the lease
//! before half of it is used up.
//!
//! An item redelivered after its worker died finds the instance `Running`; the
//! instance is marked `Killed` and the item expired instead of running it again.

mod postgres;
mod store;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use jobworks_core::{JobStatus, WorkerError, WorkerResult};

use super::{Queue, deferred_run_time};
use crate::jobs::{JobInstance, RunOutcome, Runner};

pub use postgres::PostgresLeaseStore;
pub use store::{
    InMemoryLeaseStore, ItemState, LeaseItemId, LeasePlan, LeaseStore, LeaseStoreError, LeasedItem,
};

/// Lease channel of a job definition.
pub fn channel_name(job_name: &str) -> String {
    format!("worker_{job_name}")
}

/// Consumer tuning.
#[derive(Debug, Clone)]
pub struct LeaseWorkerConfig {
    /// Upper bound on lease attempts per second, per channel.
    pub max_lease_per_second: u32,
    /// Handlers running at once, per channel.
    pub max_concurrent: usize,
    /// How long a lease is held before another worker may take the item.
    pub lease_duration: Duration,
    /// Wait after an empty lease attempt.
    pub idle_poll_interval: Duration,
}

impl Default for LeaseWorkerConfig {
    fn default() -> Self {
        Self {
            max_lease_per_second: 10,
            max_concurrent: 1,
            lease_duration: Duration::from_secs(30 * 60),
            idle_poll_interval: Duration::from_secs(1),
        }
    }
}

impl LeaseWorkerConfig {
    fn lease_gap(&self) -> Duration {
        Duration::from_secs(1) / self.max_lease_per_second.max(1)
    }
}

struct Inner {
    runner: Runner,
    store: Arc<dyn LeaseStore>,
    config: LeaseWorkerConfig,
}

/// Queue backed by a shared lease table.
pub struct LeaseQueue {
    inner: Arc<Inner>,
    stop: CancellationToken,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    listening: AtomicBool,
}

impl LeaseQueue {
    pub fn new(runner: Runner, store: Arc<dyn LeaseStore>, config: LeaseWorkerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                store,
                config,
            }),
            stop: CancellationToken::new(),
            consumers: Mutex::new(Vec::new()),
            listening: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &LeaseWorkerConfig {
        &self.inner.config
    }

    /// Lease and perform one item of `job_name`, if one is due.
    ///
    /// Returns whether an item was found. Consumers started by `listen` do the
    /// same in a loop.
    pub async fn work_once(&self, job_name: &str) -> WorkerResult<bool> {
        let queue = channel_name(job_name);
        match self
            .inner
            .store
            .lease(&queue, self.inner.config.lease_duration)
            .await?
        {
            Some(item) => {
                Arc::clone(&self.inner).perform(item).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Inner {
    async fn consume(self: Arc<Self>, queue: String, stop: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut in_flight = JoinSet::new();
        let mut next_lease = Instant::now();

        info!(
            queue = %queue,
            max_concurrent = self.config.max_concurrent,
            max_lease_per_second = self.config.max_lease_per_second,
            "lease consumer started"
        );

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    self.observe(&queue, joined).await;
                }
                _ = tokio::time::sleep_until(next_lease) => {
                    next_lease = Instant::now() + self.config.lease_gap();
                    let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                        continue;
                    };
                    match self.store.lease(&queue, self.config.lease_duration).await {
                        Ok(Some(item)) => {
                            in_flight.spawn(Arc::clone(&self).perform_with_permit(item, permit));
                        }
                        Ok(None) => {
                            next_lease = Instant::now() + self.config.idle_poll_interval;
                        }
                        Err(err) => {
                            error!(queue = %queue, error = %err, "lease attempt failed");
                            self.record_worker_error(&queue, &format!("lease attempt failed: {err}")).await;
                            next_lease = Instant::now() + self.config.idle_poll_interval;
                        }
                    }
                }
            }
        }

        info!(queue = %queue, in_flight = in_flight.len(), "lease consumer stopping");
        while let Some(joined) = in_flight.join_next().await {
            self.observe(&queue, joined).await;
        }
    }

    async fn observe(&self, queue: &str, joined: Result<WorkerResult<()>, JoinError>) {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(queue = %queue, error = %err, "lease item not performed"),
            Err(err) if err.is_panic() => {
                error!(queue = %queue, "job handler panic reached the worker loop");
                self.record_worker_error(queue, &format!("job panicked: {err}")).await;
            }
            Err(err) => warn!(queue = %queue, error = %err, "lease task cancelled"),
        }
    }

    async fn record_worker_error(&self, queue: &str, message: &str) {
        if let Err(err) = self.store.record_worker_error(queue, message).await {
            error!(queue = %queue, error = %err, "failed to record worker error");
        }
    }

    async fn perform_with_permit(
        self: Arc<Self>,
        item: LeasedItem,
        _permit: OwnedSemaphorePermit,
    ) -> WorkerResult<()> {
        self.perform(item).await
    }

    /// Run one leased item and settle it in the lease table.
    ///
    /// A handler panic is re-raised after bookkeeping.
    #[instrument(skip(self, item), fields(item_id = item.id, instance_id = %item.instance_id), err)]
    async fn perform(self: Arc<Self>, item: LeasedItem) -> WorkerResult<()> {
        let instance = match self.runner.load_instance(item.instance_id).await {
            Ok(instance) => instance,
            Err(err) => {
                self.settle(item.id, Settle::Failed(&err.to_string())).await;
                return Err(err);
            }
        };

        let expired = matches!(
            self.store.expiration(item.id).await,
            Ok(Some(at)) if at <= Utc::now()
        );
        match instance.status().await {
            JobStatus::Cancelled => {
                self.settle(item.id, Settle::Expired("job is cancelled")).await;
                return Ok(());
            }
            JobStatus::Running => {
                warn!("job left running by a lost worker, marking it killed");
                let killed = instance.mark_killed("job aborted: worker lost").await;
                self.settle(item.id, Settle::Expired("worker lost while running")).await;
                return killed;
            }
            _ if expired => {
                self.settle(item.id, Settle::Expired("manually aborted")).await;
                return Ok(());
            }
            _ => {}
        }

        let ctx = CancellationToken::new();
        let finished = CancellationToken::new();
        let poller = tokio::spawn(Arc::clone(&self).watch_expiration(
            item.clone(),
            Arc::clone(&instance),
            ctx.clone(),
            finished.clone(),
        ));

        let result = self.runner.run(ctx, Arc::clone(&instance)).await;
        finished.cancel();
        if let Err(err) = poller.await {
            warn!(error = %err, "expiration poller ended abnormally");
        }

        match result {
            Ok(RunOutcome::Done) => self.settle(item.id, Settle::Done).await,
            Ok(RunOutcome::Failed(message)) => self.settle(item.id, Settle::Failed(&message)).await,
            Ok(RunOutcome::Killed) => self.settle(item.id, Settle::Expired("manually aborted")).await,
            Ok(RunOutcome::Panicked(payload)) => {
                self.settle(item.id, Settle::Failed(payload.message())).await;
                payload.resume();
            }
            Err(err) => {
                self.settle(item.id, Settle::Failed(&err.to_string())).await;
                return Err(err);
            }
        }
        Ok(())
    }

    async fn watch_expiration(
        self: Arc<Self>,
        item: LeasedItem,
        instance: Arc<JobInstance>,
        ctx: CancellationToken,
        finished: CancellationToken,
    ) {
        let item_id = item.id;
        let mut leased_until = item.leased_until;
        let renew_within = chrono::Duration::from_std(self.config.lease_duration / 2)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let mut ticker = tokio::time::interval(self.runner.config().expiration_poll_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = finished.cancelled() => return,
                _ = ticker.tick() => {
                    match self.store.expiration(item_id).await {
                        Ok(Some(at)) if at <= Utc::now() => {
                            debug!(item_id, "lease item expired, cancelling handler");
                            if let Err(err) = kill_instance(&instance).await {
                                warn!(item_id, error = %err, "failed to mark aborted job killed");
                            }
                            ctx.cancel();
                            return;
                        }
                        Ok(_) => {}
                        Err(err) => warn!(item_id, error = %err, "expiration check failed"),
                    }

                    if leased_until - Utc::now() < renew_within {
                        match self.store.renew(item_id, self.config.lease_duration).await {
                            Ok(until) => {
                                debug!(item_id, leased_until = %until, "lease renewed");
                                leased_until = until;
                            }
                            Err(err) => warn!(item_id, error = %err, "lease renewal failed"),
                        }
                    }
                }
            }
        }
    }

    async fn settle(&self, item_id: LeaseItemId, outcome: Settle<'_>) {
        let result = match outcome {
            Settle::Done => self.store.mark_done(item_id).await,
            Settle::Failed(message) => self.store.mark_failed(item_id, message).await,
            Settle::Expired(reason) => self.store.mark_expired(item_id, reason).await,
        };
        if let Err(err) = result {
            error!(item_id, error = %err, "failed to settle lease item");
        }
    }
}

enum Settle<'a> {
    Done,
    Failed(&'a str),
    Expired(&'a str),
}

async fn kill_instance(instance: &JobInstance) -> WorkerResult<()> {
    match instance.set_status(JobStatus::Killed).await {
        Ok(()) => instance.add_log("job aborted").await,
        Err(err) if err.current_status().is_some_and(|s| s.is_terminal()) => Ok(()),
        Err(err) => Err(err),
    }
}

#[async_trait]
impl Queue for LeaseQueue {
    fn name(&self) -> &'static str {
        "lease"
    }

    #[instrument(skip(self, instance), fields(instance_id = %instance.id(), job_name = %instance.job_name()), err)]
    async fn enqueue(&self, instance: Arc<JobInstance>) -> WorkerResult<()> {
        let now = Utc::now();
        let deferred = deferred_run_time(self.inner.runner.registry(), &instance, now)?;

        let plan = LeasePlan {
            queue: channel_name(instance.job_name()),
            job_id: instance.job_id(),
            instance_id: instance.id(),
            args: instance.args().clone(),
            run_at: deferred.unwrap_or(now),
        };
        let item_id = self.inner.store.enqueue(&plan).await?;

        if deferred.is_some() {
            instance.set_status(JobStatus::Scheduled).await?;
        }
        info!(item_id, run_at = %plan.run_at, "job enqueued");
        Ok(())
    }

    async fn run(&self, ctx: CancellationToken, instance: Arc<JobInstance>) -> WorkerResult<RunOutcome> {
        self.inner.runner.run(ctx, instance).await
    }

    /// Expire the instance's item. A running handler is cancelled by its poller
    /// within one poll interval; an instance that has not started, or whose
    /// worker no longer holds a lease, is killed now.
    #[instrument(skip(self, instance), fields(instance_id = %instance.id()), err)]
    async fn kill(&self, instance: Arc<JobInstance>) -> WorkerResult<()> {
        let status = instance.status().await;
        if status.is_terminal() {
            return Err(WorkerError::invalid_state(status, "cannot kill a finished job"));
        }

        self.inner.store.expire_instance(instance.id(), Utc::now()).await?;
        if status == JobStatus::Running && self.inner.store.is_leased(instance.id()).await? {
            return Ok(());
        }
        instance.mark_killed("job aborted").await
    }

    #[instrument(skip(self, instance), fields(instance_id = %instance.id()), err)]
    async fn remove(&self, instance: Arc<JobInstance>) -> WorkerResult<()> {
        let status = instance.status().await;
        if !status.is_dispatchable() {
            return Err(WorkerError::invalid_state(status, "cannot remove a running job"));
        }

        self.inner.store.expire_instance(instance.id(), Utc::now()).await?;
        instance.mark_killed("job removed before it ran").await
    }

    async fn listen(&self) -> WorkerResult<()> {
        if self.listening.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut consumers = self.consumers.lock().unwrap_or_else(PoisonError::into_inner);
        for name in self.inner.runner.registry().names() {
            let task = tokio::spawn(
                Arc::clone(&self.inner).consume(channel_name(name), self.stop.child_token()),
            );
            consumers.push(task);
        }
        info!(consumers = consumers.len(), "lease backend listening");
        Ok(())
    }

    async fn shutdown(&self) -> WorkerResult<()> {
        self.stop.cancel();
        let consumers: Vec<_> = self
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        for task in consumers {
            if let Err(err) = task.await {
                error!(error = %err, "lease consumer ended abnormally");
            }
        }
        info!("lease backend stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InMemoryJobStore, InstanceRecord, JobHandle, JobRecord, JobStore, Registry, RunnerConfig};
    use chrono::Duration as ChronoDuration;
    use jobworks_core::Schedule;
    use serde_json::json;

    async fn quick(_ctx: CancellationToken, job: JobHandle) -> anyhow::Result<()> {
        job.set_progress(50).await?;
        Ok(())
    }

    async fn until_cancelled(ctx: CancellationToken, job: JobHandle) -> anyhow::Result<()> {
        job.add_log("waiting").await?;
        ctx.cancelled().await;
        anyhow::bail!("cancelled")
    }

    async fn panics(_ctx: CancellationToken, _job: JobHandle) -> anyhow::Result<()> {
        panic!("lease boom")
    }

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        leases: Arc<InMemoryLeaseStore>,
        queue: Arc<LeaseQueue>,
    }

    fn fixture() -> Fixture {
        fixture_with(LeaseWorkerConfig {
            max_lease_per_second: 100,
            idle_poll_interval: Duration::from_millis(10),
            ..LeaseWorkerConfig::default()
        })
    }

    fn fixture_with(config: LeaseWorkerConfig) -> Fixture {
        let store = InMemoryJobStore::arc();
        let leases = InMemoryLeaseStore::arc();
        let mut registry = Registry::new();
        registry
            .define_with_args::<Schedule, _>("quick", quick)
            .define("blocking", until_cancelled)
            .define("panics", panics);
        let runner = Runner::new(
            registry.seal(),
            store.clone(),
            RunnerConfig {
                heartbeat_interval: Duration::from_millis(50),
                expiration_poll_interval: Duration::from_millis(20),
            },
        );
        let queue = Arc::new(LeaseQueue::new(runner, leases.clone(), config));
        Fixture {
            store,
            leases,
            queue,
        }
    }

    impl Fixture {
        async fn instance(&self, name: &str, args: serde_json::Value) -> Arc<JobInstance> {
            let job = JobRecord::new(name);
            self.store.create_job(&job).await.unwrap();
            let record = InstanceRecord::new(&job, args, None);
            self.store.create_instance(&record).await.unwrap();
            JobInstance::from_record(record, self.store.clone())
        }

        async fn stored_status(&self, instance: &JobInstance) -> JobStatus {
            self.store.get_instance(instance.id()).await.unwrap().state.status
        }

        async fn wait_for_status(&self, instance: &JobInstance, status: JobStatus) {
            for _ in 0..400 {
                if self.stored_status(instance).await == status {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("instance {} never reached {status}", instance.id());
        }

        /// Lease the instance's item and claim it as a worker would, then let
        /// the lease lapse as if that worker had died.
        async fn abandon(&self, instance: &JobInstance) {
            let channel = channel_name(instance.job_name());
            self.leases.lease(&channel, Duration::ZERO).await.unwrap().unwrap();
            instance.begin_run().await.unwrap();
            instance.set_progress(70).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn channel_is_prefixed_job_name() {
        assert_eq!(channel_name("export"), "worker_export");
        assert_eq!(LeaseWorkerConfig::default().lease_gap(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn immediate_job_runs_to_done() {
        let fx = fixture();
        let instance = fx.instance("quick", json!({})).await;
        fx.queue.enqueue(instance.clone()).await.unwrap();

        assert!(fx.queue.work_once("quick").await.unwrap());

        let stored = fx.store.get_instance(instance.id()).await.unwrap().state;
        assert_eq!(stored.status, JobStatus::Done);
        assert_eq!(stored.progress, 100);
        assert_eq!(fx.leases.item_states(instance.id()), vec![ItemState::Done]);
    }

    #[tokio::test]
    async fn scheduled_job_waits_for_run_at() {
        let fx = fixture();
        let at = Utc::now() + ChronoDuration::hours(1);
        let instance = fx.instance("quick", json!({"schedule_time": at})).await;
        fx.queue.enqueue(instance.clone()).await.unwrap();

        assert_eq!(fx.stored_status(&instance).await, JobStatus::Scheduled);
        assert_eq!(fx.leases.plans(instance.id())[0].run_at, at);
        assert!(!fx.queue.work_once("quick").await.unwrap());
        assert_eq!(fx.stored_status(&instance).await, JobStatus::Scheduled);
    }

    #[tokio::test]
    async fn kill_cancels_running_handler_within_a_poll() {
        let fx = fixture();
        let instance = fx.instance("blocking", json!({})).await;
        fx.queue.enqueue(instance.clone()).await.unwrap();

        let worker = {
            let queue = Arc::clone(&fx.queue);
            tokio::spawn(async move { queue.work_once("blocking").await })
        };

        while fx.stored_status(&instance).await != JobStatus::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let running = JobInstance::load(fx.store.clone(), instance.id()).await.unwrap();
        fx.queue.kill(running).await.unwrap();

        worker.await.unwrap().unwrap();
        let stored = fx.store.get_instance(instance.id()).await.unwrap().state;
        assert_eq!(stored.status, JobStatus::Killed);
        assert!(stored.log.starts_with("waiting"));
        assert!(stored.log.contains("job aborted"));
        assert_eq!(fx.leases.item_states(instance.id()), vec![ItemState::Expired]);
    }

    #[tokio::test]
    async fn remove_prevents_dispatch() {
        let fx = fixture();
        let instance = fx.instance("quick", json!({})).await;
        fx.queue.enqueue(instance.clone()).await.unwrap();

        fx.queue.remove(instance.clone()).await.unwrap();

        assert_eq!(fx.stored_status(&instance).await, JobStatus::Killed);
        assert!(!fx.queue.work_once("quick").await.unwrap());
    }

    #[tokio::test]
    async fn remove_of_running_job_is_invalid() {
        let fx = fixture();
        let instance = fx.instance("quick", json!({})).await;
        instance.set_status(JobStatus::Running).await.unwrap();

        let err = fx.queue.remove(instance).await.unwrap_err();
        assert_eq!(err.current_status(), Some(JobStatus::Running));
    }

    #[tokio::test]
    async fn cancelled_instance_is_expired_not_run() {
        let fx = fixture();
        let instance = fx.instance("quick", json!({})).await;
        fx.queue.enqueue(instance.clone()).await.unwrap();
        instance.set_status(JobStatus::Cancelled).await.unwrap();

        assert!(fx.queue.work_once("quick").await.unwrap());
        assert_eq!(fx.stored_status(&instance).await, JobStatus::Cancelled);
        assert_eq!(fx.leases.item_states(instance.id()), vec![ItemState::Expired]);
    }

    #[tokio::test]
    async fn redelivered_item_does_not_run_twice() {
        let fx = fixture();
        let instance = fx.instance("quick", json!({})).await;
        fx.queue.enqueue(instance.clone()).await.unwrap();
        fx.queue.enqueue(instance.clone()).await.unwrap();

        assert!(fx.queue.work_once("quick").await.unwrap());
        let err = fx.queue.work_once("quick").await.unwrap_err();

        assert_eq!(err.current_status(), Some(JobStatus::Done));
        assert_eq!(
            fx.leases.item_states(instance.id()),
            vec![ItemState::Done, ItemState::Failed]
        );
        assert_eq!(fx.stored_status(&instance).await, JobStatus::Done);
    }

    #[tokio::test]
    async fn panic_is_reported_to_worker_loop() {
        let fx = fixture();
        let instance = fx.instance("panics", json!({})).await;
        fx.queue.enqueue(instance.clone()).await.unwrap();

        fx.queue.listen().await.unwrap();
        while fx.leases.worker_errors().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        fx.queue.shutdown().await.unwrap();

        let stored = fx.store.get_instance(instance.id()).await.unwrap().state;
        assert_eq!(stored.status, JobStatus::Exception);
        assert_eq!(stored.progress_text, "lease boom");
        assert_eq!(fx.leases.item_states(instance.id()), vec![ItemState::Failed]);
        assert_eq!(fx.leases.worker_errors()[0].0, "worker_panics");
    }

    #[tokio::test]
    async fn redelivery_of_orphaned_run_marks_it_killed() {
        let fx = fixture();
        let instance = fx.instance("quick", json!({})).await;
        fx.queue.enqueue(instance.clone()).await.unwrap();
        fx.abandon(&instance).await;

        assert!(fx.queue.work_once("quick").await.unwrap());

        let stored = fx.store.get_instance(instance.id()).await.unwrap().state;
        assert_eq!(stored.status, JobStatus::Killed);
        assert_eq!(stored.progress, 70);
        assert!(stored.log.ends_with("job aborted: worker lost"));
        assert_eq!(fx.leases.item_states(instance.id()), vec![ItemState::Expired]);
        assert!(!fx.queue.work_once("quick").await.unwrap());
    }

    #[tokio::test]
    async fn kill_without_live_lease_marks_killed_now() {
        let fx = fixture();
        let instance = fx.instance("quick", json!({})).await;
        fx.queue.enqueue(instance.clone()).await.unwrap();
        fx.abandon(&instance).await;

        fx.queue.kill(instance.clone()).await.unwrap();

        let stored = fx.store.get_instance(instance.id()).await.unwrap().state;
        assert_eq!(stored.status, JobStatus::Killed);
        assert_eq!(stored.progress, 70);
        assert_eq!(stored.log, "job aborted");

        assert!(fx.queue.work_once("quick").await.unwrap());
        assert_eq!(fx.leases.item_states(instance.id()), vec![ItemState::Expired]);
        assert_eq!(fx.stored_status(&instance).await, JobStatus::Killed);
    }

    #[tokio::test]
    async fn lease_is_renewed_while_handler_runs() {
        let fx = fixture_with(LeaseWorkerConfig {
            lease_duration: Duration::from_millis(200),
            ..LeaseWorkerConfig::default()
        });
        let instance = fx.instance("blocking", json!({})).await;
        fx.queue.enqueue(instance.clone()).await.unwrap();

        let worker = {
            let queue = Arc::clone(&fx.queue);
            tokio::spawn(async move { queue.work_once("blocking").await })
        };
        fx.wait_for_status(&instance, JobStatus::Running).await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(fx.leases.is_leased(instance.id()).await.unwrap());
        let channel = channel_name("blocking");
        assert!(fx.leases.lease(&channel, Duration::from_secs(60)).await.unwrap().is_none());

        let running = JobInstance::load(fx.store.clone(), instance.id()).await.unwrap();
        fx.queue.kill(running).await.unwrap();
        worker.await.unwrap().unwrap();
        assert_eq!(fx.stored_status(&instance).await, JobStatus::Killed);
    }

    #[tokio::test]
    async fn max_concurrent_bounds_running_handlers() {
        let fx = fixture();
        assert_eq!(fx.queue.config().max_concurrent, 1);
        let first = fx.instance("blocking", json!({})).await;
        let second = fx.instance("blocking", json!({})).await;
        fx.queue.enqueue(first.clone()).await.unwrap();
        fx.queue.enqueue(second.clone()).await.unwrap();

        fx.queue.listen().await.unwrap();
        let (running, waiting) = loop {
            if fx.stored_status(&first).await == JobStatus::Running {
                break (first.clone(), second.clone());
            }
            if fx.stored_status(&second).await == JobStatus::Running {
                break (second.clone(), first.clone());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(fx.stored_status(&waiting).await, JobStatus::New);
        }

        let current = JobInstance::load(fx.store.clone(), running.id()).await.unwrap();
        fx.queue.kill(current).await.unwrap();
        fx.wait_for_status(&waiting, JobStatus::Running).await;
        assert_eq!(fx.stored_status(&running).await, JobStatus::Killed);

        let next = JobInstance::load(fx.store.clone(), waiting.id()).await.unwrap();
        fx.queue.kill(next).await.unwrap();
        fx.wait_for_status(&waiting, JobStatus::Killed).await;
        fx.queue.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn leases_are_spaced_by_the_rate_limit() {
        let fx = fixture_with(LeaseWorkerConfig {
            max_lease_per_second: 5,
            max_concurrent: 10,
            idle_poll_interval: Duration::from_millis(10),
            ..LeaseWorkerConfig::default()
        });
        let mut instances = Vec::new();
        for _ in 0..3 {
            let instance = fx.instance("quick", json!({})).await;
            fx.queue.enqueue(instance.clone()).await.unwrap();
            instances.push(instance);
        }

        fx.queue.listen().await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        let mut done = 0;
        for instance in &instances {
            if fx.stored_status(instance).await == JobStatus::Done {
                done += 1;
            }
        }
        assert_eq!(done, 2);
        fx.queue.shutdown().await.unwrap();
    }
}
