//! Execution runner shared by every queue backend.
//!
//! `run` claims the instance, starts its heartbeat, invokes the handler under a
//! child cancellation token and turns the result into a terminal status:
//!
//! | Handler result | Status | Log / progress text |
//! |----------------|--------|---------------------|
//! | `Ok(())` | `Done` (progress 100) | unchanged |
//! | `Err(e)` | `Exception` | `e` appended and set as text |
//! | panic | `Exception` | backtrace appended, panic message set as text |
//!
//! If the instance was killed while the handler ran, the terminal `Killed`
//! status is kept.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use jobworks_core::{InstanceId, JobStatus, WorkerError, WorkerResult};

use super::instance::{JobHandle, JobInstance};
use super::registry::{JobHandler, JobRegistry};
use super::store::JobStore;

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// How often a running instance is persisted.
    pub heartbeat_interval: Duration,
    /// How often the lease backend checks for expiration.
    pub expiration_poll_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            expiration_poll_interval: Duration::from_secs(1),
        }
    }
}

/// A panic caught while running a handler.
pub struct PanicPayload {
    message: String,
    payload: Box<dyn Any + Send + 'static>,
}

impl PanicPayload {
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Continue unwinding with the original payload.
    pub fn resume(self) -> ! {
        std::panic::resume_unwind(self.payload)
    }
}

impl std::fmt::Debug for PanicPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PanicPayload").field("message", &self.message).finish()
    }
}

/// How a run ended.
#[derive(Debug)]
pub enum RunOutcome {
    Done,
    Failed(String),
    Killed,
    Panicked(PanicPayload),
}

impl RunOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            RunOutcome::Done => JobStatus::Done,
            RunOutcome::Failed(_) | RunOutcome::Panicked(_) => JobStatus::Exception,
            RunOutcome::Killed => JobStatus::Killed,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Done)
    }

    /// The failure this outcome reports, if any.
    pub fn error(&self) -> Option<WorkerError> {
        match self {
            RunOutcome::Done => None,
            RunOutcome::Failed(message) => Some(WorkerError::Handler(message.clone())),
            RunOutcome::Panicked(payload) => Some(WorkerError::Panic(payload.message.clone())),
            RunOutcome::Killed => Some(WorkerError::invalid_state(JobStatus::Killed, "job was killed")),
        }
    }
}

/// Invokes registered handlers for job instances.
#[derive(Clone)]
pub struct Runner {
    registry: Arc<JobRegistry>,
    store: Arc<dyn JobStore>,
    config: RunnerConfig,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Runner {
    pub fn new(registry: Arc<JobRegistry>, store: Arc<dyn JobStore>, config: RunnerConfig) -> Self {
        install_panic_hook();
        Self {
            registry,
            store,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub async fn load_instance(&self, instance_id: InstanceId) -> WorkerResult<Arc<JobInstance>> {
        JobInstance::load(Arc::clone(&self.store), instance_id).await
    }

    /// Run `instance` to completion.
    ///
    /// Fails before invoking the handler when the job is unknown or the instance
    /// is not `New`/`Scheduled`. Handler errors and panics are not errors here;
    /// they are reported through the returned [`RunOutcome`].
    pub async fn run(
        &self,
        ctx: CancellationToken,
        instance: Arc<JobInstance>,
    ) -> WorkerResult<RunOutcome> {
        let claimed = self.claim(instance).await?;
        self.execute(ctx, claimed).await
    }

    /// Resolve the handler and move the instance to `Running`.
    ///
    /// Exactly one claim per instance succeeds; every other caller gets
    /// `InvalidState` carrying the status it lost to.
    pub async fn claim(&self, instance: Arc<JobInstance>) -> WorkerResult<ClaimedRun> {
        let handler = self.registry.resolve(instance.job_name())?.handler();
        instance.begin_run().await?;
        Ok(ClaimedRun { instance, handler })
    }

    /// Invoke the handler of a claimed instance and record how it ended.
    ///
    /// The heartbeat is stopped on every path, including a failed settle.
    pub async fn execute(
        &self,
        ctx: CancellationToken,
        claimed: ClaimedRun,
    ) -> WorkerResult<RunOutcome> {
        let ClaimedRun { instance, handler } = claimed;
        instance.start_heartbeat(self.config.heartbeat_interval).await;

        let span = info_span!(
            "job",
            job_id = %instance.job_id(),
            instance_id = %instance.id(),
            job_name = %instance.job_name(),
        );
        span.in_scope(|| info!("job started"));

        let handle = JobHandle::new(Arc::clone(&instance));
        let result = AssertUnwindSafe(handler.run(ctx.child_token(), handle).instrument(span.clone()))
            .catch_unwind()
            .await;

        let settled = match result {
            Ok(Ok(())) => settle(&instance, JobStatus::Done).await.map(|applied| {
                if applied { RunOutcome::Done } else { RunOutcome::Killed }
            }),
            Ok(Err(err)) => {
                let message = format!("{err:#}");
                settle_with_text(&instance, &message, &message)
                    .await
                    .map(|applied| {
                        if applied { RunOutcome::Failed(message) } else { RunOutcome::Killed }
                    })
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                let trace = take_panic_trace().unwrap_or_else(|| message.clone());
                span.in_scope(|| error!(panic = %message, "job handler panicked\n{trace}"));
                settle_with_text(&instance, &trace, &message)
                    .await
                    .map(|_| RunOutcome::Panicked(PanicPayload { message, payload }))
            }
        };

        let stopped = instance.stop_heartbeat().await;
        if let Err(err) = &stopped {
            span.in_scope(|| error!(error = %err, "failed to persist final job state"));
        }
        let outcome = settled?;
        stopped?;

        span.in_scope(|| match &outcome {
            RunOutcome::Done => info!("job done"),
            RunOutcome::Failed(message) => warn!(error = %message, "job failed"),
            RunOutcome::Killed => info!("job killed"),
            RunOutcome::Panicked(_) => {}
        });
        Ok(outcome)
    }
}

/// An instance this process has moved to `Running`, with its handler.
pub struct ClaimedRun {
    instance: Arc<JobInstance>,
    handler: Arc<dyn JobHandler>,
}

impl ClaimedRun {
    pub fn instance(&self) -> &Arc<JobInstance> {
        &self.instance
    }
}

impl std::fmt::Debug for ClaimedRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimedRun")
            .field("instance_id", &self.instance.id())
            .finish_non_exhaustive()
    }
}

/// Apply a terminal status. Returns `false` when the instance already reached a
/// terminal status (killed while running).
async fn settle(instance: &JobInstance, next: JobStatus) -> WorkerResult<bool> {
    match instance.set_status(next).await {
        Ok(()) => Ok(true),
        Err(err) if err.current_status().is_some_and(|s| s.is_terminal()) => Ok(false),
        Err(err) => Err(err),
    }
}

async fn settle_with_text(instance: &JobInstance, log: &str, text: &str) -> WorkerResult<bool> {
    if instance.status().await.is_terminal() {
        return Ok(false);
    }
    instance.add_log(log).await?;
    instance.set_progress_text(text).await?;
    settle(instance, JobStatus::Exception).await
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

thread_local! {
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a panic hook that keeps the backtrace of the last panic on this thread.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let trace = format!("{info}\n{}", Backtrace::force_capture());
            PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

fn take_panic_trace() -> Option<String> {
    PANIC_TRACE.with(|slot| slot.borrow_mut().take())
}
