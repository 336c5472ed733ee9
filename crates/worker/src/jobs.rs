//! Job definitions shipped with the worker binary.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use jobworks_core::{JobArgs, Schedule};
use jobworks_infra::{JobHandle, Registry};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoArgs {
    pub message: String,
    #[serde(flatten)]
    pub schedule: Schedule,
}

impl JobArgs for EchoArgs {
    fn schedule_time(&self) -> Option<DateTime<Utc>> {
        self.schedule.schedule_time
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleepArgs {
    pub seconds: u32,
    #[serde(flatten)]
    pub schedule: Schedule,
}

impl JobArgs for SleepArgs {
    fn schedule_time(&self) -> Option<DateTime<Utc>> {
        self.schedule.schedule_time
    }
}

/// Write the message to the job log.
pub async fn echo(_ctx: CancellationToken, job: JobHandle) -> anyhow::Result<()> {
    let args: EchoArgs = job.argument()?;
    job.add_log(&args.message).await?;
    job.set_progress_text(args.message).await?;
    Ok(())
}

/// Sleep one second at a time, reporting progress; stops early when cancelled.
pub async fn sleep(ctx: CancellationToken, job: JobHandle) -> anyhow::Result<()> {
    let args: SleepArgs = job.argument()?;

    for elapsed in 1..=args.seconds {
        tokio::select! {
            _ = ctx.cancelled() => {
                job.add_log(format!("stopped after {} of {} seconds", elapsed - 1, args.seconds)).await?;
                anyhow::bail!("sleep cancelled");
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
        job.set_progress(percent(elapsed, args.seconds)).await?;
        job.set_progress_text(format!("{elapsed}/{} seconds", args.seconds)).await?;
    }
    Ok(())
}

fn percent(done: u32, total: u32) -> u32 {
    let share = u64::from(done) * 100 / u64::from(total.max(1));
    u32::try_from(share).unwrap_or(u32::MAX)
}

/// Registry with the builtin jobs.
pub fn builtin_registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .define_with_args::<EchoArgs, _>("echo", echo)
        .define_with_args::<SleepArgs, _>("sleep", sleep);
    registry
}
