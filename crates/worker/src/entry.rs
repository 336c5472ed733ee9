//! The single place that looks at argv.
//!
//! A process started with `--job-instance <id>` runs that instance and exits;
//! `--submit <job> [json]` creates a job; anything else serves.

use jobworks_core::{InstanceId, WorkerError, WorkerResult};
use jobworks_infra::queue::cron::{ChildExit, JOB_INSTANCE_FLAG};

pub const SUBMIT_FLAG: &str = "--submit";

#[derive(Debug, Clone, PartialEq)]
pub enum Mode {
    /// Long-lived worker: start consumers and wait for a shutdown signal.
    Serve,
    /// Run one job instance to completion, then exit.
    RunInstance(InstanceId),
    /// Create a job and exit.
    Submit {
        job: String,
        args: serde_json::Value,
    },
}

/// Decide the process mode from its arguments (without the program name).
pub fn parse_mode<I, S>(args: I) -> WorkerResult<Mode>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_string()).collect();

    if let Some(pos) = args.iter().position(|a| a == JOB_INSTANCE_FLAG) {
        let raw = args
            .get(pos + 1)
            .ok_or_else(|| WorkerError::configuration(format!("{JOB_INSTANCE_FLAG} needs an instance id")))?;
        let id = raw
            .parse()
            .map_err(|_| WorkerError::configuration(format!("invalid job instance id `{raw}`")))?;
        return Ok(Mode::RunInstance(id));
    }

    if let Some(pos) = args.iter().position(|a| a == SUBMIT_FLAG) {
        let job = args
            .get(pos + 1)
            .ok_or_else(|| WorkerError::configuration(format!("{SUBMIT_FLAG} needs a job name")))?
            .clone();
        let args = match args.get(pos + 2) {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| WorkerError::argument(format!("job arguments are not JSON: {e}")))?,
            None => serde_json::Value::Null,
        };
        return Ok(Mode::Submit { job, args });
    }

    Ok(Mode::Serve)
}

/// Exit code of a `--job-instance` process.
///
/// The handler's own failure and a rejected dispatch both exit 1.
pub fn exit_code(result: &WorkerResult<ChildExit>) -> i32 {
    match result {
        Ok(exit) => exit.exit_code(),
        Err(_) => 1,
    }
}
