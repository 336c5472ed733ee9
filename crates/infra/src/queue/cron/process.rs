//! Process control for the cron backend.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, instrument};

use jobworks_core::{InstanceId, WorkerError, WorkerResult};

/// Command-line flag that makes the executable run one job instance and exit.
pub const JOB_INSTANCE_FLAG: &str = "--job-instance";

/// Starting and stopping job processes.
pub trait ProcessControl: Send + Sync {
    /// Start a detached process running `instance_id`; returns its PID.
    fn spawn_job(&self, instance_id: InstanceId) -> WorkerResult<u32>;

    /// Send SIGKILL to `pid`. A process that no longer exists is not an error.
    fn kill(&self, pid: u32) -> WorkerResult<()>;

    /// Shell command a crontab line runs to execute `instance_id`.
    fn command_line(&self, instance_id: InstanceId) -> String;
}

/// Re-executes the current binary with [`JOB_INSTANCE_FLAG`].
#[derive(Debug, Clone)]
pub struct SelfExec {
    executable: PathBuf,
    working_dir: PathBuf,
}

impl SelfExec {
    pub fn new(executable: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            working_dir: working_dir.into(),
        }
    }

    /// The running executable, started from the current directory.
    pub fn current() -> WorkerResult<Self> {
        let executable = std::env::current_exe()
            .map_err(|e| WorkerError::configuration(format!("cannot locate current executable: {e}")))?;
        let working_dir = std::env::current_dir()
            .map_err(|e| WorkerError::configuration(format!("cannot read working directory: {e}")))?;
        Ok(Self::new(executable, working_dir))
    }
}

impl ProcessControl for SelfExec {
    #[instrument(skip(self), fields(instance_id = %instance_id), err)]
    fn spawn_job(&self, instance_id: InstanceId) -> WorkerResult<u32> {
        let child = Command::new(&self.executable)
            .arg(JOB_INSTANCE_FLAG)
            .arg(instance_id.to_string())
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| {
                WorkerError::backend(format!(
                    "cannot start {}: {e}",
                    self.executable.display()
                ))
            })?;

        let pid = child
            .id()
            .ok_or_else(|| WorkerError::backend("job process exited before reporting a pid"))?;
        debug!(pid, "job process started");
        // Dropping the handle detaches the child; the runtime reaps it.
        drop(child);
        Ok(pid)
    }

    fn kill(&self, pid: u32) -> WorkerResult<()> {
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| WorkerError::backend(format!("invalid pid {pid}")))?;
        // SAFETY: kill(2) has no memory-safety preconditions.
        let ret = unsafe { libc::kill(pid, libc::SIGKILL) };
        if ret == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            debug!(pid, "job process already gone");
            return Ok(());
        }
        Err(WorkerError::backend(format!("cannot kill process {pid}: {err}")))
    }

    fn command_line(&self, instance_id: InstanceId) -> String {
        format!(
            "cd {}; {} {JOB_INSTANCE_FLAG} {instance_id}",
            shell_quote(&self.working_dir.display().to_string()),
            shell_quote(&self.executable.display().to_string()),
        )
    }
}

fn shell_quote(raw: &str) -> String {
    if !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+:@".contains(c))
    {
        raw.to_string()
    } else {
        format!("'{}'", raw.replace('\'', r"'\''"))
    }
}
