//! Job instance status and its transition rules.
//!
//! ```text
//! New ──► Scheduled ──► Running ──► Done | Exception | Killed
//!  │          │
//!  └──────────┴──► Killed | Cancelled   (never dispatched)
//! ```
//!
//! `New` may also go straight to `Running` when no future run time is set.
//! Terminal states have no outgoing edges.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::WorkerError;

/// Execution status of a job instance (mirrored onto its job).
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not yet dispatched.
    #[default]
    New,
    /// Dispatch deferred to a future run time.
    Scheduled,
    /// Handler is executing.
    Running,
    /// Handler returned successfully.
    Done,
    /// Handler returned an error or panicked.
    Exception,
    /// Stopped through the queue (`kill`/`remove`), running or not.
    Killed,
    /// Cancelled by an administrator before it ever ran.
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::New,
        JobStatus::Scheduled,
        JobStatus::Running,
        JobStatus::Done,
        JobStatus::Exception,
        JobStatus::Killed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::New => "new",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Exception => "exception",
            JobStatus::Killed => "killed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Exception | JobStatus::Killed | JobStatus::Cancelled
        )
    }

    /// Whether an instance in this status may be dispatched into `Running`.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, JobStatus::New | JobStatus::Scheduled)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;

        match (self, next) {
            (New, Scheduled) => true,
            (New | Scheduled, Running) => true,
            (New | Scheduled, Killed | Cancelled) => true,
            (Running, Done | Exception | Killed) => true,
            _ => false,
        }
    }

    /// Validate a transition, returning the new status.
    pub fn transition(self, next: JobStatus) -> Result<JobStatus, WorkerError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(WorkerError::invalid_state(
                self,
                format!("cannot move job from {} to {}", self, next),
            ))
        }
    }

    /// Precondition for dispatch; guarantees at-most-once execution per instance.
    pub fn ensure_dispatchable(self) -> Result<(), WorkerError> {
        if self.is_dispatchable() {
            Ok(())
        } else {
            Err(WorkerError::invalid_state(self, "invalid job status for dispatch"))
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| WorkerError::argument(format!("unknown job status: {s}")))
    }
}
