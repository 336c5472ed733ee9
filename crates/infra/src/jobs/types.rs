//! Persisted job and instance records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use jobworks_core::{InstanceId, JobId, JobStatus, WorkerError};

/// Maximum value of `progress`.
pub const MAX_PROGRESS: u8 = 100;

/// A named execution request.
///
/// `status` mirrors the latest instance's status for fast listing; it is the
/// only field ever updated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            status: JobStatus::New,
            created_at: Utc::now(),
        }
    }
}

/// The mutable part of an instance (guarded by the instance mutex at runtime).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstanceState {
    pub status: JobStatus,
    /// 0..=100
    pub progress: u8,
    /// Latest free-form status message.
    pub progress_text: String,
    /// Append-only, newline-delimited.
    pub log: String,
}

impl InstanceState {
    /// Append one entry to the log.
    pub fn append_log(&mut self, line: &str) {
        if !self.log.is_empty() {
            self.log.push('\n');
        }
        self.log.push_str(line);
    }

    pub fn set_progress(&mut self, progress: u32) {
        self.progress = progress.min(MAX_PROGRESS as u32) as u8;
    }

    /// Apply a validated status transition. `Done` pins progress to 100.
    pub fn set_status(&mut self, next: JobStatus) -> Result<(), WorkerError> {
        self.status = self.status.transition(next)?;
        if next == JobStatus::Done {
            self.progress = MAX_PROGRESS;
        }
        Ok(())
    }
}

/// One execution attempt of a job, as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub job_id: JobId,
    pub job_name: String,
    /// Serialized arguments, decoded per the job definition's argument type.
    pub args: JsonValue,
    /// Who submitted the job, if known.
    pub operator: Option<String>,
    pub state: InstanceState,
    pub created_at: DateTime<Utc>,
}

impl InstanceRecord {
    pub fn new(job: &JobRecord, args: JsonValue, operator: Option<String>) -> Self {
        Self {
            id: InstanceId::new(),
            job_id: job.id,
            job_name: job.name.clone(),
            args,
            operator,
            state: InstanceState::default(),
            created_at: Utc::now(),
        }
    }
}
