//! Crontab side channel.
//!
//! Job entries live in the user crontab as bracketed blocks:
//!
//! ```text
//! ## BEGIN JOBWORKS JOB <job-id> # {"job_id":..,"instance_id":..,"pid":..,"command":..}
//! <cron line, only for scheduled entries>
//! ## END JOBWORKS JOB
//! ```
//!
//! Every line outside a block is preserved verbatim.

use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{instrument, warn};

use jobworks_core::{InstanceId, JobId, WorkerError, WorkerResult};

const BEGIN_MARKER: &str = "## BEGIN JOBWORKS JOB";
const END_MARKER: &str = "## END JOBWORKS JOB";

/// One job block of the crontab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronEntry {
    pub job_id: JobId,
    pub instance_id: InstanceId,
    /// Set for a forked, running process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Cron line for a scheduled entry.
    #[serde(default)]
    pub command: String,
}

impl CronEntry {
    pub fn scheduled(job_id: JobId, instance_id: InstanceId, command: String) -> Self {
        Self {
            job_id,
            instance_id,
            pid: None,
            command,
        }
    }

    pub fn forked(job_id: JobId, instance_id: InstanceId, pid: u32) -> Self {
        Self {
            job_id,
            instance_id,
            pid: Some(pid),
            command: String::new(),
        }
    }

    fn render(&self, out: &mut String) -> WorkerResult<()> {
        let meta = serde_json::to_string(self)
            .map_err(|e| WorkerError::backend(format!("cannot encode crontab entry: {e}")))?;
        out.push_str(&format!("{BEGIN_MARKER} {} # {meta}\n", self.job_id));
        if !self.command.is_empty() {
            out.push_str(&self.command);
            out.push('\n');
        }
        out.push_str(END_MARKER);
        out.push('\n');
        Ok(())
    }
}

/// Parsed crontab: foreign lines plus job entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrontabDocument {
    preserved: Vec<String>,
    entries: Vec<CronEntry>,
}

impl CrontabDocument {
    pub fn parse(text: &str) -> Self {
        let mut doc = Self::default();
        let mut in_block = false;

        for line in text.lines() {
            if line.starts_with(BEGIN_MARKER) {
                in_block = true;
                match line.split_once(" # ").map(|(_, meta)| serde_json::from_str(meta)) {
                    Some(Ok(entry)) => doc.entries.push(entry),
                    _ => warn!(line, "skipping unreadable crontab job entry"),
                }
                continue;
            }
            if line.starts_with(END_MARKER) {
                in_block = false;
                continue;
            }
            if !in_block {
                doc.preserved.push(line.to_string());
            }
        }

        doc
    }

    pub fn render(&self) -> WorkerResult<String> {
        let mut out = String::new();
        for line in &self.preserved {
            out.push_str(line);
            out.push('\n');
        }
        for entry in &self.entries {
            entry.render(&mut out)?;
        }
        Ok(out)
    }

    pub fn entries(&self) -> &[CronEntry] {
        &self.entries
    }

    pub fn preserved_lines(&self) -> &[String] {
        &self.preserved
    }

    pub fn find(&self, job_id: JobId) -> Option<&CronEntry> {
        self.entries.iter().find(|e| e.job_id == job_id)
    }

    /// Insert `entry`, replacing any entry of the same job.
    pub fn upsert(&mut self, entry: CronEntry) {
        self.entries.retain(|e| e.job_id != entry.job_id);
        self.entries.push(entry);
    }

    /// Remove the entry of `job_id`, returning it.
    pub fn remove(&mut self, job_id: JobId) -> Option<CronEntry> {
        let idx = self.entries.iter().position(|e| e.job_id == job_id)?;
        Some(self.entries.remove(idx))
    }

    /// Remove the entry of `instance_id` only, leaving a newer instance of the
    /// same job untouched.
    pub fn remove_instance(&mut self, instance_id: InstanceId) -> Option<CronEntry> {
        let idx = self.entries.iter().position(|e| e.instance_id == instance_id)?;
        Some(self.entries.remove(idx))
    }
}

/// Where scheduling metadata is persisted.
#[async_trait]
pub trait SchedulingSideChannel: Send + Sync {
    async fn read(&self) -> WorkerResult<CrontabDocument>;
    async fn write(&self, doc: &CrontabDocument) -> WorkerResult<()>;
}

/// The current user's crontab, through the `crontab` command.
#[derive(Debug, Clone)]
pub struct SystemCrontab {
    program: String,
}

impl SystemCrontab {
    pub fn new() -> Self {
        Self {
            program: "crontab".to_string(),
        }
    }

    /// Use a different `crontab` executable.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for SystemCrontab {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchedulingSideChannel for SystemCrontab {
    #[instrument(skip(self), err)]
    async fn read(&self) -> WorkerResult<CrontabDocument> {
        let output = Command::new(&self.program)
            .arg("-l")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| WorkerError::backend(format!("cannot run {} -l: {e}", self.program)))?;

        // `crontab -l` exits non-zero when the user has no crontab yet.
        if !output.status.success() {
            return Ok(CrontabDocument::default());
        }

        let text = String::from_utf8_lossy(&output.stdout);
        Ok(CrontabDocument::parse(&text))
    }

    #[instrument(skip(self, doc), fields(entries = doc.entries().len()), err)]
    async fn write(&self, doc: &CrontabDocument) -> WorkerResult<()> {
        let rendered = doc.render()?;
        let mut child = Command::new(&self.program)
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| WorkerError::backend(format!("cannot run {} -: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(rendered.as_bytes())
                .await
                .map_err(|e| WorkerError::backend(format!("cannot write crontab: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| WorkerError::backend(format!("cannot install crontab: {e}")))?;
        if !output.status.success() {
            return Err(WorkerError::backend(format!(
                "crontab install failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// In-memory side channel for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySideChannel {
    text: Mutex<String>,
}

impl InMemorySideChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing crontab text.
    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            text: Mutex::new(text.into()),
        }
    }

    /// The crontab as last written.
    pub fn text(&self) -> String {
        self.text.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SchedulingSideChannel for InMemorySideChannel {
    async fn read(&self) -> WorkerResult<CrontabDocument> {
        Ok(CrontabDocument::parse(&self.text()))
    }

    async fn write(&self, doc: &CrontabDocument) -> WorkerResult<()> {
        let rendered = doc.render()?;
        let mut text = self
            .text
            .lock()
            .map_err(|_| WorkerError::backend("side channel lock poisoned"))?;
        *text = rendered;
        Ok(())
    }
}
