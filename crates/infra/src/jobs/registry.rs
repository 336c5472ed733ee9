//! Job definition registry.
//!
//! Definitions are collected into a [`Registry`] at startup and then sealed into
//! an immutable [`JobRegistry`]; nothing can be defined after sealing.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use jobworks_core::{ArgsDescriptor, JobArgs, WorkerError, WorkerResult};

use super::instance::JobHandle;

/// Business logic run for a job.
///
/// Handlers must poll `ctx` to be stoppable on the lease backend.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn run(&self, ctx: CancellationToken, job: JobHandle) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(CancellationToken, JobHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, ctx: CancellationToken, job: JobHandle) -> anyhow::Result<()> {
        (self)(ctx, job).await
    }
}

/// A named job and its handler.
#[derive(Clone)]
pub struct JobDefinition {
    name: String,
    args: Option<ArgsDescriptor>,
    handler: Arc<dyn JobHandler>,
}

impl std::fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDefinition")
            .field("name", &self.name)
            .field("args", &self.args.map(|a| a.type_name()))
            .finish_non_exhaustive()
    }
}

impl JobDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> Option<&ArgsDescriptor> {
        self.args.as_ref()
    }

    pub fn handler(&self) -> Arc<dyn JobHandler> {
        Arc::clone(&self.handler)
    }

    /// Check a submitted argument blob against the registered type.
    pub fn validate_args(&self, raw: &serde_json::Value) -> WorkerResult<()> {
        match &self.args {
            Some(descriptor) => descriptor.validate(raw),
            None => Ok(()),
        }
    }

    /// Requested run time carried by the arguments, if any.
    pub fn schedule_time(
        &self,
        raw: &serde_json::Value,
    ) -> WorkerResult<Option<chrono::DateTime<chrono::Utc>>> {
        match &self.args {
            Some(descriptor) => descriptor.schedule_time(raw),
            None => Ok(None),
        }
    }
}

/// Registry under construction.
#[derive(Default)]
pub struct Registry {
    definitions: BTreeMap<String, JobDefinition>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a job without typed arguments.
    ///
    /// # Panics
    ///
    /// On an empty or already registered name.
    pub fn define<H: JobHandler>(&mut self, name: impl Into<String>, handler: H) -> &mut Self {
        self.insert(name.into(), None, Arc::new(handler));
        self
    }

    /// Define a job whose arguments decode into `T`.
    ///
    /// # Panics
    ///
    /// On an empty or already registered name.
    pub fn define_with_args<T: JobArgs, H: JobHandler>(
        &mut self,
        name: impl Into<String>,
        handler: H,
    ) -> &mut Self {
        self.insert(name.into(), Some(ArgsDescriptor::of::<T>()), Arc::new(handler));
        self
    }

    /// Fallible form of [`Registry::define`]/[`Registry::define_with_args`].
    pub fn try_define(
        &mut self,
        name: impl Into<String>,
        args: Option<ArgsDescriptor>,
        handler: Arc<dyn JobHandler>,
    ) -> WorkerResult<&mut Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(WorkerError::configuration("job name must not be empty"));
        }
        if self.definitions.contains_key(&name) {
            return Err(WorkerError::configuration(format!(
                "job {name} is already registered"
            )));
        }
        self.definitions.insert(
            name.clone(),
            JobDefinition {
                name,
                args,
                handler,
            },
        );
        Ok(self)
    }

    fn insert(&mut self, name: String, args: Option<ArgsDescriptor>, handler: Arc<dyn JobHandler>) {
        if let Err(err) = self.try_define(name, args, handler) {
            panic!("{err}");
        }
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Freeze the registry.
    pub fn seal(self) -> Arc<JobRegistry> {
        Arc::new(JobRegistry {
            definitions: self.definitions,
        })
    }
}

/// Sealed, read-only registry shared by the runner and the queue backends.
#[derive(Debug)]
pub struct JobRegistry {
    definitions: BTreeMap<String, JobDefinition>,
}

impl JobRegistry {
    /// Look up a definition. Unknown names are a recoverable `NotFound`.
    pub fn resolve(&self, name: &str) -> WorkerResult<&JobDefinition> {
        self.definitions
            .get(name)
            .ok_or_else(|| WorkerError::not_found(format!("job definition {name}")))
    }

    /// Registered job names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }

    pub fn definitions(&self) -> impl Iterator<Item = &JobDefinition> {
        self.definitions.values()
    }
}
