//! Infrastructure layer: job persistence, execution backends, the worker facade.

pub mod jobs;
pub mod queue;
pub mod worker;

#[cfg(test)]
mod integration_tests;

pub use jobs::{
    InMemoryJobStore, InstanceRecord, InstanceState, JobHandle, JobHandler, JobInstance,
    JobRecord, JobStore, JobStoreError, PostgresJobStore, Registry, RunOutcome, RunnerConfig,
};
pub use queue::Queue;
pub use worker::{Worker, WorkerBuilder};
