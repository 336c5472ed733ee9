//! Job definitions, persisted job state and the shared runner.
//!
//! ## Design
//!
//! - A job is a named unit of work; every execution of it is an instance
//! - Instance state (status, progress, log) is persisted through a [`JobStore`]
//! - While a handler runs, state changes are flushed by a heartbeat instead of
//!   on every write
//! - An instance is dispatched at most once: the move into `Running` is a
//!   compare-and-set in the store
//!
//! ## Components
//!
//! - [`Registry`] / [`JobRegistry`]: job definitions, sealed before workers start
//! - [`JobStore`]: persistence for jobs and instances (in-memory or Postgres)
//! - [`JobInstance`]: live view of one execution, with its heartbeat
//! - [`Runner`]: invokes handlers, recovers panics, applies the final status

pub mod instance;
pub mod postgres;
pub mod registry;
pub mod runner;
pub mod store;
pub mod types;

pub use instance::{JobHandle, JobInstance};
pub use postgres::PostgresJobStore;
pub use registry::{JobDefinition, JobHandler, JobRegistry, Registry};
pub use runner::{ClaimedRun, PanicPayload, RunOutcome, Runner, RunnerConfig};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{InstanceRecord, InstanceState, JobRecord, MAX_PROGRESS};
