//! `jobworks-core`: domain building blocks for the background job worker.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod args;
pub mod error;
pub mod id;
pub mod status;

pub use args::{ArgsDescriptor, JobArgs, Schedule, deferred_until, min_lead_time};
pub use error::{WorkerError, WorkerResult};
pub use id::{InstanceId, JobId};
pub use status::JobStatus;
