//! Typed job arguments and optional deferred scheduling.
//!
//! Arguments are persisted as an opaque JSON blob on each instance. A job
//! definition that takes arguments registers an [`ArgsDescriptor`] built from a
//! concrete [`JobArgs`] type; the descriptor validates submitted blobs and
//! extracts the optional schedule time without the worker knowing the type.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value as JsonValue;

use crate::error::WorkerError;

/// Smallest delay for which execution is deferred instead of dispatched now.
///
/// One minute is the resolution of a crontab line.
pub fn min_lead_time() -> Duration {
    Duration::seconds(60)
}

/// Arguments accepted by a job handler.
pub trait JobArgs: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Requested run time, if the job should not start immediately.
    fn schedule_time(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// Embeddable schedule (use `#[serde(flatten)]` inside an argument struct).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub schedule_time: Option<DateTime<Utc>>,
}

impl Schedule {
    pub fn at(time: DateTime<Utc>) -> Self {
        Self {
            schedule_time: Some(time),
        }
    }

    /// The run time to defer to, if it lies beyond `now + min_lead_time()`.
    pub fn deferred_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        deferred_until(self.schedule_time, now)
    }
}

impl JobArgs for Schedule {
    fn schedule_time(&self) -> Option<DateTime<Utc>> {
        self.schedule_time
    }
}

/// Returns `at` when it is strictly later than `now + min_lead_time()`.
pub fn deferred_until(at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    at.filter(|t| *t > now + min_lead_time())
}

/// Type-erased view of a registered argument type.
#[derive(Debug, Clone, Copy)]
pub struct ArgsDescriptor {
    type_name: &'static str,
    validate: fn(&JsonValue) -> Result<(), WorkerError>,
    schedule_time: fn(&JsonValue) -> Result<Option<DateTime<Utc>>, WorkerError>,
}

impl ArgsDescriptor {
    pub fn of<T: JobArgs>() -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            validate: |raw| decode::<T>(raw).map(|_| ()),
            schedule_time: |raw| decode::<T>(raw).map(|args| args.schedule_time()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn validate(&self, raw: &JsonValue) -> Result<(), WorkerError> {
        (self.validate)(raw)
    }

    pub fn schedule_time(&self, raw: &JsonValue) -> Result<Option<DateTime<Utc>>, WorkerError> {
        (self.schedule_time)(raw)
    }
}

/// Decode a stored argument blob into its typed form.
pub fn decode<T: DeserializeOwned>(raw: &JsonValue) -> Result<T, WorkerError> {
    T::deserialize(raw).map_err(|e| {
        WorkerError::argument(format!("cannot decode {}: {e}", std::any::type_name::<T>()))
    })
}

/// Serialize arguments for storage.
pub fn encode<T: Serialize + ?Sized>(args: &T) -> Result<JsonValue, WorkerError> {
    serde_json::to_value(args).map_err(|e| WorkerError::argument(format!("cannot encode arguments: {e}")))
}
