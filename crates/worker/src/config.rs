//! Process configuration from the environment.

use std::time::Duration;

use jobworks_core::{WorkerError, WorkerResult};
use jobworks_infra::RunnerConfig;
use jobworks_infra::queue::lease::LeaseWorkerConfig;

pub const DATABASE_URL_ENV: &str = "DATABASE_URL";
pub const BACKEND_ENV: &str = "JOBWORKS_BACKEND";
pub const HEARTBEAT_SECS_ENV: &str = "JOBWORKS_HEARTBEAT_SECS";
pub const MAX_CONCURRENT_ENV: &str = "JOBWORKS_MAX_CONCURRENT";
pub const MAX_LEASE_PER_SECOND_ENV: &str = "JOBWORKS_MAX_LEASE_PER_SECOND";

/// Which execution backend the process uses.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Lease,
    Cron,
}

impl std::str::FromStr for BackendKind {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lease" => Ok(BackendKind::Lease),
            "cron" => Ok(BackendKind::Cron),
            other => Err(WorkerError::configuration(format!(
                "{BACKEND_ENV} must be `lease` or `cron`, got `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Postgres connection string. Without it everything is kept in memory.
    pub database_url: Option<String>,
    pub backend: BackendKind,
    pub runner: RunnerConfig,
    pub lease: LeaseWorkerConfig,
}

impl WorkerConfig {
    pub fn from_env() -> WorkerResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> WorkerResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backend = match var(BACKEND_ENV) {
            Some(raw) => raw.parse()?,
            None => BackendKind::default(),
        };

        let mut runner = RunnerConfig::default();
        if let Some(secs) = parse_number::<u64>(HEARTBEAT_SECS_ENV, var(HEARTBEAT_SECS_ENV))? {
            if secs == 0 {
                return Err(WorkerError::configuration(format!(
                    "{HEARTBEAT_SECS_ENV} must be at least 1"
                )));
            }
            runner.heartbeat_interval = Duration::from_secs(secs);
        }

        let mut lease = LeaseWorkerConfig::default();
        if let Some(n) = parse_number::<usize>(MAX_CONCURRENT_ENV, var(MAX_CONCURRENT_ENV))? {
            lease.max_concurrent = n.max(1);
        }
        if let Some(n) = parse_number::<u32>(MAX_LEASE_PER_SECOND_ENV, var(MAX_LEASE_PER_SECOND_ENV))? {
            lease.max_lease_per_second = n.max(1);
        }

        Ok(Self {
            database_url: var(DATABASE_URL_ENV),
            backend,
            runner,
            lease,
        })
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: Option<String>) -> WorkerResult<Option<T>> {
    raw.map(|raw| {
        raw.trim()
            .parse()
            .map_err(|_| WorkerError::configuration(format!("{key} must be a number, got `{raw}`")))
    })
    .transpose()
}
