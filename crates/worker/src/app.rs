//! Process wiring: store, backend and registry.

use std::sync::Arc;

use sqlx::PgPool;
use tracing::{info, warn};

use jobworks_core::{WorkerError, WorkerResult};
use jobworks_infra::jobs::JobStore;
use jobworks_infra::queue::cron::{SelfExec, SystemCrontab};
use jobworks_infra::queue::lease::{InMemoryLeaseStore, LeaseStore, PostgresLeaseStore};
use jobworks_infra::{InMemoryJobStore, PostgresJobStore, Registry, Worker};

use crate::config::{BackendKind, WorkerConfig};

/// Connect to the configured store and assemble the worker.
pub async fn build_worker(config: &WorkerConfig, registry: Registry) -> WorkerResult<Worker> {
    let pool = match &config.database_url {
        Some(url) => Some(
            PgPool::connect(url)
                .await
                .map_err(|e| WorkerError::storage(format!("cannot connect to Postgres: {e}")))?,
        ),
        None => {
            warn!("DATABASE_URL not set; jobs are kept in memory and lost on exit");
            None
        }
    };

    let store: Arc<dyn JobStore> = match &pool {
        Some(pool) => {
            let store = PostgresJobStore::new(pool.clone());
            store.migrate().await?;
            Arc::new(store)
        }
        None => InMemoryJobStore::arc(),
    };

    let builder = Worker::builder(store, registry).runner_config(config.runner.clone());
    let builder = match config.backend {
        BackendKind::Cron => {
            builder.with_cron(Arc::new(SystemCrontab::new()), Arc::new(SelfExec::current()?))
        }
        BackendKind::Lease => {
            let leases: Arc<dyn LeaseStore> = match &pool {
                Some(pool) => {
                    let leases = PostgresLeaseStore::new(pool.clone());
                    leases.migrate().await?;
                    Arc::new(leases)
                }
                None => InMemoryLeaseStore::arc(),
            };
            builder.with_lease(leases, config.lease.clone())
        }
    };

    let worker = builder.build()?;
    info!(backend = ?config.backend, persistent = pool.is_some(), "worker ready");
    Ok(worker)
}
