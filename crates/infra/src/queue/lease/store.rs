//! Lease table abstraction.
//!
//! An item is leasable while it is not done or failed, its `run_at` has passed
//! and no unexpired lease is held on it. Leasing an item stamps `leased_until`,
//! which the worker renews while the handler runs; a worker that dies mid-run
//! lets the lease lapse, after which the item is handed out again and the
//! instance it left `Running` is marked `Killed`.
//!
//! Expired items are skipped unless they were leased before, so an item killed
//! while its worker was gone is still handed out once for cleanup.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use jobworks_core::{InstanceId, JobId, WorkerError};

pub type LeaseItemId = i64;

/// A work item to insert.
#[derive(Debug, Clone, PartialEq)]
pub struct LeasePlan {
    /// Dispatch channel (`worker_<job name>`).
    pub queue: String,
    pub job_id: JobId,
    pub instance_id: InstanceId,
    pub args: JsonValue,
    pub run_at: DateTime<Utc>,
}

/// A work item held under lease.
#[derive(Debug, Clone, PartialEq)]
pub struct LeasedItem {
    pub id: LeaseItemId,
    pub queue: String,
    pub job_id: JobId,
    pub instance_id: InstanceId,
    pub args: JsonValue,
    pub run_at: DateTime<Utc>,
    pub leased_until: DateTime<Utc>,
}

/// Lease store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LeaseStoreError {
    #[error("lease item {0} not found")]
    NotFound(LeaseItemId),
    #[error("lease storage error: {0}")]
    Storage(String),
}

impl From<LeaseStoreError> for WorkerError {
    fn from(err: LeaseStoreError) -> Self {
        match err {
            LeaseStoreError::NotFound(id) => WorkerError::not_found(format!("lease item {id}")),
            LeaseStoreError::Storage(msg) => WorkerError::backend(msg),
        }
    }
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn enqueue(&self, plan: &LeasePlan) -> Result<LeaseItemId, LeaseStoreError>;

    /// Lease the next due item of `queue` for `lease_for`.
    async fn lease(
        &self,
        queue: &str,
        lease_for: Duration,
    ) -> Result<Option<LeasedItem>, LeaseStoreError>;

    /// Extend the lease of an open item to `lease_for` from now.
    ///
    /// Returns the new `leased_until`.
    async fn renew(
        &self,
        id: LeaseItemId,
        lease_for: Duration,
    ) -> Result<DateTime<Utc>, LeaseStoreError>;

    /// Whether an open item of `instance_id` is held under an unexpired lease.
    async fn is_leased(&self, instance_id: InstanceId) -> Result<bool, LeaseStoreError>;

    /// Expiration timestamp of an item, if one was set.
    async fn expiration(&self, id: LeaseItemId) -> Result<Option<DateTime<Utc>>, LeaseStoreError>;

    /// Set the expiration of every open item of `instance_id`.
    ///
    /// Returns whether any item was open.
    async fn expire_instance(
        &self,
        instance_id: InstanceId,
        at: DateTime<Utc>,
    ) -> Result<bool, LeaseStoreError>;

    async fn mark_done(&self, id: LeaseItemId) -> Result<(), LeaseStoreError>;

    async fn mark_failed(&self, id: LeaseItemId, error: &str) -> Result<(), LeaseStoreError>;

    async fn mark_expired(&self, id: LeaseItemId, reason: &str) -> Result<(), LeaseStoreError>;

    /// Persist a failure of a worker loop (not of a job).
    async fn record_worker_error(&self, queue: &str, error: &str) -> Result<(), LeaseStoreError>;
}

/// Lifecycle of a stored item, as seen by tests and tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Pending,
    Done,
    Failed,
    Expired,
}

#[derive(Debug, Clone)]
struct Row {
    plan: LeasePlan,
    id: LeaseItemId,
    leased_until: Option<DateTime<Utc>>,
    expired_at: Option<DateTime<Utc>>,
    done_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl Row {
    fn is_open(&self) -> bool {
        self.done_at.is_none() && self.failed_at.is_none()
    }

    fn is_leasable(&self, queue: &str, now: DateTime<Utc>) -> bool {
        self.plan.queue == queue
            && self.is_open()
            && (self.expired_at.is_none() || self.leased_until.is_some())
            && self.plan.run_at <= now
            && self.leased_until.is_none_or(|until| until < now)
    }

    fn state(&self) -> ItemState {
        if self.done_at.is_some() {
            ItemState::Done
        } else if self.failed_at.is_some() {
            ItemState::Failed
        } else if self.expired_at.is_some() {
            ItemState::Expired
        } else {
            ItemState::Pending
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    next_id: LeaseItemId,
    items: Vec<Row>,
    worker_errors: Vec<(String, String)>,
}

/// In-memory lease store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    tables: Mutex<Tables>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, LeaseStoreError> {
        self.tables
            .lock()
            .map_err(|_| LeaseStoreError::Storage("lease store lock poisoned".to_string()))
    }

    fn update<F>(&self, id: LeaseItemId, f: F) -> Result<(), LeaseStoreError>
    where
        F: FnOnce(&mut Row),
    {
        let mut tables = self.lock()?;
        let row = tables
            .items
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(LeaseStoreError::NotFound(id))?;
        f(row);
        Ok(())
    }

    /// States of the items of `instance_id`, oldest first.
    pub fn item_states(&self, instance_id: InstanceId) -> Vec<ItemState> {
        self.lock()
            .map(|t| {
                t.items
                    .iter()
                    .filter(|r| r.plan.instance_id == instance_id)
                    .map(Row::state)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Plans of the items of `instance_id`, oldest first.
    pub fn plans(&self, instance_id: InstanceId) -> Vec<LeasePlan> {
        self.lock()
            .map(|t| {
                t.items
                    .iter()
                    .filter(|r| r.plan.instance_id == instance_id)
                    .map(|r| r.plan.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn last_error(&self, id: LeaseItemId) -> Option<String> {
        self.lock()
            .ok()?
            .items
            .iter()
            .find(|r| r.id == id)
            .and_then(|r| r.last_error.clone())
    }

    pub fn worker_errors(&self) -> Vec<(String, String)> {
        self.lock().map(|t| t.worker_errors.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn enqueue(&self, plan: &LeasePlan) -> Result<LeaseItemId, LeaseStoreError> {
        let mut tables = self.lock()?;
        tables.next_id += 1;
        let id = tables.next_id;
        tables.items.push(Row {
            plan: plan.clone(),
            id,
            leased_until: None,
            expired_at: None,
            done_at: None,
            failed_at: None,
            last_error: None,
        });
        Ok(id)
    }

    async fn lease(
        &self,
        queue: &str,
        lease_for: Duration,
    ) -> Result<Option<LeasedItem>, LeaseStoreError> {
        let now = Utc::now();
        let lease_for = chrono::Duration::from_std(lease_for)
            .map_err(|e| LeaseStoreError::Storage(format!("invalid lease duration: {e}")))?;

        let mut tables = self.lock()?;
        let next = tables
            .items
            .iter_mut()
            .filter(|r| r.is_leasable(queue, now))
            .min_by_key(|r| (r.plan.run_at, r.id));

        Ok(next.map(|row| {
            let leased_until = now + lease_for;
            row.leased_until = Some(leased_until);
            LeasedItem {
                id: row.id,
                queue: row.plan.queue.clone(),
                job_id: row.plan.job_id,
                instance_id: row.plan.instance_id,
                args: row.plan.args.clone(),
                run_at: row.plan.run_at,
                leased_until,
            }
        }))
    }

    async fn renew(
        &self,
        id: LeaseItemId,
        lease_for: Duration,
    ) -> Result<DateTime<Utc>, LeaseStoreError> {
        let lease_for = chrono::Duration::from_std(lease_for)
            .map_err(|e| LeaseStoreError::Storage(format!("invalid lease duration: {e}")))?;
        let mut tables = self.lock()?;
        let row = tables
            .items
            .iter_mut()
            .find(|r| r.id == id && r.is_open())
            .ok_or(LeaseStoreError::NotFound(id))?;
        let leased_until = Utc::now() + lease_for;
        row.leased_until = Some(leased_until);
        Ok(leased_until)
    }

    async fn is_leased(&self, instance_id: InstanceId) -> Result<bool, LeaseStoreError> {
        let now = Utc::now();
        let tables = self.lock()?;
        Ok(tables.items.iter().any(|r| {
            r.plan.instance_id == instance_id
                && r.is_open()
                && r.leased_until.is_some_and(|until| until >= now)
        }))
    }

    async fn expiration(&self, id: LeaseItemId) -> Result<Option<DateTime<Utc>>, LeaseStoreError> {
        let tables = self.lock()?;
        tables
            .items
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.expired_at)
            .ok_or(LeaseStoreError::NotFound(id))
    }

    async fn expire_instance(
        &self,
        instance_id: InstanceId,
        at: DateTime<Utc>,
    ) -> Result<bool, LeaseStoreError> {
        let mut tables = self.lock()?;
        let mut touched = false;
        for row in tables
            .items
            .iter_mut()
            .filter(|r| r.plan.instance_id == instance_id && r.is_open())
        {
            row.expired_at.get_or_insert(at);
            touched = true;
        }
        Ok(touched)
    }

    async fn mark_done(&self, id: LeaseItemId) -> Result<(), LeaseStoreError> {
        self.update(id, |row| {
            row.done_at = Some(Utc::now());
            row.leased_until = None;
        })
    }

    async fn mark_failed(&self, id: LeaseItemId, error: &str) -> Result<(), LeaseStoreError> {
        self.update(id, |row| {
            row.failed_at = Some(Utc::now());
            row.leased_until = None;
            row.last_error = Some(error.to_string());
        })
    }

    async fn mark_expired(&self, id: LeaseItemId, reason: &str) -> Result<(), LeaseStoreError> {
        self.update(id, |row| {
            row.expired_at.get_or_insert_with(Utc::now);
            row.leased_until = None;
            row.last_error = Some(reason.to_string());
        })
    }

    async fn record_worker_error(&self, queue: &str, error: &str) -> Result<(), LeaseStoreError> {
        self.lock()?
            .worker_errors
            .push((queue.to_string(), error.to_string()));
        Ok(())
    }
}
