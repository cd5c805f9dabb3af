//! Persistence for jobs, batches, provider profiles, failure records and the
//! manual review queue.
//!
//! Job writes after insertion go through [`Store::replace_job_if`], a
//! compare-and-set on the stored status. Two writers racing on the same job
//! therefore resolve to exactly one winner, and terminal states cannot be
//! overwritten by a late write.

use crate::error::Result;
use crate::model::{
    Batch, BatchOutcome, FailureRecord, Job, JobStatus, ManualEntry, ProviderProfile, SelectorAudit,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JobOrder {
    #[default]
    CreatedDesc,
    CompletedDesc,
}

/// Filter over the job collection. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    pub status: Option<JobStatus>,
    pub provider: Option<String>,
    pub created_since: Option<DateTime<Utc>>,
    pub completed_since: Option<DateTime<Utc>>,
    pub order: JobOrder,
    pub limit: Option<usize>,
}

impl JobQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn created_since(mut self, since: DateTime<Utc>) -> Self {
        self.created_since = Some(since);
        self
    }

    pub fn completed_since(mut self, since: DateTime<Utc>) -> Self {
        self.completed_since = Some(since);
        self
    }

    pub fn newest_completed_first(mut self) -> Self {
        self.order = JobOrder::CompletedDesc;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        if self.status.is_some_and(|s| s != job.status) {
            return false;
        }
        if self.provider.as_deref().is_some_and(|p| p != job.provider) {
            return false;
        }
        if self.created_since.is_some_and(|since| job.created_at < since) {
            return false;
        }
        if let Some(since) = self.completed_since {
            match job.completed_at {
                Some(done) if done >= since => {}
                _ => return false,
            }
        }
        true
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_job(&self, job: &Job) -> Result<()>;
    async fn get_job(&self, id: &str) -> Result<Option<Job>>;
    /// Overwrites the stored job only if its status is still `expected`.
    /// Returns `false` when the guard did not hold or the job does not exist.
    async fn replace_job_if(&self, job: &Job, expected: JobStatus) -> Result<bool>;
    async fn list_jobs(&self, query: &JobQuery) -> Result<Vec<Job>>;
    async fn count_jobs(&self, query: &JobQuery) -> Result<u64>;

    /// Inserts the batch together with all of its jobs, or nothing.
    async fn insert_batch(&self, batch: &Batch, jobs: &[Job]) -> Result<()>;
    async fn get_batch(&self, id: &str) -> Result<Option<Batch>>;
    async fn list_batches(&self) -> Result<Vec<Batch>>;
    async fn record_batch_outcome(&self, id: &str, outcome: BatchOutcome) -> Result<()>;

    /// Inserts the profile unless a provider with that name exists.
    async fn seed_provider(&self, profile: &ProviderProfile) -> Result<bool>;
    async fn get_provider(&self, name: &str) -> Result<Option<ProviderProfile>>;
    async fn list_providers(&self) -> Result<Vec<ProviderProfile>>;
    /// Replaces the provider's selectors and appends `audit` to its history.
    /// Returns `false` if the provider does not exist.
    async fn update_selectors(&self, audit: &SelectorAudit) -> Result<bool>;
    async fn selector_history(&self, provider: &str) -> Result<Vec<SelectorAudit>>;

    async fn append_failure(&self, record: &FailureRecord) -> Result<()>;
    async fn failures(&self, provider: &str) -> Result<Vec<FailureRecord>>;

    async fn insert_manual(&self, entry: &ManualEntry) -> Result<()>;
    async fn manual_queue(&self) -> Result<Vec<ManualEntry>>;
}
