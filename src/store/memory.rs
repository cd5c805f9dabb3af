use super::{JobOrder, JobQuery, Store};
use crate::error::{Error, Result};
use crate::model::{
    Batch, BatchOutcome, FailureRecord, Job, JobStatus, ManualEntry, ProviderProfile, SelectorAudit,
};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct Collections {
    jobs: HashMap<String, Job>,
    batches: HashMap<String, Batch>,
    providers: HashMap<String, ProviderProfile>,
    selector_updates: Vec<SelectorAudit>,
    failures: Vec<FailureRecord>,
    manual: Vec<ManualEntry>,
}

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Collections>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_job(&self, job: &Job) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.jobs.contains_key(&job.id) {
            return Err(Error::InvalidInput(format!("job {} already exists", job.id)));
        }
        inner.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.inner.read().await.jobs.get(id).cloned())
    }

    async fn replace_job_if(&self, job: &Job, expected: JobStatus) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.jobs.get_mut(&job.id) {
            Some(stored) if stored.status == expected => {
                *stored = job.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_jobs(&self, query: &JobQuery) -> Result<Vec<Job>> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| query.matches(j))
            .cloned()
            .collect();
        match query.order {
            JobOrder::CreatedDesc => jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
            JobOrder::CompletedDesc => jobs.sort_by(|a, b| b.completed_at.cmp(&a.completed_at)),
        }
        if let Some(limit) = query.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn count_jobs(&self, query: &JobQuery) -> Result<u64> {
        let inner = self.inner.read().await;
        Ok(inner.jobs.values().filter(|j| query.matches(j)).count() as u64)
    }

    async fn insert_batch(&self, batch: &Batch, jobs: &[Job]) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.batches.contains_key(&batch.id) || jobs.iter().any(|j| inner.jobs.contains_key(&j.id)) {
            return Err(Error::InvalidInput(format!("batch {} collides with stored records", batch.id)));
        }
        inner.batches.insert(batch.id.clone(), batch.clone());
        for job in jobs {
            inner.jobs.insert(job.id.clone(), job.clone());
        }
        Ok(())
    }

    async fn get_batch(&self, id: &str) -> Result<Option<Batch>> {
        Ok(self.inner.read().await.batches.get(id).cloned())
    }

    async fn list_batches(&self) -> Result<Vec<Batch>> {
        let inner = self.inner.read().await;
        let mut batches: Vec<Batch> = inner.batches.values().cloned().collect();
        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(batches)
    }

    async fn record_batch_outcome(&self, id: &str, outcome: BatchOutcome) -> Result<()> {
        let mut inner = self.inner.write().await;
        let batch = inner
            .batches
            .get_mut(id)
            .ok_or_else(|| Error::BatchNotFound(id.to_string()))?;
        match outcome {
            BatchOutcome::Completed => batch.progress.completed += 1,
            BatchOutcome::Failed => batch.progress.failed += 1,
            BatchOutcome::Cancelled => batch.progress.cancelled += 1,
        }
        Ok(())
    }

    async fn seed_provider(&self, profile: &ProviderProfile) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if inner.providers.contains_key(&profile.name) {
            return Ok(false);
        }
        inner.providers.insert(profile.name.clone(), profile.clone());
        Ok(true)
    }

    async fn get_provider(&self, name: &str) -> Result<Option<ProviderProfile>> {
        Ok(self.inner.read().await.providers.get(name).cloned())
    }

    async fn list_providers(&self) -> Result<Vec<ProviderProfile>> {
        let inner = self.inner.read().await;
        let mut providers: Vec<ProviderProfile> = inner.providers.values().cloned().collect();
        providers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(providers)
    }

    async fn update_selectors(&self, audit: &SelectorAudit) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(profile) = inner.providers.get_mut(&audit.provider) else {
            return Ok(false);
        };
        profile.selectors = audit.selectors.clone();
        profile.updated_at = audit.at;
        profile.selector_update_reason = Some(audit.reason.clone());
        inner.selector_updates.push(audit.clone());
        Ok(true)
    }

    async fn selector_history(&self, provider: &str) -> Result<Vec<SelectorAudit>> {
        let inner = self.inner.read().await;
        Ok(inner
            .selector_updates
            .iter()
            .filter(|a| a.provider == provider)
            .cloned()
            .collect())
    }

    async fn append_failure(&self, record: &FailureRecord) -> Result<()> {
        self.inner.write().await.failures.push(record.clone());
        Ok(())
    }

    async fn failures(&self, provider: &str) -> Result<Vec<FailureRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .failures
            .iter()
            .filter(|f| f.provider == provider)
            .cloned()
            .collect())
    }

    async fn insert_manual(&self, entry: &ManualEntry) -> Result<()> {
        self.inner.write().await.manual.push(entry.clone());
        Ok(())
    }

    async fn manual_queue(&self) -> Result<Vec<ManualEntry>> {
        Ok(self.inner.read().await.manual.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn compare_and_set_rejects_stale_status() {
        let store = MemoryStore::new();
        let mut job = Job::new("p", "ImageFX", 2, Utc::now());
        store.insert_job(&job).await.unwrap();

        let mut cancelled = job.clone();
        cancelled.cancel().unwrap();
        assert!(store.replace_job_if(&cancelled, JobStatus::Queued).await.unwrap());

        job.start().unwrap();
        assert!(!store.replace_job_if(&job, JobStatus::Queued).await.unwrap());
        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn query_filters_and_orders() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for i in 0..5 {
            let provider = if i % 2 == 0 { "a" } else { "b" };
            let job = Job::new(format!("p{}", i), provider, 1, now - Duration::minutes(i));
            store.insert_job(&job).await.unwrap();
        }

        let a = store.list_jobs(&JobQuery::new().provider("a")).await.unwrap();
        assert_eq!(a.len(), 3);
        assert_eq!(a[0].prompt, "p0");

        let recent = JobQuery::new().created_since(now - Duration::seconds(90));
        assert_eq!(store.count_jobs(&recent).await.unwrap(), 2);
        assert_eq!(store.list_jobs(&JobQuery::new().limit(2)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn selector_update_requires_known_provider() {
        let store = MemoryStore::new();
        let audit = SelectorAudit {
            provider: "ghost".into(),
            selectors: Default::default(),
            reason: "test".into(),
            at: Utc::now(),
        };
        assert!(!store.update_selectors(&audit).await.unwrap());
        assert!(store.selector_history("ghost").await.unwrap().is_empty());
    }
}
