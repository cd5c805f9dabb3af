use crate::analytics::{self, PerformanceReport, ReportRange};
use crate::broadcast::Event;
use crate::error::{Error, Result};
use crate::governor::ProviderRate;
use crate::model::{
    Batch, BatchOutcome, FailureRecord, Job, JobStatus, ManualEntry, ProviderProfile, SelectorMap, clamp_priority,
};
use crate::scheduler::{JobDraft, Scheduler};
use crate::store::JobQuery;
use crate::worker::{Engine, EngineState, WorkerSettings};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Priority given to every job a batch fans out.
pub const BATCH_PRIORITY: u8 = 2;

const MAX_CANCEL_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub status: String,
    pub engine_state: EngineState,
    pub uptime_seconds: f64,
    pub active_jobs: u64,
    pub queued_jobs: u64,
    pub completed_jobs_today: u64,
    /// Failed jobs as a percentage of all stored jobs.
    pub error_rate: f64,
    pub queue_depth: usize,
    pub observers: usize,
    pub providers: Vec<ProviderRate>,
}

/// The submission, query and selector surface over a running [`Engine`].
pub struct JobService {
    engine: Arc<Engine>,
    scheduler: Scheduler,
    started_at: DateTime<Utc>,
}

impl JobService {
    pub fn new(engine: Arc<Engine>, scheduler: Scheduler) -> Self {
        let started_at = engine.clock().now();
        Self {
            engine,
            scheduler,
            started_at,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Inserts each profile unless one with its name exists. Returns how many
    /// were new.
    pub async fn seed_providers(&self, profiles: &[ProviderProfile]) -> Result<usize> {
        let mut seeded = 0;
        for profile in profiles {
            if self.engine.store().seed_provider(profile).await? {
                log::info!("Initialized provider {}", profile.name);
                seeded += 1;
            }
            self.engine
                .governor()
                .register(&profile.name, profile.rate_limit_per_minute);
        }
        Ok(seeded)
    }

    pub async fn create_job(&self, prompt: &str, provider: &str, priority: i64) -> Result<Job> {
        if prompt.trim().is_empty() {
            return Err(Error::InvalidInput("prompt must not be empty".into()));
        }
        if provider.trim().is_empty() {
            return Err(Error::InvalidInput("provider must not be empty".into()));
        }

        let draft = JobDraft::new(prompt, provider, clamp_priority(priority));
        let schedule = self.scheduler.schedule(&draft).await?;
        let job = Job::new(draft.prompt, draft.provider, draft.priority, self.engine.clock().now())
            .with_schedule(schedule.scheduled_time, schedule.adjusted_priority)
            .with_metadata("source", "api")
            .with_metadata("schedule_reason", schedule.reason);

        self.engine.store().insert_job(&job).await?;
        self.engine.enqueue(&job);
        log::info!("Created job {} for {}", job.id, job.provider);
        self.engine.broadcaster().broadcast(Event::JobCreated {
            job_id: job.id.clone(),
            provider: job.provider.clone(),
            status: job.status,
        });
        Ok(job)
    }

    /// Fans `prompts × providers` out into jobs and stores them together with
    /// the batch.
    pub async fn create_batch(
        &self,
        name: &str,
        prompts: Vec<String>,
        providers: Vec<String>,
    ) -> Result<Batch> {
        if prompts.is_empty() || providers.is_empty() {
            return Err(Error::InvalidInput(
                "a batch needs at least one prompt and one provider".into(),
            ));
        }

        let now = self.engine.clock().now();
        let mut batch = Batch::new(name, prompts, providers, now);
        let jobs: Vec<Job> = batch
            .prompts
            .iter()
            .flat_map(|prompt| {
                batch.providers.iter().map(move |provider| {
                    Job::new(prompt.as_str(), provider.as_str(), BATCH_PRIORITY, now)
                })
            })
            .map(|job| {
                job.with_metadata("batch_id", batch.id.as_str())
                    .with_metadata("source", "batch")
            })
            .collect();
        batch.jobs = jobs.iter().map(|j| j.id.clone()).collect();

        self.engine.store().insert_batch(&batch, &jobs).await?;
        for job in &jobs {
            self.engine.enqueue(job);
        }
        log::info!("Started batch {} with {} jobs", batch.id, jobs.len());
        self.engine.broadcaster().broadcast(Event::BatchStarted {
            batch_id: batch.id.clone(),
            name: batch.name.clone(),
            total_jobs: batch.progress.total,
        });
        Ok(batch)
    }

    pub async fn get_job(&self, id: &str) -> Result<Job> {
        self.engine
            .store()
            .get_job(id)
            .await?
            .ok_or_else(|| Error::JobNotFound(id.to_string()))
    }

    /// Newest first.
    pub async fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        let mut query = JobQuery::new().limit(limit);
        if let Some(status) = status {
            query = query.status(status);
        }
        self.engine.store().list_jobs(&query).await
    }

    /// Cancels a queued or processing job. A job the worker is running keeps
    /// running, but its result is discarded.
    pub async fn cancel_job(&self, id: &str) -> Result<Job> {
        for _ in 0..MAX_CANCEL_ATTEMPTS {
            let mut job = self.get_job(id).await?;
            let previous = job.status;
            job.cancel()?;
            if self.engine.store().replace_job_if(&job, previous).await? {
                log::info!("Cancelled job {}", id);
                if let Some(batch_id) = job.batch_id() {
                    if let Err(e) = self
                        .engine
                        .store()
                        .record_batch_outcome(batch_id, BatchOutcome::Cancelled)
                        .await
                    {
                        log::error!("Could not update batch {} for job {}: {}", batch_id, id, e);
                    }
                }
                self.engine.broadcaster().broadcast(Event::JobCancelled {
                    job_id: job.id.clone(),
                    status: job.status,
                });
                return Ok(job);
            }
        }
        Err(Error::Internal(format!(
            "job {} kept changing state while being cancelled",
            id
        )))
    }

    pub async fn get_batch(&self, id: &str) -> Result<Batch> {
        self.engine
            .store()
            .get_batch(id)
            .await?
            .ok_or_else(|| Error::BatchNotFound(id.to_string()))
    }

    pub async fn list_batches(&self) -> Result<Vec<Batch>> {
        self.engine.store().list_batches().await
    }

    pub async fn get_selectors(&self, provider: &str) -> Result<SelectorMap> {
        self.engine.registry().get(provider).await
    }

    pub async fn replace_selectors(
        &self,
        provider: &str,
        selectors: SelectorMap,
        reason: &str,
    ) -> Result<()> {
        if !self
            .engine
            .registry()
            .update(provider, selectors.clone(), reason)
            .await
        {
            return Err(Error::ProviderNotFound(provider.to_string()));
        }
        self.engine.broadcaster().broadcast(Event::SelectorsUpdated {
            provider: provider.to_string(),
            selectors,
        });
        Ok(())
    }

    pub async fn providers(&self) -> Result<Vec<ProviderProfile>> {
        self.engine.store().list_providers().await
    }

    pub async fn manual_queue(&self) -> Result<Vec<ManualEntry>> {
        self.engine.store().manual_queue().await
    }

    pub async fn failures(&self, provider: &str) -> Result<Vec<FailureRecord>> {
        self.engine.store().failures(provider).await
    }

    pub fn settings(&self) -> WorkerSettings {
        self.engine.settings()
    }

    pub fn update_settings(&self, settings: WorkerSettings) -> Result<()> {
        let value = serde_json::to_value(&settings)?;
        self.engine.update_settings(settings);
        log::info!("Worker settings updated");
        self.engine.broadcaster().broadcast(Event::ConfigUpdated {
            setting: "worker".to_string(),
            value,
        });
        Ok(())
    }

    pub async fn health(&self) -> Result<HealthSnapshot> {
        let store = self.engine.store();
        let now = self.engine.clock().now();
        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|naive| Utc.from_utc_datetime(&naive))
            .unwrap_or(now);

        let active_jobs = store
            .count_jobs(&JobQuery::new().status(JobStatus::Processing))
            .await?;
        let queued_jobs = store
            .count_jobs(&JobQuery::new().status(JobStatus::Queued))
            .await?;
        let completed_jobs_today = store
            .count_jobs(
                &JobQuery::new()
                    .status(JobStatus::Completed)
                    .completed_since(midnight),
            )
            .await?;
        let total = store.count_jobs(&JobQuery::new()).await?;
        let failed = store
            .count_jobs(&JobQuery::new().status(JobStatus::Failed))
            .await?;
        let error_rate = if total > 0 {
            failed as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        Ok(HealthSnapshot {
            status: "healthy".to_string(),
            engine_state: self.engine.state(),
            uptime_seconds: crate::clock::seconds_between(self.started_at, now),
            active_jobs,
            queued_jobs,
            completed_jobs_today,
            error_rate,
            queue_depth: self.engine.queue().len(),
            observers: self.engine.broadcaster().observer_count(),
            providers: self.engine.governor().snapshot(),
        })
    }

    pub async fn performance_report(&self, range: ReportRange) -> Result<PerformanceReport> {
        let now = self.engine.clock().now();
        analytics::performance_report(self.engine.store().as_ref(), range, now).await
    }
}
