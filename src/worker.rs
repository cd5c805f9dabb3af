use crate::automation::{Automation, AutomationFailure};
use crate::broadcast::{Broadcaster, Event};
use crate::clock::Clock;
use crate::error::Result;
use crate::governor::{GovernorConfig, RateGovernor};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::model::{
    BatchOutcome, ErrorKind, FailureClass, Job, JobResult, JobStatus, ManualEntry, ManualStatus,
    ProviderProfile,
};
use crate::queue::{JobQueue, QueueEntry};
use crate::recovery::RecoveryChain;
use crate::registry::SelectorRegistry;
use crate::store::{JobQuery, Store};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub max_retries: u32,
    pub auto_retry_enabled: bool,
    #[serde(with = "millis")]
    pub poll_timeout: Duration,
    #[serde(with = "millis")]
    pub min_requeue_delay: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            auto_retry_enabled: true,
            poll_timeout: Duration::from_millis(1000),
            min_requeue_delay: Duration::from_secs(1),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// What happened to one popped queue entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Nothing became ready before the poll timeout.
    Idle,
    /// The stored job was no longer queued.
    Skipped,
    /// Held back by the rate governor or a provider lockout.
    Deferred { delay: Duration },
    Completed,
    Retried,
    Failed,
    /// Failed and parked in the manual queue.
    Escalated,
    /// A concurrent cancel won the compare-and-set.
    Cancelled,
}

/// Counts a job as in flight until dropped, including on unwind.
struct InFlight<'a>(&'a MetricsCollector);

impl<'a> InFlight<'a> {
    fn start(metrics: &'a MetricsCollector) -> Self {
        metrics.job_started();
        Self(metrics)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.job_finished();
    }
}

/// Everything the engine is built from.
pub struct EngineParts {
    pub store: Arc<dyn Store>,
    pub clock: Arc<dyn Clock>,
    pub automation: Arc<dyn Automation>,
    pub governor: GovernorConfig,
    pub selector_ttl: Duration,
}

/// The single consumer of the job queue.
pub struct Engine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    automation: Arc<dyn Automation>,
    queue: Arc<JobQueue>,
    governor: Arc<RateGovernor>,
    registry: Arc<SelectorRegistry>,
    recovery: RecoveryChain,
    broadcaster: Arc<Broadcaster>,
    metrics: Arc<MetricsCollector>,
    settings: std::sync::RwLock<WorkerSettings>,
    state_watcher: watch::Sender<EngineState>,
}

impl Engine {
    pub fn new(parts: EngineParts, settings: WorkerSettings) -> Self {
        let EngineParts {
            store,
            clock,
            automation,
            governor,
            selector_ttl,
        } = parts;
        let registry = Arc::new(SelectorRegistry::new(store.clone(), clock.clone(), selector_ttl));
        let recovery = RecoveryChain::standard(store.clone(), clock.clone(), registry.clone());
        let (state_tx, _) = watch::channel(EngineState::Idle);

        Self {
            queue: Arc::new(JobQueue::new(clock.clone())),
            governor: Arc::new(RateGovernor::new(governor, clock.clone())),
            registry,
            recovery,
            broadcaster: Arc::new(Broadcaster::new()),
            metrics: Arc::new(MetricsCollector::new()),
            settings: std::sync::RwLock::new(settings),
            state_watcher: state_tx,
            store,
            clock,
            automation,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn governor(&self) -> &Arc<RateGovernor> {
        &self.governor
    }

    pub fn registry(&self) -> &Arc<SelectorRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn settings(&self) -> WorkerSettings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn update_settings(&self, settings: WorkerSettings) {
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
    }

    pub fn state(&self) -> EngineState {
        *self.state_watcher.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.state_watcher.subscribe()
    }

    fn set_state(&self, state: EngineState) {
        self.state_watcher.send_replace(state);
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn watch_metrics(&self) -> watch::Receiver<MetricsSnapshot> {
        let (tx, rx) = watch::channel(self.metrics.snapshot());
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(500));
            loop {
                interval.tick().await;
                if tx.send(metrics.snapshot()).is_err() {
                    break;
                }
            }
        });
        rx
    }

    /// Puts a stored, queued job in line. It becomes ready at `scheduled_at`.
    pub fn enqueue(&self, job: &Job) {
        self.queue.push(QueueEntry {
            job_id: job.id.clone(),
            priority: job.priority,
            ready_at: job.scheduled_at,
        });
        self.metrics.increment_enqueued();
    }

    /// Rebuilds the in-memory queue from the store. Jobs left in `processing`
    /// by an earlier run go back to `queued`.
    pub async fn restore(&self) -> Result<usize> {
        let interrupted = self
            .store
            .list_jobs(&JobQuery::new().status(JobStatus::Processing))
            .await?;
        for mut job in interrupted {
            job.defer("Interrupted before completion")?;
            if self.store.replace_job_if(&job, JobStatus::Processing).await? {
                log::warn!("Job {} was interrupted; returning it to the queue", job.id);
            }
        }

        let mut queued = self
            .store
            .list_jobs(&JobQuery::new().status(JobStatus::Queued))
            .await?;
        queued.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        for job in &queued {
            self.enqueue(job);
        }
        log::info!("Restored {} queued jobs", queued.len());
        Ok(queued.len())
    }

    /// Runs the worker loop until `shutdown` resolves. A job already being
    /// processed is finished first.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        self.set_state(EngineState::Running);
        log::info!("Job queue processor started");
        tokio::pin!(shutdown);

        loop {
            let poll_timeout = self.settings().poll_timeout;
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    log::info!("Shutting down...");
                    break;
                }
                entry = self.queue.pop(poll_timeout) => {
                    if let Some(entry) = entry {
                        self.process_guarded(entry).await;
                    }
                }
            }
        }

        self.set_state(EngineState::Stopped);
    }

    /// Pops and processes at most one entry.
    pub async fn process_next(&self, timeout: Duration) -> Result<Disposition> {
        match self.queue.pop(timeout).await {
            Some(entry) => self.process(entry).await,
            None => Ok(Disposition::Idle),
        }
    }

    async fn process_guarded(&self, entry: QueueEntry) {
        let job_id = entry.job_id.clone();
        let reason = match AssertUnwindSafe(self.process(entry)).catch_unwind().await {
            Ok(Ok(disposition)) => {
                log::debug!("Job {} -> {:?}", job_id, disposition);
                return;
            }
            Ok(Err(e)) => {
                log::error!("Error processing job {}: {}", job_id, e);
                format!("Worker error: {}", e)
            }
            Err(_) => {
                log::error!("Panic while processing job {}", job_id);
                "Worker panicked while processing the job".to_string()
            }
        };
        self.release_abandoned(&job_id, reason).await;
    }

    /// Fails a job left in `processing` by an attempt that errored or panicked.
    async fn release_abandoned(&self, job_id: &str, reason: String) {
        let job = match self.store.get_job(job_id).await {
            Ok(Some(job)) if job.status == JobStatus::Processing => job,
            Ok(_) => return,
            Err(e) => {
                log::error!("Could not reload abandoned job {}: {}", job_id, e);
                return;
            }
        };
        if let Err(e) = self.fail(job, JobStatus::Processing, reason).await {
            log::error!("Could not fail abandoned job {}: {}", job_id, e);
        }
    }

    async fn process(&self, entry: QueueEntry) -> Result<Disposition> {
        let Some(job) = self.store.get_job(&entry.job_id).await? else {
            log::warn!("Queued job {} no longer exists", entry.job_id);
            self.metrics.increment_skipped();
            return Ok(Disposition::Skipped);
        };
        if job.status != JobStatus::Queued {
            log::debug!("Skipping job {} in state {}", job.id, job.status);
            self.metrics.increment_skipped();
            return Ok(Disposition::Skipped);
        }

        let profile = match self.store.get_provider(&job.provider).await? {
            Some(profile) if profile.enabled => profile,
            Some(_) => {
                let reason = format!("Provider {} is disabled", job.provider);
                return self.fail(job, JobStatus::Queued, reason).await;
            }
            None => {
                let reason = format!("Provider {} not found", job.provider);
                return self.fail(job, JobStatus::Queued, reason).await;
            }
        };

        self.governor
            .register(&profile.name, profile.rate_limit_per_minute);
        let admission = self.governor.admit(&profile.name);
        if !admission.allowed {
            let delay = self.requeue_delay(admission.wait_seconds);
            log::warn!(
                "Rate limit reached for {}; job {} deferred {:.1}s",
                profile.name,
                job.id,
                delay.as_secs_f64()
            );
            self.queue.defer(&job.id, job.priority, delay);
            self.metrics.increment_deferred();
            return Ok(Disposition::Deferred { delay });
        }

        let mut running = job;
        running.start()?;
        if !self.store.replace_job_if(&running, JobStatus::Queued).await? {
            log::info!("Job {} changed state before it could start", running.id);
            self.metrics.increment_skipped();
            return Ok(Disposition::Skipped);
        }
        log::info!("Processing job: {}", running.id);
        self.announce(&running);

        let _in_flight = InFlight::start(&self.metrics);
        self.attempt(running, &profile).await
    }

    async fn attempt(&self, running: Job, profile: &ProviderProfile) -> Result<Disposition> {
        let selectors = match self.registry.get(&profile.name).await {
            Ok(selectors) => selectors,
            Err(e) => {
                log::error!("Could not load selectors for {}: {}", profile.name, e);
                Default::default()
            }
        };

        let bound = Duration::from_secs(profile.timeout_seconds.max(1));
        let started = Instant::now();
        let outcome = match tokio::time::timeout(bound, self.automation.run(&running, &selectors)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AutomationFailure::new(
                ErrorKind::Timeout,
                format!("Automation exceeded {}s", bound.as_secs()),
            )),
        };
        let latency = started.elapsed();

        match outcome {
            Ok(output) => {
                self.governor
                    .record(&profile.name, true, latency.as_secs_f64(), None);
                self.metrics.record_success(latency);
                let result = JobResult {
                    images: output.images,
                    processing_time_secs: latency.as_secs_f64(),
                    provider_response: output.provider_response,
                };
                self.complete(running, result).await
            }
            Err(failure) => {
                self.governor.record(
                    &profile.name,
                    false,
                    latency.as_secs_f64(),
                    Some(failure.kind),
                );
                self.metrics.record_failure(latency);
                log::warn!("Job {} failed on {}: {}", running.id, profile.name, failure);
                self.route_failure(running, failure).await
            }
        }
    }

    async fn route_failure(&self, running: Job, failure: AutomationFailure) -> Result<Disposition> {
        match failure.kind.class() {
            FailureClass::Automation => {
                let outcome = self
                    .recovery
                    .recover_with_outcome(
                        &running.provider,
                        &running.id,
                        failure.kind,
                        failure.details.clone(),
                    )
                    .await;
                if outcome.escalated {
                    self.escalate(running, failure.message).await
                } else if outcome.recovered && self.can_retry(&running) {
                    self.retry_or_fail(running, failure.message).await
                } else if outcome.recovered {
                    self.park_for_review(running, failure).await
                } else {
                    self.fail(running, JobStatus::Processing, failure.message)
                        .await
                }
            }
            FailureClass::Transient => self.retry_or_fail(running, failure.message).await,
            FailureClass::Lockout => {
                let cooldown = self
                    .governor
                    .cooldown_remaining(&running.provider)
                    .unwrap_or(0.0);
                self.defer_lockout(running, failure.message, cooldown).await
            }
            FailureClass::Configuration => {
                self.fail(running, JobStatus::Processing, failure.message)
                    .await
            }
        }
    }

    fn requeue_delay(&self, wait_seconds: f64) -> Duration {
        let floor = self.settings().min_requeue_delay;
        Duration::from_secs_f64(wait_seconds.max(0.0)).max(floor)
    }

    fn announce(&self, job: &Job) {
        self.broadcaster.broadcast(Event::JobStatusUpdate {
            job_id: job.id.clone(),
            status: job.status,
            error: job.error.clone(),
        });
    }

    /// Writes a job that was `expected` when read. `false` means a concurrent
    /// change (a cancel) won.
    async fn persist(&self, job: &Job, expected: JobStatus) -> Result<bool> {
        let written = self.store.replace_job_if(job, expected).await?;
        if written {
            self.announce(job);
        } else {
            log::info!("Job {} was cancelled while processing", job.id);
        }
        Ok(written)
    }

    async fn record_batch(&self, job: &Job, outcome: BatchOutcome) {
        if let Some(batch_id) = job.batch_id() {
            if let Err(e) = self.store.record_batch_outcome(batch_id, outcome).await {
                log::error!("Could not update batch {} for job {}: {}", batch_id, job.id, e);
            }
        }
    }

    async fn complete(&self, mut job: Job, result: JobResult) -> Result<Disposition> {
        job.complete(result, self.clock.now())?;
        if !self.persist(&job, JobStatus::Processing).await? {
            return Ok(Disposition::Cancelled);
        }
        log::info!("Job {} completed", job.id);
        self.metrics.increment_completed();
        self.record_batch(&job, BatchOutcome::Completed).await;
        Ok(Disposition::Completed)
    }

    async fn fail(&self, mut job: Job, expected: JobStatus, error: String) -> Result<Disposition> {
        job.fail(error, self.clock.now())?;
        if !self.persist(&job, expected).await? {
            return Ok(Disposition::Cancelled);
        }
        log::error!(
            "Job {} failed: {}",
            job.id,
            job.error.as_deref().unwrap_or_default()
        );
        self.metrics.increment_failed();
        self.record_batch(&job, BatchOutcome::Failed).await;
        Ok(Disposition::Failed)
    }

    async fn escalate(&self, job: Job, error: String) -> Result<Disposition> {
        let job = job.with_metadata("manual_review", "pending_manual");
        let disposition = self.fail(job, JobStatus::Processing, error).await?;
        if disposition == Disposition::Failed {
            self.metrics.increment_escalated();
            return Ok(Disposition::Escalated);
        }
        Ok(disposition)
    }

    /// Healed, but out of retries: a human has to look at it.
    async fn park_for_review(&self, job: Job, failure: AutomationFailure) -> Result<Disposition> {
        let entry = ManualEntry {
            job_id: job.id.clone(),
            provider: job.provider.clone(),
            error_kind: failure.kind,
            details: failure.details,
            queued_at: self.clock.now(),
            status: ManualStatus::PendingManual,
        };
        match self.store.insert_manual(&entry).await {
            Ok(()) => {
                log::warn!("Job {} is out of retries; queued for manual intervention", job.id);
                self.escalate(job, failure.message).await
            }
            Err(e) => {
                log::error!("Could not queue job {} for manual review: {}", job.id, e);
                self.fail(job, JobStatus::Processing, failure.message).await
            }
        }
    }

    fn can_retry(&self, job: &Job) -> bool {
        let settings = self.settings();
        settings.auto_retry_enabled && job.retry_count < settings.max_retries
    }

    async fn retry_or_fail(&self, mut job: Job, error: String) -> Result<Disposition> {
        let settings = self.settings();
        if !self.can_retry(&job) {
            let reason = format!("{} (after {} retries)", error, job.retry_count);
            return self.fail(job, JobStatus::Processing, reason).await;
        }

        job.retry(error, settings.max_retries)?;
        if !self.persist(&job, JobStatus::Processing).await? {
            return Ok(Disposition::Cancelled);
        }
        log::info!(
            "Job {} queued for retry ({}/{})",
            job.id,
            job.retry_count,
            settings.max_retries
        );
        self.queue
            .defer(&job.id, job.priority, settings.min_requeue_delay);
        self.metrics.increment_retried();
        Ok(Disposition::Retried)
    }

    async fn defer_lockout(&self, mut job: Job, error: String, cooldown_secs: f64) -> Result<Disposition> {
        job.defer(error)?;
        if !self.persist(&job, JobStatus::Processing).await? {
            return Ok(Disposition::Cancelled);
        }
        let delay = self.requeue_delay(cooldown_secs);
        log::warn!(
            "Provider {} is locked out; job {} deferred {:.0}s",
            job.provider,
            job.id,
            delay.as_secs_f64()
        );
        self.queue.defer(&job.id, job.priority, delay);
        self.metrics.increment_deferred();
        Ok(Disposition::Deferred { delay })
    }
}
