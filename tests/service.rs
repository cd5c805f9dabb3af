use async_trait::async_trait;
use genqueue::model::{Job, JobStatus, ProviderProfile, SelectorMap};
use genqueue::service::BATCH_PRIORITY;
use genqueue::{
    Automation, AutomationFailure, AutomationOutput, Clock, Disposition, Engine, EngineParts,
    EngineState, Error, Event, GovernorConfig, JobService, ManualClock, MemoryStore, Scheduler,
    SchedulerConfig, WorkerSettings,
};
use std::sync::Arc;
use std::time::Duration;

const TICK: Duration = Duration::from_millis(50);

struct AlwaysWorks;

#[async_trait]
impl Automation for AlwaysWorks {
    async fn run(
        &self,
        job: &Job,
        _selectors: &SelectorMap,
    ) -> Result<AutomationOutput, AutomationFailure> {
        Ok(AutomationOutput {
            images: vec![format!("https://cdn.example/{}.png", job.id)],
            provider_response: Some("ok".to_string()),
        })
    }
}

async fn service() -> (JobService, Arc<ManualClock>) {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let engine = Arc::new(Engine::new(
        EngineParts {
            store: store.clone(),
            clock: clock.clone(),
            automation: Arc::new(AlwaysWorks),
            governor: GovernorConfig::default(),
            selector_ttl: Duration::from_secs(300),
        },
        WorkerSettings::default(),
    ));
    let scheduler = Scheduler::new(store, clock.clone(), SchedulerConfig::default());
    let service = JobService::new(engine, scheduler);

    let now = clock.now();
    let seeded = service
        .seed_providers(&[
            ProviderProfile::new("ImageFX", now).with_selector("prompt_input", "textarea"),
            ProviderProfile::new("OpenAI DALL-E", now).with_rate_limit(50),
        ])
        .await
        .unwrap();
    assert_eq!(seeded, 2);
    (service, clock)
}

async fn next(service: &JobService) -> Disposition {
    service.engine().process_next(TICK).await.unwrap()
}

#[tokio::test]
async fn create_job_validates_and_records_its_schedule() {
    let (service, _clock) = service().await;

    assert!(matches!(
        service.create_job("   ", "ImageFX", 3).await,
        Err(Error::InvalidInput(_))
    ));

    let job = service.create_job("a paper boat", "ImageFX", 9).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.priority, 5);
    assert_eq!(job.metadata["source"], "api");
    assert!(job.metadata.contains_key("schedule_reason"));
    assert_eq!(service.get_job(&job.id).await.unwrap(), job);

    assert_eq!(next(&service).await, Disposition::Completed);
    assert_eq!(
        service.get_job(&job.id).await.unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn cancelled_jobs_are_skipped_by_the_worker() {
    let (service, _clock) = service().await;
    let mut events = service.engine().broadcaster().subscribe();
    let job = service.create_job("a quiet harbor", "ImageFX", 3).await.unwrap();

    let cancelled = service.cancel_job(&job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.completed_at.is_none());

    assert!(matches!(events.recv().await, Some(Event::JobCreated { .. })));
    assert!(matches!(
        events.recv().await,
        Some(Event::JobCancelled { status: JobStatus::Cancelled, .. })
    ));

    assert_eq!(next(&service).await, Disposition::Skipped);
    assert!(matches!(
        service.cancel_job(&job.id).await,
        Err(Error::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn completed_jobs_cannot_be_cancelled() {
    let (service, _clock) = service().await;
    let job = service.create_job("a red kite", "ImageFX", 3).await.unwrap();
    assert_eq!(next(&service).await, Disposition::Completed);

    assert!(service.cancel_job(&job.id).await.is_err());
    assert_eq!(
        service.get_job(&job.id).await.unwrap().status,
        JobStatus::Completed
    );
    assert!(matches!(
        service.cancel_job("missing").await,
        Err(Error::JobNotFound(_))
    ));
}

#[tokio::test]
async fn batches_fan_out_and_track_progress() {
    let (service, _clock) = service().await;
    let prompts = vec!["fox".to_string(), "owl".to_string(), "elk".to_string()];
    let providers = vec!["ImageFX".to_string(), "OpenAI DALL-E".to_string()];

    let batch = service
        .create_batch("animals", prompts, providers)
        .await
        .unwrap();
    assert_eq!(batch.progress.total, 6);
    assert_eq!(batch.jobs.len(), 6);

    for id in &batch.jobs {
        let job = service.get_job(id).await.unwrap();
        assert_eq!(job.batch_id(), Some(batch.id.as_str()));
        assert_eq!(job.priority, BATCH_PRIORITY);
    }

    for _ in 0..6 {
        assert_eq!(next(&service).await, Disposition::Completed);
    }
    let progress = service.get_batch(&batch.id).await.unwrap().progress;
    assert_eq!(progress.completed, 6);
    assert_eq!(progress.failed, 0);
    assert!(progress.is_finished());
    assert_eq!(service.list_batches().await.unwrap().len(), 1);

    assert!(matches!(
        service.create_batch("empty", vec![], vec!["ImageFX".into()]).await,
        Err(Error::InvalidInput(_))
    ));
}

#[tokio::test]
async fn cancelled_batch_jobs_count_toward_progress() {
    let (service, _clock) = service().await;
    let batch = service
        .create_batch(
            "pair",
            vec!["heron".to_string()],
            vec!["ImageFX".to_string(), "OpenAI DALL-E".to_string()],
        )
        .await
        .unwrap();

    service.cancel_job(&batch.jobs[0]).await.unwrap();
    let progress = service.get_batch(&batch.id).await.unwrap().progress;
    assert_eq!(progress.cancelled, 1);
    assert!(!progress.is_finished());

    let mut seen = vec![next(&service).await, next(&service).await];
    seen.sort_by_key(|d| format!("{:?}", d));
    assert_eq!(seen, vec![Disposition::Completed, Disposition::Skipped]);
    let progress = service.get_batch(&batch.id).await.unwrap().progress;
    assert_eq!(progress.completed, 1);
    assert_eq!(progress.cancelled, 1);
    assert!(progress.is_finished());
}

#[tokio::test]
async fn list_jobs_filters_by_status() {
    let (service, _clock) = service().await;
    let first = service.create_job("one", "ImageFX", 3).await.unwrap();
    service.create_job("two", "ImageFX", 3).await.unwrap();
    service.cancel_job(&first.id).await.unwrap();

    assert_eq!(service.list_jobs(None, 10).await.unwrap().len(), 2);
    let cancelled = service
        .list_jobs(Some(JobStatus::Cancelled), 10)
        .await
        .unwrap();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].id, first.id);
    assert_eq!(service.list_jobs(None, 1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn selector_replacement_is_audited_and_broadcast() {
    let (service, _clock) = service().await;
    let mut events = service.engine().broadcaster().subscribe();

    let mut selectors = service.get_selectors("ImageFX").await.unwrap();
    assert_eq!(selectors["prompt_input"], "textarea");
    selectors.insert("prompt_input".into(), "textarea#prompt".into());
    service
        .replace_selectors("ImageFX", selectors, "Site redesign")
        .await
        .unwrap();

    assert_eq!(
        service.get_selectors("ImageFX").await.unwrap()["prompt_input"],
        "textarea#prompt"
    );
    let history = service.engine().registry().history("ImageFX").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].reason, "Site redesign");
    assert!(matches!(
        events.recv().await,
        Some(Event::SelectorsUpdated { .. })
    ));

    assert!(matches!(
        service
            .replace_selectors("Nowhere", SelectorMap::new(), "n/a")
            .await,
        Err(Error::ProviderNotFound(_))
    ));
}

#[tokio::test]
async fn settings_updates_take_effect_and_are_announced() {
    let (service, _clock) = service().await;
    let mut events = service.engine().broadcaster().subscribe();

    let settings = WorkerSettings {
        max_retries: 1,
        ..service.settings()
    };
    service.update_settings(settings.clone()).unwrap();
    assert_eq!(service.settings(), settings);

    match events.recv().await {
        Some(Event::ConfigUpdated { setting, value }) => {
            assert_eq!(setting, "worker");
            assert_eq!(value["max_retries"], 1);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn health_reports_queue_and_provider_state() {
    let (service, clock) = service().await;
    let done = service.create_job("done", "ImageFX", 3).await.unwrap();
    assert_eq!(next(&service).await, Disposition::Completed);
    service.create_job("waiting", "ImageFX", 3).await.unwrap();
    clock.advance_secs(5.0);

    let health = service.health().await.unwrap();
    assert_eq!(health.status, "healthy");
    assert_eq!(health.engine_state, EngineState::Idle);
    assert_eq!(health.queued_jobs, 1);
    assert_eq!(health.active_jobs, 0);
    assert_eq!(health.queue_depth, 1);
    assert_eq!(health.error_rate, 0.0);
    assert_eq!(health.uptime_seconds, 5.0);
    assert!(health.providers.iter().any(|p| p.provider == "ImageFX"));

    let report = service
        .performance_report(Default::default())
        .await
        .unwrap();
    assert_eq!(report.job_statistics.total_jobs, 2);
    assert_eq!(report.provider_performance["ImageFX"].completed_jobs, 1);
    assert_eq!(service.get_job(&done.id).await.unwrap().status, JobStatus::Completed);
}
