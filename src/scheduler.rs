use crate::clock::{Clock, seconds_between};
use crate::error::Result;
use crate::model::{JobStatus, MAX_PRIORITY, MIN_PRIORITY, clamp_priority};
use crate::store::{JobQuery, Store};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use validator::Validate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How far back completed jobs count towards the delay estimate.
    #[validate(range(min = 1))]
    pub delay_lookback_hours: i64,
    #[validate(range(min = 1))]
    pub delay_sample_size: usize,
    #[validate(range(min = 0.0, max = 1.0))]
    pub delay_factor: f64,
    #[validate(range(min = 0.0))]
    pub max_delay_secs: f64,
    #[validate(range(min = 1))]
    pub priority_lookback_hours: i64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub boost_above_success_rate: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub demote_below_success_rate: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            delay_lookback_hours: 24,
            delay_sample_size: 50,
            delay_factor: 0.1,
            max_delay_secs: 30.0,
            priority_lookback_hours: 6,
            boost_above_success_rate: 0.9,
            demote_below_success_rate: 0.5,
        }
    }
}

/// A job as submitted, before it is scheduled.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDraft {
    pub prompt: String,
    pub provider: String,
    pub priority: u8,
}

impl JobDraft {
    pub fn new(prompt: impl Into<String>, provider: impl Into<String>, priority: u8) -> Self {
        Self {
            prompt: prompt.into(),
            provider: provider.into(),
            priority,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Schedule {
    pub scheduled_time: DateTime<Utc>,
    pub adjusted_priority: u8,
    pub delay_seconds: f64,
    pub reason: String,
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: SchedulerConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub async fn schedule(&self, draft: &JobDraft) -> Result<Schedule> {
        let now = self.clock.now();
        let delay_seconds = self.optimal_delay(&draft.provider, now).await?;
        let adjusted_priority = self
            .adjusted_priority(&draft.provider, draft.priority, now)
            .await?;

        let scheduled_time = now + Duration::milliseconds((delay_seconds * 1000.0).round() as i64);
        Ok(Schedule {
            scheduled_time,
            adjusted_priority,
            delay_seconds,
            reason: format!(
                "Optimized for {} performance (delay {:.1}s, priority {})",
                draft.provider, delay_seconds, adjusted_priority
            ),
        })
    }

    /// A fraction of the provider's recent mean turnaround, capped.
    async fn optimal_delay(&self, provider: &str, now: DateTime<Utc>) -> Result<f64> {
        let query = JobQuery::new()
            .provider(provider)
            .status(JobStatus::Completed)
            .completed_since(now - Duration::hours(self.config.delay_lookback_hours))
            .newest_completed_first()
            .limit(self.config.delay_sample_size);
        let recent = self.store.list_jobs(&query).await?;

        let durations: Vec<f64> = recent
            .iter()
            .filter_map(|job| job.completed_at.map(|done| seconds_between(job.created_at, done)))
            .collect();
        if durations.is_empty() {
            return Ok(0.0);
        }

        let mean = durations.iter().sum::<f64>() / durations.len() as f64;
        Ok((mean * self.config.delay_factor).clamp(0.0, self.config.max_delay_secs))
    }

    async fn adjusted_priority(&self, provider: &str, base: u8, now: DateTime<Utc>) -> Result<u8> {
        let since = now - Duration::hours(self.config.priority_lookback_hours);
        let recent = JobQuery::new().provider(provider).created_since(since);
        let total = self.store.count_jobs(&recent).await?;
        let base = clamp_priority(base as i64);
        if total == 0 {
            return Ok(base);
        }

        let completed = self
            .store
            .count_jobs(&recent.status(JobStatus::Completed))
            .await?;
        let success_rate = completed as f64 / total as f64;

        let adjusted = if success_rate > self.config.boost_above_success_rate {
            base.saturating_add(1).min(MAX_PRIORITY)
        } else if success_rate < self.config.demote_below_success_rate {
            base.saturating_sub(1).max(MIN_PRIORITY)
        } else {
            base
        };
        Ok(adjusted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{Job, JobResult};
    use crate::store::MemoryStore;

    fn scheduler(store: Arc<MemoryStore>, clock: Arc<ManualClock>) -> Scheduler {
        Scheduler::new(store, clock, SchedulerConfig::default())
    }

    async fn completed(store: &MemoryStore, provider: &str, created: DateTime<Utc>, took_secs: i64) {
        let mut job = Job::new("p", provider, 3, created);
        job.start().unwrap();
        job.complete(
            JobResult {
                images: vec![],
                processing_time_secs: took_secs as f64,
                provider_response: None,
            },
            created + Duration::seconds(took_secs),
        )
        .unwrap();
        store.insert_job(&job).await.unwrap();
    }

    #[tokio::test]
    async fn empty_history_means_no_delay_and_unchanged_priority() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let s = scheduler(store, clock.clone());

        let plan = s.schedule(&JobDraft::new("a cat", "ImageFX", 3)).await.unwrap();
        assert_eq!(plan.delay_seconds, 0.0);
        assert_eq!(plan.adjusted_priority, 3);
        assert_eq!(plan.scheduled_time, clock.now());
    }

    #[tokio::test]
    async fn delay_is_a_tenth_of_mean_turnaround_capped_at_thirty() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let now = clock.now();
        completed(&store, "ImageFX", now - Duration::hours(1), 40).await;
        completed(&store, "ImageFX", now - Duration::hours(2), 80).await;
        // Outside the 24h window.
        completed(&store, "ImageFX", now - Duration::hours(30), 3000).await;

        let s = scheduler(store.clone(), clock.clone());
        let plan = s.schedule(&JobDraft::new("x", "ImageFX", 3)).await.unwrap();
        assert!((plan.delay_seconds - 6.0).abs() < 1e-9);

        completed(&store, "Slow", now - Duration::hours(1), 1200).await;
        let plan = s.schedule(&JobDraft::new("x", "Slow", 3)).await.unwrap();
        assert_eq!(plan.delay_seconds, 30.0);
    }

    #[tokio::test]
    async fn priority_follows_recent_success_rate() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let now = clock.now();
        for _ in 0..10 {
            completed(&store, "Good", now - Duration::minutes(30), 5).await;
        }
        for i in 0..4 {
            let mut job = Job::new("p", "Bad", 3, now - Duration::minutes(10));
            if i == 0 {
                job.start().unwrap();
                job.complete(
                    JobResult {
                        images: vec![],
                        processing_time_secs: 1.0,
                        provider_response: None,
                    },
                    now,
                )
                .unwrap();
            } else {
                job.start().unwrap();
                job.fail("broken", now).unwrap();
            }
            store.insert_job(&job).await.unwrap();
        }

        let s = scheduler(store, clock);
        assert_eq!(s.schedule(&JobDraft::new("x", "Good", 5)).await.unwrap().adjusted_priority, 5);
        assert_eq!(s.schedule(&JobDraft::new("x", "Good", 3)).await.unwrap().adjusted_priority, 4);
        assert_eq!(s.schedule(&JobDraft::new("x", "Bad", 3)).await.unwrap().adjusted_priority, 2);
        assert_eq!(s.schedule(&JobDraft::new("x", "Bad", 1)).await.unwrap().adjusted_priority, 1);
    }
}
