use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Processing -> Queued covers both a retried attempt and a lockout deferral.
    /// Queued -> Failed is the fail-fast path for jobs that can never run.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Cancelled)
                | (Queued, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Processing, Queued)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(Error::InvalidInput(format!("unknown job status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub images: Vec<String>,
    pub processing_time_secs: f64,
    #[serde(default)]
    pub provider_response: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub prompt: String,
    pub provider: String,
    pub status: JobStatus,
    #[serde(default)]
    pub result: Option<JobResult>,
    #[serde(default)]
    pub error: Option<String>,
    pub retry_count: u32,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl Job {
    pub fn new(
        prompt: impl Into<String>,
        provider: impl Into<String>,
        priority: u8,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            provider: provider.into(),
            status: JobStatus::Queued,
            result: None,
            error: None,
            retry_count: 0,
            priority: clamp_priority(priority as i64),
            created_at: now,
            scheduled_at: now,
            completed_at: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_schedule(mut self, scheduled_at: DateTime<Utc>, priority: u8) -> Self {
        self.scheduled_at = scheduled_at;
        self.priority = clamp_priority(priority as i64);
        self
    }

    pub fn batch_id(&self) -> Option<&str> {
        self.metadata.get("batch_id").and_then(Value::as_str)
    }

    /// Seconds between creation and completion, if the job has completed.
    pub fn processing_time_secs(&self) -> Option<f64> {
        self.completed_at
            .map(|done| crate::clock::seconds_between(self.created_at, done))
    }

    fn transition(&mut self, to: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        self.transition(JobStatus::Processing)
    }

    pub fn complete(&mut self, result: JobResult, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Completed)?;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Failed)?;
        self.error = Some(error.into());
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<()> {
        self.transition(JobStatus::Cancelled)
    }

    /// Sends a failed attempt back to the queue, spending one retry.
    pub fn retry(&mut self, error: impl Into<String>, max_retries: u32) -> Result<()> {
        if self.retry_count >= max_retries {
            return Err(Error::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: JobStatus::Queued,
            });
        }
        self.transition(JobStatus::Queued)?;
        self.retry_count += 1;
        self.error = Some(error.into());
        Ok(())
    }

    /// Sends the job back to the queue without spending a retry. Used when the
    /// provider, not the job, is at fault.
    pub fn defer(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(JobStatus::Queued)?;
        self.error = Some(error.into());
        Ok(())
    }
}

pub fn clamp_priority(priority: i64) -> u8 {
    priority.clamp(MIN_PRIORITY as i64, MAX_PRIORITY as i64) as u8
}
