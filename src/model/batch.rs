use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub completed: u64,
    pub failed: u64,
    #[serde(default)]
    pub cancelled: u64,
    pub total: u64,
}

impl BatchProgress {
    pub fn is_finished(&self) -> bool {
        self.completed + self.failed + self.cancelled >= self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// A batch fans `prompts × providers` out into individual jobs at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub name: String,
    pub prompts: Vec<String>,
    pub providers: Vec<String>,
    pub progress: BatchProgress,
    pub jobs: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(
        name: impl Into<String>,
        prompts: Vec<String>,
        providers: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let total = (prompts.len() * providers.len()) as u64;
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            prompts,
            providers,
            progress: BatchProgress {
                total,
                ..BatchProgress::default()
            },
            jobs: Vec::new(),
            created_at: now,
        }
    }
}
