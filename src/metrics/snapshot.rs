use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub jobs_enqueued: u64,
    pub jobs_started: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub jobs_deferred: u64,
    pub jobs_escalated: u64,
    /// Popped entries whose job was no longer queued (cancelled, already done).
    pub jobs_skipped: u64,
    pub attempts_total: u64,
    pub attempts_failed: u64,
    pub in_flight: u64,
    /// Percentage of automation attempts that succeeded.
    pub success_rate: f64,
    pub avg_latency_ms: u64,
    pub jobs_per_minute: f64,
    pub elapsed_seconds: f64,
}

impl MetricsSnapshot {
    /// Jobs that reached a terminal state through the worker.
    pub fn finished(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }
}
