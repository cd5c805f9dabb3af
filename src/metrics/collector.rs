use crate::metrics::snapshot::MetricsSnapshot;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::{Duration, Instant};

/// Lock-free counters for the worker loop. Clones share the same counters.
#[derive(Clone)]
pub struct MetricsCollector {
    jobs_enqueued: Arc<AtomicU64>,
    jobs_started: Arc<AtomicU64>,
    jobs_completed: Arc<AtomicU64>,
    jobs_failed: Arc<AtomicU64>,
    jobs_retried: Arc<AtomicU64>,
    jobs_deferred: Arc<AtomicU64>,
    jobs_escalated: Arc<AtomicU64>,
    jobs_skipped: Arc<AtomicU64>,
    attempts_total: Arc<AtomicU64>,
    attempts_failed: Arc<AtomicU64>,
    in_flight: Arc<AtomicU64>,
    total_latency_ms: Arc<AtomicU64>,
    start_time: Arc<Instant>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self {
            jobs_enqueued: Arc::new(AtomicU64::new(0)),
            jobs_started: Arc::new(AtomicU64::new(0)),
            jobs_completed: Arc::new(AtomicU64::new(0)),
            jobs_failed: Arc::new(AtomicU64::new(0)),
            jobs_retried: Arc::new(AtomicU64::new(0)),
            jobs_deferred: Arc::new(AtomicU64::new(0)),
            jobs_escalated: Arc::new(AtomicU64::new(0)),
            jobs_skipped: Arc::new(AtomicU64::new(0)),
            attempts_total: Arc::new(AtomicU64::new(0)),
            attempts_failed: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            total_latency_ms: Arc::new(AtomicU64::new(0)),
            start_time: Arc::new(Instant::now()),
        }
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_enqueued(&self) {
        self.jobs_enqueued.fetch_add(1, Ordering::SeqCst);
    }

    pub fn job_started(&self) {
        self.jobs_started.fetch_add(1, Ordering::SeqCst);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub fn job_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn increment_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_retried(&self) {
        self.jobs_retried.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_deferred(&self) {
        self.jobs_deferred.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_escalated(&self) {
        self.jobs_escalated.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_skipped(&self) {
        self.jobs_skipped.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_success(&self, duration: Duration) {
        self.attempts_total.fetch_add(1, Ordering::SeqCst);
        self.total_latency_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn record_failure(&self, duration: Duration) {
        self.attempts_total.fetch_add(1, Ordering::SeqCst);
        self.attempts_failed.fetch_add(1, Ordering::SeqCst);
        self.total_latency_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let attempts = self.attempts_total.load(Ordering::SeqCst);
        let failed_attempts = self.attempts_failed.load(Ordering::SeqCst);
        let total_latency = self.total_latency_ms.load(Ordering::SeqCst);
        let completed = self.jobs_completed.load(Ordering::SeqCst);

        let success_rate = if attempts > 0 {
            ((attempts - failed_attempts) as f64 / attempts as f64) * 100.0
        } else {
            0.0
        };

        let avg_latency_ms = if attempts > 0 {
            total_latency / attempts
        } else {
            0
        };

        let elapsed = self.start_time.elapsed().as_secs_f64();

        MetricsSnapshot {
            jobs_enqueued: self.jobs_enqueued.load(Ordering::SeqCst),
            jobs_started: self.jobs_started.load(Ordering::SeqCst),
            jobs_completed: completed,
            jobs_failed: self.jobs_failed.load(Ordering::SeqCst),
            jobs_retried: self.jobs_retried.load(Ordering::SeqCst),
            jobs_deferred: self.jobs_deferred.load(Ordering::SeqCst),
            jobs_escalated: self.jobs_escalated.load(Ordering::SeqCst),
            jobs_skipped: self.jobs_skipped.load(Ordering::SeqCst),
            attempts_total: attempts,
            attempts_failed: failed_attempts,
            in_flight: self.in_flight.load(Ordering::SeqCst),
            success_rate,
            avg_latency_ms,
            jobs_per_minute: if elapsed > 0.0 {
                completed as f64 / elapsed * 60.0
            } else {
                0.0
            },
            elapsed_seconds: elapsed,
        }
    }
}
