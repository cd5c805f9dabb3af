use crate::clock::{Clock, seconds_between};
use chrono::{DateTime, Utc};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// A reference to a stored job plus what the queue needs to order it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub job_id: String,
    pub priority: u8,
    pub ready_at: DateTime<Utc>,
}

#[derive(Debug, PartialEq, Eq)]
struct Ready {
    priority: u8,
    seq: u64,
    entry: QueueEntry,
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence (FIFO).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Delayed {
    ready_at: DateTime<Utc>,
    seq: u64,
    entry: QueueEntry,
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ready_at
            .cmp(&other.ready_at)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Heaps {
    ready: BinaryHeap<Ready>,
    delayed: BinaryHeap<Reverse<Delayed>>,
    seq: u64,
}

impl Heaps {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn insert(&mut self, entry: QueueEntry, now: DateTime<Utc>) {
        let seq = self.next_seq();
        if entry.ready_at > now {
            self.delayed.push(Reverse(Delayed {
                ready_at: entry.ready_at,
                seq,
                entry,
            }));
        } else {
            self.ready.push(Ready {
                priority: entry.priority,
                seq,
                entry,
            });
        }
    }

    /// Moves every delayed entry that is due onto the ready heap.
    fn promote(&mut self, now: DateTime<Utc>) {
        while let Some(Reverse(head)) = self.delayed.peek() {
            if head.ready_at > now {
                break;
            }
            if let Some(Reverse(due)) = self.delayed.pop() {
                let seq = self.next_seq();
                self.ready.push(Ready {
                    priority: due.entry.priority,
                    seq,
                    entry: due.entry,
                });
            }
        }
    }

    fn next_ready_at(&self) -> Option<DateTime<Utc>> {
        self.delayed.peek().map(|Reverse(d)| d.ready_at)
    }
}

/// In-memory admission order in front of the job store: priority first, then
/// arrival. Entries with a future `ready_at` wait on a delay heap.
pub struct JobQueue {
    heaps: Mutex<Heaps>,
    notify: Notify,
    clock: Arc<dyn Clock>,
}

impl JobQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            heaps: Mutex::new(Heaps::default()),
            notify: Notify::new(),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Heaps> {
        self.heaps.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, entry: QueueEntry) {
        let now = self.clock.now();
        log::debug!(
            "Queued job {} (priority {}, ready at {})",
            entry.job_id,
            entry.priority,
            entry.ready_at
        );
        self.lock().insert(entry, now);
        self.notify.notify_one();
    }

    /// Re-queues a job to become ready `delay` from now.
    pub fn defer(&self, job_id: &str, priority: u8, delay: Duration) {
        let now = self.clock.now();
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.push(QueueEntry {
            job_id: job_id.to_string(),
            priority,
            ready_at: now + delay,
        });
    }

    /// Next ready entry, waiting at most `timeout` for one to arrive or fall due.
    pub async fn pop(&self, timeout: Duration) -> Option<QueueEntry> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = self.clock.now();
            let wait_for_delayed = {
                let mut heaps = self.lock();
                heaps.promote(now);
                if let Some(ready) = heaps.ready.pop() {
                    return Some(ready.entry);
                }
                heaps
                    .next_ready_at()
                    .map(|at| Duration::from_secs_f64(seconds_between(now, at).max(0.0)))
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let wait = wait_for_delayed
                .map_or(remaining, |d| d.max(Duration::from_millis(1)).min(remaining));
            let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        }
    }

    pub fn len(&self) -> usize {
        let heaps = self.lock();
        heaps.ready.len() + heaps.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries waiting on a deferral or a scheduled start.
    pub fn delayed_len(&self) -> usize {
        self.lock().delayed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn entry(id: &str, priority: u8, ready_at: DateTime<Utc>) -> QueueEntry {
        QueueEntry {
            job_id: id.to_string(),
            priority,
            ready_at,
        }
    }

    const SHORT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn pops_by_priority_then_arrival() {
        let clock = Arc::new(ManualClock::default());
        let queue = JobQueue::new(clock.clone());
        let now = clock.now();
        queue.push(entry("low", 1, now));
        queue.push(entry("high-a", 5, now));
        queue.push(entry("mid", 3, now));
        queue.push(entry("high-b", 5, now));

        let mut order = Vec::new();
        while let Some(e) = queue.pop(SHORT).await {
            order.push(e.job_id);
        }
        assert_eq!(order, vec!["high-a", "high-b", "mid", "low"]);
    }

    #[tokio::test]
    async fn deferred_entries_wait_for_the_clock() {
        let clock = Arc::new(ManualClock::default());
        let queue = JobQueue::new(clock.clone());
        queue.defer("later", 5, Duration::from_secs(30));
        queue.push(entry("now", 1, clock.now()));

        assert_eq!(queue.pop(SHORT).await.unwrap().job_id, "now");
        assert!(queue.pop(SHORT).await.is_none());
        assert_eq!(queue.delayed_len(), 1);

        clock.advance_secs(30.0);
        assert_eq!(queue.pop(SHORT).await.unwrap().job_id, "later");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn push_wakes_a_waiting_pop() {
        let clock = Arc::new(ManualClock::default());
        let queue = Arc::new(JobQueue::new(clock.clone()));

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(entry("wake", 2, clock.now()));

        let popped = waiter.await.unwrap();
        assert_eq!(popped.map(|e| e.job_id), Some("wake".to_string()));
    }
}
