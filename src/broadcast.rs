use crate::model::{JobStatus, SelectorMap};
use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// A state change observers are told about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    JobCreated {
        job_id: String,
        provider: String,
        status: JobStatus,
    },
    JobStatusUpdate {
        job_id: String,
        status: JobStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    JobCancelled {
        job_id: String,
        status: JobStatus,
    },
    BatchStarted {
        batch_id: String,
        name: String,
        total_jobs: u64,
    },
    SelectorsUpdated {
        provider: String,
        selectors: SelectorMap,
    },
    ConfigUpdated {
        setting: String,
        value: serde_json::Value,
    },
}

impl Event {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Event::JobCreated { job_id, .. }
            | Event::JobStatusUpdate { job_id, .. }
            | Event::JobCancelled { job_id, .. } => Some(job_id),
            _ => None,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

/// Fan-out of [`Event`]s to every live subscriber.
#[derive(Default)]
pub struct Broadcaster {
    observers: Mutex<Vec<mpsc::UnboundedSender<Event>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Sends `event` to every observer. Observers whose receiver is gone are
    /// dropped here. Returns how many received it.
    pub fn broadcast(&self, event: Event) -> usize {
        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        observers.retain(|tx| tx.send(event.clone()).is_ok());
        log::debug!("Broadcast {} to {} observers", event.to_json(), observers.len());
        observers.len()
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_serialize_with_a_type_tag() {
        let event = Event::JobStatusUpdate {
            job_id: "j1".into(),
            status: JobStatus::Completed,
            error: None,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "job_status_update", "job_id": "j1", "status": "completed"})
        );
        assert_eq!(event.job_id(), Some("j1"));
    }

    #[tokio::test]
    async fn closed_observers_are_pruned_on_broadcast() {
        let broadcaster = Broadcaster::new();
        let mut alive = broadcaster.subscribe();
        let gone = broadcaster.subscribe();
        assert_eq!(broadcaster.observer_count(), 2);
        drop(gone);

        let event = Event::JobCancelled {
            job_id: "j2".into(),
            status: JobStatus::Cancelled,
        };
        assert_eq!(broadcaster.broadcast(event.clone()), 1);
        assert_eq!(broadcaster.observer_count(), 1);
        assert_eq!(alive.recv().await, Some(event));
    }
}
