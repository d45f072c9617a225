//! Per-request progress reporting.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub percent: u8,
    pub step: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressStatus {
    pub task_id: String,
    pub progress: u8,
    pub current_step: String,
    pub elapsed_seconds: f64,
    pub steps: Vec<ProgressEvent>,
}

#[derive(Debug, Default)]
struct TrackerState {
    percent: u8,
    step: String,
    history: Vec<ProgressEvent>,
}

#[derive(Debug)]
pub struct ProgressTracker {
    task_id: String,
    started: Instant,
    state: Mutex<TrackerState>,
    subscriber: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    pub fn with_id(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            started: Instant::now(),
            state: Mutex::new(TrackerState {
                step: "Queued".to_string(),
                ..TrackerState::default()
            }),
            subscriber: None,
        }
    }

    /// Forward every accepted update to `tx`. A dropped receiver is ignored.
    pub fn with_subscriber(mut self, tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        self.subscriber = Some(tx);
        self
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a step. `percent` is clamped to 0..=100 and never lowers the
    /// reported value. Returns the event as recorded.
    pub fn update(&self, percent: i32, step: impl Into<String>) -> ProgressEvent {
        let requested = percent.clamp(0, 100) as u8;
        let event = {
            let mut state = self.state();
            let event = ProgressEvent {
                percent: requested.max(state.percent),
                step: step.into(),
                timestamp: Utc::now(),
            };
            state.percent = event.percent;
            state.step = event.step.clone();
            state.history.push(event.clone());
            event
        };
        debug!(task_id = %self.task_id, percent = event.percent, step = %event.step, "progress");
        if let Some(tx) = &self.subscriber {
            let _ = tx.send(event.clone());
        }
        event
    }

    pub fn percent(&self) -> u8 {
        self.state().percent
    }

    pub fn status(&self) -> ProgressStatus {
        let state = self.state();
        ProgressStatus {
            task_id: self.task_id.clone(),
            progress: state.percent,
            current_step: state.step.clone(),
            elapsed_seconds: self.started.elapsed().as_secs_f64(),
            steps: state.history.clone(),
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct ProgressRegistry {
    trackers: DashMap<String, Arc<ProgressTracker>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self) -> Arc<ProgressTracker> {
        self.register(ProgressTracker::new())
    }

    /// Track under an id chosen by the client, so it can poll while the
    /// request is still running. `None` if a tracker with that id is still
    /// registered.
    pub fn create_with_id(&self, task_id: impl Into<String>) -> Option<Arc<ProgressTracker>> {
        match self.trackers.entry(task_id.into()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let tracker = Arc::new(ProgressTracker::with_id(slot.key().clone()));
                slot.insert(Arc::clone(&tracker));
                Some(tracker)
            }
        }
    }

    fn register(&self, tracker: ProgressTracker) -> Arc<ProgressTracker> {
        let tracker = Arc::new(tracker);
        self.trackers
            .insert(tracker.task_id().to_string(), Arc::clone(&tracker));
        tracker
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<ProgressTracker>> {
        self.trackers.get(task_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, task_id: &str) -> Option<Arc<ProgressTracker>> {
        self.trackers.remove(task_id).map(|(_, tracker)| tracker)
    }

    pub fn clear(&self) -> usize {
        let removed = self.trackers.len();
        self.trackers.clear();
        removed
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }
}
