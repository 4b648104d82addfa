// crates/core/src/history.rs
//! Persistent job history boundary.
//!
//! Storage itself lives outside this crate; implementations of
//! [`HistorySink`] adapt it. Sinks must not block: they are called while the
//! job table lock is not held, but on the executor's driver task.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::job::{JobId, JobSnapshot};

pub trait HistorySink: Send + Sync {
    /// A new whole-percent value was reached.
    fn record_progress(&self, job_id: &JobId, percent_floor: u32);

    /// The job reached a terminal status.
    fn record_finished(&self, job: &JobSnapshot);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHistory;

impl HistorySink for NoopHistory {
    fn record_progress(&self, _job_id: &JobId, _percent_floor: u32) {}

    fn record_finished(&self, _job: &JobSnapshot) {}
}

/// Keeps history in memory. Useful for inspection and tests.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    progress: Mutex<HashMap<JobId, Vec<u32>>>,
    finished: Mutex<Vec<JobSnapshot>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every persisted percent floor for `job_id`, in write order.
    pub fn progress_writes(&self, job_id: &JobId) -> Vec<u32> {
        lock(&self.progress).get(job_id).cloned().unwrap_or_default()
    }

    pub fn finished(&self) -> Vec<JobSnapshot> {
        lock(&self.finished).clone()
    }
}

impl HistorySink for MemoryHistory {
    fn record_progress(&self, job_id: &JobId, percent_floor: u32) {
        lock(&self.progress)
            .entry(job_id.clone())
            .or_default()
            .push(percent_floor);
    }

    fn record_finished(&self, job: &JobSnapshot) {
        lock(&self.finished).push(job.clone());
    }
}

/// Per-job write throttle: a percentage is worth persisting only when its
/// floor differs from the last persisted floor.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProgressThrottle {
    last_floor: Option<u32>,
}

impl ProgressThrottle {
    /// Returns the floor to persist, or `None` if it matches the last write.
    pub fn admit(&mut self, percent: f32) -> Option<u32> {
        let floor = percent.max(0.0).floor() as u32;
        if self.last_floor == Some(floor) {
            return None;
        }
        self.last_floor = Some(floor);
        Some(floor)
    }
}
