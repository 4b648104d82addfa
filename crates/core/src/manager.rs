// crates/core/src/manager.rs
//! Job table, waiting queue, running set and the admission policy.
//!
//! `JobManager` is the single writer of job state. It is a plain synchronous
//! state machine: it never spawns work itself. Every call that can free or
//! consume capacity re-runs the scheduler and returns the ids it admitted, and
//! the caller starts those jobs.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::JobError;
use crate::job::{FailureKind, Job, JobId, JobSnapshot, JobSpec, JobStatus, OutputFile};
use crate::progress::ProgressUpdate;

/// Lower bound for the global concurrency limit.
pub const MIN_CONCURRENT: usize = 1;
/// Upper bound for the global concurrency limit.
pub const MAX_CONCURRENT: usize = 10;

/// Outcome of a terminal-transition request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transition {
    /// False when the job was already terminal and nothing changed.
    pub applied: bool,
    /// Jobs admitted by the scheduler run that followed.
    pub admitted: Vec<JobId>,
}

impl Transition {
    fn skipped() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStats {
    pub running: usize,
    pub waiting: usize,
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueInfo {
    pub running: Vec<JobSnapshot>,
    /// Waiting jobs in FIFO order.
    pub waiting: Vec<JobSnapshot>,
    pub max_concurrent: usize,
}

enum Terminal {
    Completed(Option<OutputFile>),
    Failed(FailureKind, String),
    Canceled(Option<String>),
}

pub struct JobManager {
    jobs: HashMap<JobId, Job>,
    waiting: VecDeque<JobId>,
    running: HashSet<JobId>,
    max_concurrent: usize,
}

impl JobManager {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            waiting: VecDeque::new(),
            running: HashSet::new(),
            max_concurrent: clamp_concurrency(max_concurrent),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Insert a `waiting` job. Does not schedule.
    pub fn create_job(&mut self, spec: JobSpec) -> Result<JobSnapshot, JobError> {
        let job = Job::from_spec(spec);
        if self.jobs.contains_key(&job.id) {
            return Err(JobError::DuplicateJob(job.id.to_string()));
        }
        let snapshot = job.snapshot();
        self.jobs.insert(job.id.clone(), job);
        Ok(snapshot)
    }

    /// Append a waiting job to the queue and run the scheduler.
    pub fn enqueue(&mut self, id: &JobId) -> Result<Vec<JobId>, JobError> {
        let job = self
            .jobs
            .get(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        if job.status != JobStatus::Waiting {
            return Err(JobError::InvalidState {
                id: id.to_string(),
                status: job.status,
            });
        }
        if !self.waiting.contains(id) {
            self.waiting.push_back(id.clone());
        }
        Ok(self.schedule())
    }

    fn running_for_user(&self, user_id: &str) -> usize {
        self.running
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .filter(|j| j.user_id == user_id)
            .count()
    }

    /// Admit waiting jobs while global capacity remains. Each round scans the
    /// queue in FIFO order for the first job whose user is under that job's
    /// cap; a full scan with no eligible job stops the run.
    pub fn schedule(&mut self) -> Vec<JobId> {
        let mut admitted = Vec::new();
        while self.running.len() < self.max_concurrent && !self.waiting.is_empty() {
            let eligible = self.waiting.iter().position(|id| {
                self.jobs
                    .get(id)
                    .is_some_and(|job| self.running_for_user(&job.user_id) < job.concurrency_cap)
            });
            let Some(pos) = eligible else {
                break;
            };
            let Some(id) = self.waiting.remove(pos) else {
                break;
            };
            if let Some(job) = self.jobs.get_mut(&id) {
                job.status = JobStatus::Running;
                job.started_at = Some(Utc::now());
                job.version += 1;
                tracing::debug!(job_id = %id, user_id = %job.user_id, "Job admitted");
            }
            self.running.insert(id.clone());
            admitted.push(id);
        }
        admitted
    }

    /// Single guard all terminal edges funnel through. Whichever request
    /// reaches it first wins; later ones are dropped.
    fn finish(&mut self, id: &JobId, terminal: Terminal) -> Transition {
        let Some(job) = self.jobs.get_mut(id) else {
            return Transition::skipped();
        };
        if job.status.is_terminal() {
            tracing::debug!(job_id = %id, status = %job.status, "Terminal transition dropped");
            return Transition::skipped();
        }

        self.running.remove(id);
        self.waiting.retain(|w| w != id);

        match terminal {
            Terminal::Completed(output) => {
                job.status = JobStatus::Completed;
                job.progress = Some(100.0);
                job.output = output;
            }
            Terminal::Failed(kind, message) => {
                job.status = JobStatus::Failed;
                job.failure = Some(kind);
                job.error = Some(message);
            }
            Terminal::Canceled(reason) => {
                job.status = JobStatus::Canceled;
                job.error = Some(reason.unwrap_or_else(|| "canceled".to_string()));
            }
        }
        job.finished_at = Some(Utc::now());
        job.version += 1;

        Transition {
            applied: true,
            admitted: self.schedule(),
        }
    }

    pub fn complete_job(&mut self, id: &JobId, output: Option<OutputFile>) -> Transition {
        self.finish(id, Terminal::Completed(output))
    }

    pub fn fail_job(&mut self, id: &JobId, kind: FailureKind, message: impl Into<String>) -> Transition {
        self.finish(id, Terminal::Failed(kind, message.into()))
    }

    pub fn cancel_job(&mut self, id: &JobId, reason: Option<String>) -> Transition {
        self.finish(id, Terminal::Canceled(reason))
    }

    /// Clamp `n` to `[MIN_CONCURRENT, MAX_CONCURRENT]`. Raising the limit
    /// admits waiting jobs immediately.
    pub fn set_max_concurrent(&mut self, n: usize) -> (usize, Vec<JobId>) {
        let clamped = clamp_concurrency(n);
        let increased = clamped > self.max_concurrent;
        self.max_concurrent = clamped;
        let admitted = if increased { self.schedule() } else { Vec::new() };
        (clamped, admitted)
    }

    /// Merge a progress snapshot into a running job. Returns false if the job
    /// is unknown or not running.
    pub fn update_progress(&mut self, id: &JobId, update: &ProgressUpdate) -> bool {
        match self.jobs.get_mut(id) {
            Some(job) if job.status == JobStatus::Running => {
                job.apply_progress(update);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn snapshot(&self, id: &JobId) -> Option<JobSnapshot> {
        self.jobs.get(id).map(Job::snapshot)
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            running: self.running.len(),
            waiting: self.waiting.len(),
            max_concurrent: self.max_concurrent,
        }
    }

    pub fn queue_info(&self) -> QueueInfo {
        let mut running: Vec<JobSnapshot> = self
            .running
            .iter()
            .filter_map(|id| self.snapshot(id))
            .collect();
        running.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        QueueInfo {
            running,
            waiting: self.waiting.iter().filter_map(|id| self.snapshot(id)).collect(),
            max_concurrent: self.max_concurrent,
        }
    }

    /// All jobs of one user, oldest first.
    pub fn user_jobs(&self, user_id: &str) -> Vec<JobSnapshot> {
        let mut jobs: Vec<JobSnapshot> = self
            .jobs
            .values()
            .filter(|j| j.user_id == user_id)
            .map(Job::snapshot)
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    /// Ids of terminal jobs that finished before `cutoff`.
    pub fn finished_before(&self, cutoff: DateTime<Utc>) -> Vec<JobId> {
        self.jobs
            .values()
            .filter(|j| j.status.is_terminal())
            .filter(|j| j.finished_at.is_some_and(|t| t < cutoff))
            .map(|j| j.id.clone())
            .collect()
    }

    /// Ids of every job that has not reached a terminal status.
    pub fn live_jobs(&self) -> Vec<JobId> {
        self.jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .map(|j| j.id.clone())
            .collect()
    }

    /// Drop a terminal job from the table.
    pub fn remove(&mut self, id: &JobId) -> Result<Job, JobError> {
        let status = self
            .jobs
            .get(id)
            .map(|j| j.status)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        if !status.is_terminal() {
            return Err(JobError::InvalidState {
                id: id.to_string(),
                status,
            });
        }
        self.jobs
            .remove(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_CONCURRENT)
    }
}

fn clamp_concurrency(n: usize) -> usize {
    n.clamp(MIN_CONCURRENT, MAX_CONCURRENT)
}
