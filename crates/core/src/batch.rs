// crates/core/src/batch.rs
//! Batches: one submission of several sources, tracked as a group.
//!
//! A batch only records which jobs belong to it. Status is recomputed from
//! the job table on every read.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::job::{JobId, JobSpec, JobStatus, JobType};
use crate::lifecycle::JobService;

pub type BatchId = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    pub url: String,
    pub job_id: JobId,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRecord {
    pub id: BatchId,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    /// Set the first time every item is seen terminal.
    pub finished_at: Option<DateTime<Utc>>,
    pub items: Vec<BatchItem>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub user_id: String,
    pub concurrency_cap: usize,
    #[serde(rename = "type")]
    pub job_type: JobType,
    /// Defaults to the registry's temp directory.
    #[serde(default)]
    pub tmp_dir: Option<PathBuf>,
    pub urls: Vec<String>,
}

/// Per-status item counts. `missing` counts jobs already released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchCounts {
    pub completed: usize,
    pub failed: usize,
    pub canceled: usize,
    pub running: usize,
    pub queued: usize,
    pub missing: usize,
}

impl BatchCounts {
    pub fn total(&self) -> usize {
        self.completed + self.failed + self.canceled + self.running + self.queued + self.missing
    }

    /// No item is waiting or running.
    pub fn is_settled(&self) -> bool {
        self.running == 0 && self.queued == 0
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatus {
    pub id: BatchId,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub counts: BatchCounts,
    pub total: usize,
    /// Every item is terminal or released.
    pub done: bool,
    pub items: Vec<BatchItemStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemStatus {
    pub url: String,
    pub job_id: JobId,
    /// `None` once the job has been released.
    pub status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct BatchRegistry {
    service: Arc<JobService>,
    default_tmp_dir: PathBuf,
    batches: Mutex<HashMap<BatchId, BatchRecord>>,
}

impl BatchRegistry {
    pub fn new(service: Arc<JobService>, default_tmp_dir: PathBuf) -> Self {
        Self {
            service,
            default_tmp_dir,
            batches: Mutex::new(HashMap::new()),
        }
    }

    /// Submit one job per url. Items keep the request's url order; job
    /// creation order matches, so FIFO admission follows it too.
    pub fn create_batch(&self, request: BatchRequest) -> Result<BatchRecord, JobError> {
        let urls: Vec<String> = request
            .urls
            .into_iter()
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .collect();
        if urls.is_empty() {
            return Err(JobError::EmptyBatch);
        }

        let id: BatchId = uuid::Uuid::new_v4().to_string();
        let tmp_dir = request.tmp_dir.unwrap_or_else(|| self.default_tmp_dir.clone());
        let mut items = Vec::with_capacity(urls.len());
        for (i, url) in urls.into_iter().enumerate() {
            let spec = JobSpec {
                id: None,
                job_type: request.job_type,
                user_id: request.user_id.clone(),
                concurrency_cap: request.concurrency_cap,
                tmp_id: format!("{id}-{i}"),
                tmp_dir: tmp_dir.clone(),
                source: url.clone(),
            };
            let job = self.service.submit(spec)?;
            items.push(BatchItem {
                url,
                job_id: job.id,
            });
        }

        let record = BatchRecord {
            id: id.clone(),
            user_id: request.user_id,
            created_at: Utc::now(),
            finished_at: None,
            items,
        };
        tracing::info!(batch_id = %id, user_id = %record.user_id, jobs = record.items.len(), "Batch created");
        lock(&self.batches).insert(id, record.clone());
        Ok(record)
    }

    pub fn get_batch(&self, id: &str) -> Option<BatchRecord> {
        lock(&self.batches).get(id).cloned()
    }

    pub fn batch_status(&self, id: &str) -> Result<BatchStatus, JobError> {
        let mut batches = lock(&self.batches);
        let record = batches
            .get_mut(id)
            .ok_or_else(|| JobError::BatchNotFound(id.to_string()))?;

        let mut counts = BatchCounts::default();
        let mut items = Vec::with_capacity(record.items.len());
        for item in &record.items {
            let job = self.service.get(&item.job_id);
            match job.as_ref().map(|j| j.status) {
                Some(JobStatus::Completed) => counts.completed += 1,
                Some(JobStatus::Failed) => counts.failed += 1,
                Some(JobStatus::Canceled) => counts.canceled += 1,
                Some(JobStatus::Running) => counts.running += 1,
                Some(JobStatus::Waiting) => counts.queued += 1,
                None => counts.missing += 1,
            }
            items.push(BatchItemStatus {
                url: item.url.clone(),
                job_id: item.job_id.clone(),
                status: job.as_ref().map(|j| j.status),
                progress: job.as_ref().and_then(|j| j.progress),
                error: job.and_then(|j| j.error),
            });
        }
        if counts.is_settled() && record.finished_at.is_none() {
            record.finished_at = Some(Utc::now());
            tracing::info!(batch_id = %id, ?counts, "Batch finished");
        }

        Ok(BatchStatus {
            id: record.id.clone(),
            user_id: record.user_id.clone(),
            created_at: record.created_at,
            finished_at: record.finished_at,
            counts,
            total: counts.total(),
            done: counts.is_settled(),
            items,
        })
    }

    /// Cancel every live item. Returns how many jobs were canceled; a
    /// failure on one item does not stop the rest.
    pub async fn cancel_batch(&self, id: &str) -> Result<usize, JobError> {
        let job_ids: Vec<JobId> = lock(&self.batches)
            .get(id)
            .ok_or_else(|| JobError::BatchNotFound(id.to_string()))?
            .items
            .iter()
            .map(|i| i.job_id.clone())
            .collect();

        let mut canceled = 0;
        for job_id in job_ids {
            match self.service.cancel(&job_id, Some("batch canceled".to_string())).await {
                Ok(true) => canceled += 1,
                Ok(false) => {}
                Err(JobError::NotFound(_)) => {}
                Err(e) => tracing::warn!(batch_id = %id, job_id = %job_id, error = %e, "Batch item cancel failed"),
            }
        }
        tracing::info!(batch_id = %id, canceled, "Batch canceled");
        Ok(canceled)
    }

    /// The user's batches, oldest first.
    pub fn user_batches(&self, user_id: &str) -> Vec<BatchRecord> {
        let mut out: Vec<BatchRecord> = lock(&self.batches)
            .values()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Forget a batch whose jobs are all gone from the job table.
    pub fn prune(&self) -> usize {
        let mut batches = lock(&self.batches);
        let before = batches.len();
        batches.retain(|_, b| b.items.iter().any(|i| self.service.get(&i.job_id).is_some()));
        before - batches.len()
    }
}
