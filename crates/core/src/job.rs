// crates/core/src/job.rs
//! Job entity: identity plus mutable lifecycle state for one unit of work.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::progress::ProgressUpdate;

/// Opaque unique job identifier. Never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Kind of work a job performs. Decides which output extensions are valid
/// and which executor arguments apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobType {
    Best,
    Audio,
    Clip,
    Convert,
    EmbedSubs,
}

impl JobType {
    pub const ALL: [JobType; 5] = [
        JobType::Best,
        JobType::Audio,
        JobType::Clip,
        JobType::Convert,
        JobType::EmbedSubs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Best => "best",
            JobType::Audio => "audio",
            JobType::Clip => "clip",
            JobType::Convert => "convert",
            JobType::EmbedSubs => "embedSubs",
        }
    }

    /// Lowercase file extensions accepted as a finished output for this type.
    pub fn allowed_extensions(&self) -> &'static [&'static str] {
        match self {
            JobType::Best => &["mp4", "mkv", "webm", "mov"],
            JobType::Audio => &["mp3", "m4a", "opus", "ogg", "wav", "flac", "aac"],
            JobType::Clip => &["mp4", "mkv", "webm"],
            JobType::Convert => &["mp4", "mkv", "webm", "mov", "avi", "mp3", "m4a", "gif"],
            JobType::EmbedSubs => &["mp4", "mkv", "webm"],
        }
    }

    pub fn accepts_extension(&self, ext: &str) -> bool {
        let ext = ext.to_ascii_lowercase();
        self.allowed_extensions().iter().any(|e| *e == ext)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a job.
///
/// `waiting -> running -> completed | failed`, and `waiting | running -> canceled`.
/// Terminal statuses never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job ended up `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    /// The executor could not be started.
    SpawnFailure,
    /// The executor exited with a non-zero code.
    NonZeroExit,
    /// Zero exit code but no matching output file was found.
    OutputIntegrity,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::SpawnFailure => "spawnFailure",
            FailureKind::NonZeroExit => "nonZeroExit",
            FailureKind::OutputIntegrity => "outputIntegrity",
        }
    }
}

/// Finished output file discovered in a job's temp directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputFile {
    pub path: PathBuf,
    pub size: u64,
}

impl OutputFile {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Everything needed to create a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    /// Caller-supplied id; generated when absent.
    #[serde(default)]
    pub id: Option<JobId>,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub user_id: String,
    /// Max simultaneously running jobs for `user_id`, from external policy.
    pub concurrency_cap: usize,
    /// Filename prefix the executor writes its output under.
    pub tmp_id: String,
    /// Directory the executor writes into.
    pub tmp_dir: PathBuf,
    /// URL or input location handed to the executor.
    pub source: String,
}

/// One unit of scheduled work.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub user_id: String,
    pub concurrency_cap: usize,
    pub tmp_id: String,
    pub tmp_dir: PathBuf,
    pub source: String,
    pub status: JobStatus,
    pub progress: Option<f32>,
    pub stage: Option<String>,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
    pub output: Option<OutputFile>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Bumped on every applied transition so stale callbacks can tell the
    /// job moved on without them.
    pub version: u64,
}

impl Job {
    /// Build a `waiting` job from a spec. A cap below 1 is raised to 1.
    pub fn from_spec(spec: JobSpec) -> Self {
        Self {
            id: spec.id.unwrap_or_else(JobId::generate),
            job_type: spec.job_type,
            user_id: spec.user_id,
            concurrency_cap: spec.concurrency_cap.max(1),
            tmp_id: spec.tmp_id,
            tmp_dir: spec.tmp_dir,
            source: spec.source,
            status: JobStatus::Waiting,
            progress: None,
            stage: None,
            speed: None,
            eta: None,
            error: None,
            failure: None,
            output: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            version: 0,
        }
    }

    /// Merge whichever fields a parsed progress line carried.
    pub fn apply_progress(&mut self, update: &ProgressUpdate) {
        if let Some(percent) = update.percent {
            self.progress = Some(percent);
        }
        if let Some(speed) = &update.speed {
            self.speed = Some(speed.clone());
        }
        if let Some(eta) = &update.eta {
            self.eta = Some(eta.clone());
        }
        if let Some(stage) = update.stage {
            self.stage = Some(stage.label().to_string());
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id.clone(),
            job_type: self.job_type,
            user_id: self.user_id.clone(),
            concurrency_cap: self.concurrency_cap,
            status: self.status,
            progress: self.progress,
            stage: self.stage.clone(),
            speed: self.speed.clone(),
            eta: self.eta.clone(),
            error: self.error.clone(),
            failure: self.failure,
            output_size: self.output.as_ref().map(|o| o.size),
            created_at: self.created_at,
            finished_at: self.finished_at,
            version: self.version,
        }
    }
}

/// Serializable read view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub user_id: String,
    pub concurrency_cap: usize,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_size: Option<u64>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::Stage;

    fn spec(cap: usize) -> JobSpec {
        JobSpec {
            id: Some(JobId::new("job-1")),
            job_type: JobType::Audio,
            user_id: "u1".into(),
            concurrency_cap: cap,
            tmp_id: "tmp-1".into(),
            tmp_dir: PathBuf::from("/tmp/mediaq"),
            source: "https://example.com/v".into(),
        }
    }

    #[test]
    fn test_from_spec_starts_waiting() {
        let job = Job::from_spec(spec(2));
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.version, 0);
        assert!(job.finished_at.is_none());
        assert_eq!(job.id.as_str(), "job-1");
    }

    #[test]
    fn test_zero_cap_is_raised_to_one() {
        assert_eq!(Job::from_spec(spec(0)).concurrency_cap, 1);
    }

    #[test]
    fn test_generated_ids_differ() {
        let mut s = spec(1);
        s.id = None;
        let a = Job::from_spec(s.clone());
        let b = Job::from_spec(s);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Waiting.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
    }

    #[test]
    fn test_extension_allow_list_is_case_insensitive() {
        assert!(JobType::Audio.accepts_extension("MP3"));
        assert!(!JobType::Audio.accepts_extension("mp4"));
        assert!(JobType::Best.accepts_extension("webm"));
        assert!(!JobType::Clip.accepts_extension("part"));
        for ty in JobType::ALL {
            assert!(!ty.allowed_extensions().is_empty(), "{ty} has no extensions");
        }
    }

    #[test]
    fn test_apply_progress_merges_only_present_fields() {
        let mut job = Job::from_spec(spec(1));
        job.apply_progress(&ProgressUpdate {
            percent: Some(12.5),
            speed: Some("1.2MiB/s".into()),
            eta: None,
            stage: None,
        });
        job.apply_progress(&ProgressUpdate {
            percent: None,
            speed: None,
            eta: Some("00:42".into()),
            stage: Some(Stage::Merging),
        });
        assert_eq!(job.progress, Some(12.5));
        assert_eq!(job.speed.as_deref(), Some("1.2MiB/s"));
        assert_eq!(job.eta.as_deref(), Some("00:42"));
        assert_eq!(job.stage.as_deref(), Some("merging"));
    }

    #[test]
    fn test_snapshot_serialize() {
        let job = Job::from_spec(spec(3));
        let json = serde_json::to_string(&job.snapshot()).unwrap();
        assert!(json.contains("\"type\":\"audio\""));
        assert!(json.contains("\"userId\":\"u1\""));
        assert!(json.contains("\"status\":\"waiting\""));
        assert!(!json.contains("error"));
    }

    #[test]
    fn test_job_type_serde_names() {
        let ty: JobType = serde_json::from_str("\"embedSubs\"").unwrap();
        assert_eq!(ty, JobType::EmbedSubs);
        assert_eq!(serde_json::to_string(&JobType::Best).unwrap(), "\"best\"");
    }
}
