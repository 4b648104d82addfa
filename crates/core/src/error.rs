// crates/core/src/error.rs
use std::path::PathBuf;

use thiserror::Error;

use crate::job::JobStatus;

/// Errors surfaced by job bookkeeping.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job already exists: {0}")]
    DuplicateJob(String),

    #[error("Job {id} is {status}")]
    InvalidState { id: String, status: JobStatus },

    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    #[error("Batch has no items")]
    EmptyBatch,

    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl JobError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised while starting or monitoring an executor process.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Executor did not expose {0}")]
    MissingPipe(&'static str),

    #[error("Executor rejected job: {0}")]
    Rejected(String),
}

/// Errors loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed config file {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {value}")]
    Invalid { key: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_error_display() {
        assert_eq!(JobError::NotFound("abc".into()).to_string(), "Job not found: abc");
        let err = JobError::InvalidState {
            id: "abc".into(),
            status: JobStatus::Running,
        };
        assert_eq!(err.to_string(), "Job abc is running");
    }

    #[test]
    fn test_executor_error_display() {
        let err = ExecutorError::SpawnFailed {
            program: "yt-dlp".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        assert!(err.to_string().starts_with("Failed to spawn yt-dlp"));
        assert_eq!(
            ExecutorError::MissingPipe("stdout").to_string(),
            "Executor did not expose stdout"
        );
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Invalid {
            key: "MEDIAQ_PORT".into(),
            value: "abc".into(),
        };
        assert_eq!(err.to_string(), "Invalid value for MEDIAQ_PORT: abc");
    }
}
