// crates/server/src/error.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use mediaq_core::JobError;
use serde::Serialize;
use thiserror::Error;

/// Structured JSON error response for API errors
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// API error types that map to HTTP status codes
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::NotFound(id) => ApiError::JobNotFound(id),
            JobError::BatchNotFound(id) => ApiError::BatchNotFound(id),
            JobError::DuplicateJob(_) | JobError::InvalidState { .. } => {
                ApiError::Conflict(err.to_string())
            }
            JobError::EmptyBatch => ApiError::BadRequest(err.to_string()),
            JobError::Io { .. } => ApiError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_response) = match &self {
            ApiError::JobNotFound(id) => {
                tracing::debug!(job_id = %id, "Job not found");
                (
                    StatusCode::NOT_FOUND,
                    ErrorResponse::with_details("Job not found", format!("Job ID: {}", id)),
                )
            }
            ApiError::BatchNotFound(id) => {
                tracing::debug!(batch_id = %id, "Batch not found");
                (
                    StatusCode::NOT_FOUND,
                    ErrorResponse::with_details("Batch not found", format!("Batch ID: {}", id)),
                )
            }
            ApiError::BadRequest(msg) => {
                tracing::warn!(message = %msg, "Bad request");
                (
                    StatusCode::BAD_REQUEST,
                    ErrorResponse::with_details("Bad request", msg.clone()),
                )
            }
            ApiError::Conflict(msg) => {
                tracing::warn!(message = %msg, "Conflict");
                (
                    StatusCode::CONFLICT,
                    ErrorResponse::with_details("Conflict", msg.clone()),
                )
            }
            ApiError::Internal(msg) => {
                tracing::error!(message = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new("Internal server error"),
                )
            }
        };

        (status, Json(error_response)).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use mediaq_core::JobStatus;

    /// Helper to extract status code and body from a response
    async fn extract_response(response: Response) -> (StatusCode, ErrorResponse) {
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let error_response: ErrorResponse = serde_json::from_slice(&body).unwrap();
        (status, error_response)
    }

    #[tokio::test]
    async fn test_job_not_found_returns_404() {
        let response = ApiError::JobNotFound("abc123".to_string()).into_response();
        let (status, body) = extract_response(response).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.error, "Job not found");
        assert!(body.details.unwrap().contains("abc123"));
    }

    #[tokio::test]
    async fn test_duplicate_job_maps_to_conflict() {
        let api: ApiError = JobError::DuplicateJob("j1".into()).into();
        let (status, body) = extract_response(api.into_response()).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body.details.unwrap().contains("j1"));
    }

    #[tokio::test]
    async fn test_invalid_state_maps_to_conflict() {
        let api: ApiError = JobError::InvalidState {
            id: "j1".into(),
            status: JobStatus::Running,
        }
        .into();
        let (status, _) = extract_response(api.into_response()).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_empty_batch_is_bad_request() {
        let api: ApiError = JobError::EmptyBatch.into();
        let (status, body) = extract_response(api.into_response()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.error, "Bad request");
    }

    #[tokio::test]
    async fn test_io_error_hides_details() {
        let api: ApiError = JobError::io(
            "/tmp/mediaq",
            std::io::Error::new(std::io::ErrorKind::Other, "disk error"),
        )
        .into();
        let (status, body) = extract_response(api.into_response()).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error, "Internal server error");
        assert!(body.details.is_none());
    }

    #[test]
    fn test_error_response_serialization() {
        let json = serde_json::to_string(&ErrorResponse::new("Test error")).unwrap();
        assert!(json.contains("\"error\":\"Test error\""));
        assert!(!json.contains("details"));

        let json = serde_json::to_string(&ErrorResponse::with_details("Test error", "More info")).unwrap();
        assert!(json.contains("\"details\":\"More info\""));
    }

    #[test]
    fn test_api_error_display() {
        assert_eq!(ApiError::JobNotFound("x".into()).to_string(), "Job not found: x");
        assert_eq!(ApiError::Internal("oops".into()).to_string(), "Internal server error: oops");
    }
}
