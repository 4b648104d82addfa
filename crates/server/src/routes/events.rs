//! Per-job progress stream over SSE.
//!
//! - `GET /api/jobs/{id}/events` -- replay of buffered events, then live ones

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::sse::{Event, Sse},
    routing::get,
    Router,
};
use mediaq_core::{HubEvent, JobId, END_EVENT};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/jobs/{id}/events", get(job_events))
}

fn to_sse(event: &HubEvent) -> Event {
    Event::default()
        .event(event.event.as_str())
        .id(event.sequence.to_string())
        .data(serde_json::to_string(&event.payload).unwrap_or_default())
}

fn last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// GET /api/jobs/{id}/events -- SSE stream of one job's events.
///
/// # Events
///
/// | Event name        | When emitted                              |
/// |-------------------|-------------------------------------------|
/// | `status`          | Job queued, job started                   |
/// | `progress` etc.   | Parsed executor output, named by stage    |
/// | `completed`       | Output found, with `{size, filename}`     |
/// | `failed`          | With `{error, kind}`                      |
/// | `canceled`        | With `{reason}`                           |
/// | `end`             | Last frame, with `{status}`               |
/// | `heartbeat`       | Every `hub.heartbeat_secs`                |
///
/// The stream closes after `end`, or after `hub.idle_timeout_secs` without
/// any job event. A job that already ended gets a single `end` frame.
pub async fn job_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>> {
    let job_id = JobId::new(id.clone());
    if state.jobs.get(&job_id).is_none() {
        return Err(ApiError::JobNotFound(id));
    }

    let hub = Arc::clone(state.jobs.hub());
    let (subscriber_id, mut rx) = hub.subscribe(job_id.as_str(), last_event_id(&headers));

    // A live channel always holds at least the `status` event from submit, so
    // an empty replay for a terminal job means its channel was already ended.
    let first = rx.try_recv().ok();
    let ended_status = match &first {
        Some(_) => None,
        None => state
            .jobs
            .get(&job_id)
            .filter(|j| j.status.is_terminal())
            .map(|j| j.status),
    };

    let heartbeat = Duration::from_secs(state.config.hub.heartbeat_secs.max(1));
    let idle_timeout = Duration::from_secs(state.config.hub.idle_timeout_secs.max(1));

    let stream = async_stream::stream! {
        if let Some(status) = ended_status {
            yield Ok(Event::default()
                .event(END_EVENT)
                .data(serde_json::json!({ "status": status }).to_string()));
        } else {
            let mut open = true;
            if let Some(event) = first {
                open = !event.is_end();
                yield Ok(to_sse(&event));
            }

            let mut heartbeat_interval = tokio::time::interval(heartbeat);
            heartbeat_interval.tick().await;
            let idle = tokio::time::sleep(idle_timeout);
            tokio::pin!(idle);

            while open {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => {
                            idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);
                            open = !event.is_end();
                            yield Ok(to_sse(&event));
                        }
                        None => open = false,
                    },
                    _ = heartbeat_interval.tick() => {
                        yield Ok(Event::default().event("heartbeat").data("{}"));
                    }
                    _ = &mut idle => {
                        tracing::debug!(job_id = %job_id, "SSE stream idle, closing");
                        open = false;
                    }
                }
            }
        }
        hub.unregister(job_id.as_str(), subscriber_id);
    };

    Ok(Sse::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_last_event_id_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(last_event_id(&headers), None);
        headers.insert("last-event-id", HeaderValue::from_static("17"));
        assert_eq!(last_event_id(&headers), Some(17));
        headers.insert("last-event-id", HeaderValue::from_static("abc"));
        assert_eq!(last_event_id(&headers), None);
    }
}
