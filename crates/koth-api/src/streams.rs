//! Server-sent-event streams over job logs.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures::stream::{self, Stream};
use tokio::sync::mpsc;

use koth_core::sanitize::sanitize_log_message;

use crate::auth::authed_user;
use crate::response::error_response;
use crate::ApiState;

/// GET /api/competitions/upload/{job_id}/stream
pub async fn stream_upload_job(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> axum::response::Response {
    let Some(user) = authed_user(&state, &headers) else {
        return error_response("authentication required", StatusCode::UNAUTHORIZED);
    };

    if state.upload_jobs.get(&job_id).await.is_none() {
        return error_response("job not found", StatusCode::NOT_FOUND);
    }
    match state.upload_jobs.get_for_viewer(&job_id, &user.username).await {
        Some(job) => sse_from(job.subscribe()).into_response(),
        None => error_response("forbidden", StatusCode::FORBIDDEN),
    }
}

/// GET /api/containers/redeploy/{job_id}/stream
pub async fn stream_redeploy_job(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> axum::response::Response {
    let Some(user) = authed_user(&state, &headers) else {
        return error_response("authentication required", StatusCode::UNAUTHORIZED);
    };

    if state.redeploy_jobs.get(&job_id).await.is_none() {
        return error_response("job not found", StatusCode::NOT_FOUND);
    }
    match state.redeploy_jobs.get_for_viewer(&job_id, &user.username).await {
        Some(job) => sse_from(job.subscribe()).into_response(),
        None => error_response("forbidden", StatusCode::FORBIDDEN),
    }
}

/// GET /api/competitions/teardown/{job_id}/stream
pub async fn stream_teardown_job(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> axum::response::Response {
    let Some(user) = authed_user(&state, &headers) else {
        return error_response("authentication required", StatusCode::UNAUTHORIZED);
    };

    if state.teardown_jobs.get(&job_id).await.is_none() {
        return error_response("job not found", StatusCode::NOT_FOUND);
    }
    match state.teardown_jobs.get_for_viewer(&job_id, &user.username).await {
        Some(job) => sse_from(job.subscribe()).into_response(),
        None => error_response("forbidden", StatusCode::FORBIDDEN),
    }
}

/// Adapt a job subscription into an SSE body. Each log line becomes one
/// `data:` event; newlines inside a line are flattened so a line can
/// never smuggle extra events.
fn sse_from(
    receiver: mpsc::Receiver<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = stream::unfold(receiver, |mut receiver| async move {
        receiver
            .recv()
            .await
            .map(|line| (Ok(Event::default().data(sanitize_log_message(&line))), receiver))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
