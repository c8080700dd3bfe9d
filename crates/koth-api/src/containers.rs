//! Bulk power actions and redeploy dispatch.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use tracing::debug;

use koth_lifecycle::{normalize_ids, LifecycleError, PowerAction};
use koth_stream::{JobLogger, RedeployJob};

use crate::auth::require_admin;
use crate::response::{error_response, ApiResponse};
use crate::ApiState;

#[derive(Deserialize)]
pub struct PowerRequest {
    pub ids: Vec<i64>,
    pub action: String,
}

/// POST /api/containers/power
pub async fn power_containers(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<PowerRequest>,
) -> impl IntoResponse {
    if let Err(response) = require_admin(&state, &headers) {
        return response;
    }

    let action = match request.action.trim().to_lowercase().as_str() {
        "start" => PowerAction::Start,
        "stop" => PowerAction::Stop,
        other => {
            return error_response(
                &format!("unknown power action {other:?}"),
                StatusCode::BAD_REQUEST,
            )
        }
    };

    match state.lifecycle.bulk_power(&request.ids, action).await {
        Ok(()) => ApiResponse::ok(serde_json::json!({
            "ids": normalize_ids(&request.ids),
            "action": request.action.trim().to_lowercase(),
        }))
        .into_response(),
        Err(e @ LifecycleError::NoIds) | Err(e @ LifecycleError::ContainerNotFound(_)) => {
            error_response(&e.to_string(), StatusCode::BAD_REQUEST)
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeployRequest {
    pub ids: Vec<i64>,
    #[serde(default)]
    pub start_after: bool,
    #[serde(default)]
    pub enable_advanced_logging: bool,
}

/// POST /api/containers/redeploy
pub async fn redeploy_containers(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<RedeployRequest>,
) -> impl IntoResponse {
    let user = match require_admin(&state, &headers) {
        Ok(user) => user,
        Err(response) => return response,
    };

    let ids = normalize_ids(&request.ids);
    if ids.is_empty() {
        return error_response("no container IDs supplied", StatusCode::BAD_REQUEST);
    }
    for &id in &ids {
        match state.store.get_container(id) {
            Ok(Some(_)) => {}
            Ok(None) => {
                return error_response(
                    &format!("container {id} not found"),
                    StatusCode::BAD_REQUEST,
                )
            }
            Err(e) => return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
        }
    }
    debug!(
        count = ids.len(),
        advanced_logging = request.enable_advanced_logging,
        "redeploy requested"
    );

    let job = state
        .redeploy_jobs
        .register(RedeployJob::new(&user.username, ids.clone(), request.start_after))
        .await;

    // Scoring must skip these containers before the job even starts.
    state.lifecycle.mark_redeploying(&ids);

    let lifecycle = state.lifecycle.clone();
    let job_for_task = job.clone();
    tokio::spawn(async move {
        job_for_task.status(&format!(
            "Redeploy job started for containers: {:?} (start when finished: {})",
            job_for_task.container_ids, job_for_task.start_after
        ));

        match lifecycle
            .redeploy_containers(
                &job_for_task.container_ids,
                job_for_task.as_ref(),
                job_for_task.start_after,
            )
            .await
        {
            Ok(()) => job_for_task.success("Redeploy completed successfully"),
            Err(e) => job_for_task.error(&format!("Redeploy failed: {e}")),
        }

        if let Err(e) = lifecycle
            .refresh_statuses(Some(&job_for_task.container_ids))
            .await
        {
            job_for_task.error(&format!("failed to refresh container statuses: {e}"));
        }
        job_for_task.mark_done();
    });

    ApiResponse::ok(serde_json::json!({ "jobID": job.stream().id })).into_response()
}
