//! Competition listing, upload intake, teardown and scoring toggle.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use koth_intake::{
    ensure_competition_id_available, inspect_archive, materialize_package, validate_restrictions,
    IntakeError,
};
use koth_state::Competition;
use koth_stream::{JobLogger, TeardownJob, UploadJob, UploadStatus};

use crate::auth::{authed_user, require_admin, user_can_view};
use crate::response::{error_response, ApiResponse};
use crate::ApiState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompetitionSummary {
    #[serde(rename = "competitionID")]
    pub competition_id: String,
    pub name: String,
    pub description: String,
    pub host: String,
    pub team_count: usize,
    pub container_count: usize,
    pub is_private: bool,
    pub scoring_active: bool,
    pub created_at: DateTime<Utc>,
}

fn summarize(comp: &Competition) -> CompetitionSummary {
    CompetitionSummary {
        competition_id: comp.system_id.clone(),
        name: comp.name.clone(),
        description: comp.description.clone(),
        host: comp.host.clone(),
        team_count: comp.team_ids.len(),
        container_count: comp.container_ids.len(),
        is_private: comp.is_private,
        scoring_active: comp.scoring_active,
        created_at: comp.created_at,
    }
}

/// GET /api/competitions
pub async fn list_competitions(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user = authed_user(&state, &headers);

    let comps = match state.store.list_competitions() {
        Ok(comps) => comps,
        Err(e) => return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    };

    let mut visible: Vec<CompetitionSummary> = comps
        .iter()
        .filter(|comp| user_can_view(user.as_ref(), comp))
        .map(summarize)
        .collect();
    visible.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    ApiResponse::ok(serde_json::json!({ "competitions": visible })).into_response()
}

/// POST /api/competitions/upload
///
/// Runs intake synchronously (so validation failures surface as 4xx with
/// the accumulated log), then hands off to a provisioning job and
/// returns its id.
pub async fn upload_competition(
    State(state): State<ApiState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> impl IntoResponse {
    let user = match require_admin(&state, &headers) {
        Ok(user) => user,
        Err(response) => return response,
    };

    let mut logs: Vec<String> = Vec::new();
    logs.push(format!("user {} authorized to manage competitions", user.username));

    // Pull the archive out of the multipart body.
    let mut filename = String::new();
    let mut archive: Vec<u8> = Vec::new();
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                if field.name() != Some("file") {
                    continue;
                }
                filename = field.file_name().unwrap_or("upload.zip").to_string();
                match field.bytes().await {
                    Ok(bytes) => archive = bytes.to_vec(),
                    Err(e) => {
                        return upload_failure(&logs, "failed to read upload", Some(&e.to_string()), StatusCode::BAD_REQUEST)
                    }
                }
                break;
            }
            Ok(None) => break,
            Err(e) => {
                return upload_failure(&logs, "invalid multipart body", Some(&e.to_string()), StatusCode::BAD_REQUEST)
            }
        }
    }

    if archive.is_empty() {
        return upload_failure(&logs, "file is required", None, StatusCode::BAD_REQUEST);
    }
    logs.push(format!("zip received: {filename} ({} bytes)", archive.len()));

    // Intake: validate, detect root, parse config.
    let plan = match inspect_archive(&archive) {
        Ok(plan) => plan,
        Err(e) => return intake_failure(&logs, e),
    };
    logs.push(format!(
        "config.json parsed for {} ({})",
        plan.config.competition_name, plan.config.competition_id
    ));
    if let Some(root) = &plan.root_prefix {
        logs.push(format!("detected archive root '{root}', trimming attachment paths"));
    }

    if let Err(e) = ensure_competition_id_available(&state.store, &plan.config.competition_id) {
        return intake_failure(&logs, e);
    }
    logs.push(format!(
        "competition ID '{}' validated and available",
        plan.config.competition_id
    ));

    if let Err(e) = validate_restrictions(&plan.config, &state.config.restrictions) {
        return intake_failure(&logs, e);
    }

    let storage_base = PathBuf::from(state.config.storage_base());
    let package = match materialize_package(&state.store, &storage_base, &plan, &filename) {
        Ok(package) => package,
        Err(e) => return intake_failure(&logs, e),
    };
    logs.push(format!("stored package at {}", package.storage_path));

    // Hand off to the provisioning job.
    let job = state.upload_jobs.register(UploadJob::new(&user.username)).await;
    for line in &logs {
        job.status(line);
    }
    job.status("waiting for provisioning to start");

    let response = serde_json::json!({
        "message": "competition package parsed",
        "competitionID": plan.config.competition_id,
        "competitionName": plan.config.competition_name,
        "attachmentCount": plan.attachments.len(),
        "jobID": job.stream().id,
        "logs": logs,
    });

    let provisioner = state.provisioner.clone();
    let request = plan.config;
    let storage_path = package.storage_path.clone();
    let job_for_task = job.clone();
    tokio::spawn(async move {
        job_for_task.set_status(UploadStatus::Provisioning);
        job_for_task.status("provisioning job started");

        let logger: Arc<dyn JobLogger> = job_for_task.clone();
        match provisioner
            .create_competition(&request, &storage_path, logger)
            .await
        {
            Ok(comp) => {
                info!(system_id = %comp.system_id, "provisioning job completed");
                job_for_task.status("Provisioning completed successfully");
                job_for_task.complete();
            }
            Err(e) => {
                error!(error = %e, "provisioning job failed");
                job_for_task.status(&format!("Provisioning failed: {e}"));
                job_for_task.fail("provisioning failed", Some(&e.to_string()));
            }
        }
    });

    ApiResponse::ok(response).into_response()
}

fn upload_failure(
    logs: &[String],
    message: &str,
    detail: Option<&str>,
    status: StatusCode,
) -> axum::response::Response {
    let mut payload = serde_json::json!({
        "error": message,
        "logs": logs,
    });
    if let Some(detail) = detail {
        payload["detail"] = serde_json::Value::String(detail.to_string());
    }
    (status, Json(payload)).into_response()
}

fn intake_failure(logs: &[String], error: IntakeError) -> axum::response::Response {
    let status = match &error {
        IntakeError::IdConflict(_) => StatusCode::CONFLICT,
        e if e.is_validation() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    upload_failure(logs, &error.to_string(), None, status)
}

/// POST /api/competitions/{id}/teardown
pub async fn teardown_competition(
    State(state): State<ApiState>,
    Path(identifier): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user = match require_admin(&state, &headers) {
        Ok(user) => user,
        Err(response) => return response,
    };

    let identifier = identifier.trim().to_string();
    if identifier.is_empty() {
        return error_response("competition identifier required", StatusCode::BAD_REQUEST);
    }

    let comp = match state.store.find_competition(&identifier) {
        Ok(Some(comp)) => comp,
        Ok(None) => return error_response("competition not found", StatusCode::NOT_FOUND),
        Err(e) => return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    };

    let job = state
        .teardown_jobs
        .register(TeardownJob::new(&user.username, &comp.system_id))
        .await;

    let lifecycle = state.lifecycle.clone();
    let job_for_task = job.clone();
    tokio::spawn(async move {
        job_for_task.status(&format!(
            "Teardown job started for competition {}",
            job_for_task.competition_id
        ));
        if let Err(e) = lifecycle
            .teardown_competition(&comp, job_for_task.as_ref())
            .await
        {
            job_for_task.error(&format!("Teardown failed: {e}"));
        }
        job_for_task.mark_done();
    });

    ApiResponse::ok(serde_json::json!({ "jobID": job.stream().id })).into_response()
}

#[derive(Deserialize)]
pub struct ScoringToggle {
    pub active: bool,
}

/// POST /api/competitions/{id}/scoring
pub async fn toggle_scoring(
    State(state): State<ApiState>,
    Path(identifier): Path<String>,
    headers: HeaderMap,
    Json(toggle): Json<ScoringToggle>,
) -> impl IntoResponse {
    if let Err(response) = require_admin(&state, &headers) {
        return response;
    }

    let mut comp = match state.store.find_competition(&identifier) {
        Ok(Some(comp)) => comp,
        Ok(None) => return error_response("competition not found", StatusCode::NOT_FOUND),
        Err(e) => return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    };

    comp.scoring_active = toggle.active;
    if let Err(e) = state.store.put_competition(&comp) {
        return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    info!(system_id = %comp.system_id, active = toggle.active, "scoring toggled");
    ApiResponse::ok(serde_json::json!({
        "competitionID": comp.system_id,
        "scoringActive": comp.scoring_active,
    }))
    .into_response()
}
