//! Token- or session-gated file serving from package directories.

use std::path::{Path as FsPath, PathBuf};

use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use tracing::debug;

use koth_core::sanitize::{path_within_base, sanitize_relative_path};

use crate::auth::{authed_user, cookie_value};
use crate::response::error_response;
use crate::ApiState;

/// GET /api/competitions/{id}/public/{*path}
pub async fn get_public_file(
    State(state): State<ApiState>,
    Path((competition_id, path)): Path<(String, String)>,
    headers: HeaderMap,
) -> impl IntoResponse {
    serve_competition_file(&state, &competition_id, &path, &headers, true).await
}

/// GET /api/competitions/{id}/artifacts/{*path}
pub async fn get_artifact_file(
    State(state): State<ApiState>,
    Path((competition_id, path)): Path<(String, String)>,
    headers: HeaderMap,
) -> impl IntoResponse {
    serve_competition_file(&state, &competition_id, &path, &headers, false).await
}

/// Stream a file from a competition package, refusing anything that
/// resolves outside the base directory.
async fn serve_competition_file(
    state: &ApiState,
    competition_id: &str,
    relative: &str,
    headers: &HeaderMap,
    public_only: bool,
) -> axum::response::Response {
    if competition_id.trim().is_empty() {
        return error_response("competition identifier required", StatusCode::BAD_REQUEST);
    }

    let comp = match state.store.find_competition(competition_id) {
        Ok(Some(comp)) => comp,
        Ok(None) => return error_response("competition not found", StatusCode::NOT_FOUND),
        Err(e) => return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    };

    // The bearer cookie may carry an access token scoped to this
    // competition, or an operator session.
    let cookie = cookie_value(headers).unwrap_or_default();
    let token_ok = state.tokens.validate(&comp.system_id, &cookie).await;
    if !token_ok && authed_user(state, headers).is_none() {
        return error_response("authorization required", StatusCode::UNAUTHORIZED);
    }

    let relative = sanitize_relative_path(relative);
    if relative.is_empty() {
        return error_response("file not found", StatusCode::NOT_FOUND);
    }

    if comp.package_path.is_empty() {
        return error_response("file not found", StatusCode::NOT_FOUND);
    }
    let mut base = PathBuf::from(&comp.package_path);
    if public_only {
        let folder = comp.setup_public_folder.trim();
        if !folder.is_empty() {
            base = base.join(folder);
        }
    }

    let target = base.join(&relative);
    if !path_within_base(&base, &target) {
        return error_response("forbidden", StatusCode::FORBIDDEN);
    }

    // Canonicalized comparison catches symlinks pointing back out.
    let canonical_base = match base.canonicalize() {
        Ok(path) => path,
        Err(_) => return error_response("file not found", StatusCode::NOT_FOUND),
    };
    let canonical_target = match target.canonicalize() {
        Ok(path) => path,
        Err(_) => return error_response("file not found", StatusCode::NOT_FOUND),
    };
    if !canonical_target.starts_with(&canonical_base) {
        return error_response("forbidden", StatusCode::FORBIDDEN);
    }

    if canonical_target.is_dir() {
        return error_response("file not found", StatusCode::NOT_FOUND);
    }

    match tokio::fs::read(&canonical_target).await {
        Ok(bytes) => {
            debug!(path = %canonical_target.display(), bytes = bytes.len(), "serving package file");
            (
                StatusCode::OK,
                [(CONTENT_TYPE, content_type_for(&canonical_target))],
                bytes,
            )
                .into_response()
        }
        Err(_) => error_response("file not found", StatusCode::NOT_FOUND),
    }
}

/// Minimal extension → content-type mapping for package artifacts.
fn content_type_for(path: &FsPath) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        Some("json") => "application/json",
        Some("txt") | Some("sh") | Some("md") => "text/plain; charset=utf-8",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("zip") => "application/zip",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}
