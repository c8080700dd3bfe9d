//! Scoreboard endpoints.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;

use koth_scoring::build_scoreboard_competition;

use crate::auth::{authed_user, user_can_view};
use crate::response::{error_response, ApiResponse};
use crate::ApiState;

/// GET /api/scoreboard
pub async fn get_scoreboard(State(state): State<ApiState>, headers: HeaderMap) -> impl IntoResponse {
    let user = authed_user(&state, &headers);

    let comps = match state.store.list_competitions() {
        Ok(comps) => comps,
        Err(e) => return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    };

    let mut payload = Vec::new();
    for comp in comps.iter().filter(|c| user_can_view(user.as_ref(), c)) {
        match build_scoreboard_competition(&state.store, comp) {
            Ok(board) => payload.push(board),
            Err(e) => {
                return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR);
            }
        }
    }
    payload.sort_by(|a, b| a.name.cmp(&b.name));

    ApiResponse::ok(serde_json::json!({ "competitions": payload })).into_response()
}

/// GET /api/scoreboard/{id}
pub async fn get_scoreboard_competition(
    State(state): State<ApiState>,
    Path(identifier): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if identifier.trim().is_empty() {
        return error_response("competition identifier required", StatusCode::BAD_REQUEST);
    }

    let comp = match state.store.find_competition(&identifier) {
        Ok(Some(comp)) => comp,
        Ok(None) => return error_response("competition not found", StatusCode::NOT_FOUND),
        Err(e) => return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    };

    let user = authed_user(&state, &headers);
    if !user_can_view(user.as_ref(), &comp) {
        return error_response("competition is restricted", StatusCode::FORBIDDEN);
    }

    match build_scoreboard_competition(&state.store, &comp) {
        Ok(board) => ApiResponse::ok(board).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}
