//! Login, logout and the cookie-based request gate.

use axum::extract::{Form, State};
use axum::http::header::{HeaderMap, COOKIE, SET_COOKIE};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use tracing::info;

use koth_auth::AuthUser;
use koth_state::Competition;

use crate::response::{error_response, ApiResponse};
use crate::ApiState;

/// Name of the bearer cookie.
pub const AUTH_COOKIE: &str = "Authorization";

#[derive(Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

/// POST /api/auth/login
pub async fn login(
    State(state): State<ApiState>,
    Form(form): Form<LoginForm>,
) -> impl IntoResponse {
    match state.identity.authenticate(&form.username, &form.password).await {
        Ok(user) => {
            info!(username = %user.username, "login succeeded");
            let token = state.sessions.sign(&user);
            let cookie = format!("{AUTH_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax");
            (
                [(SET_COOKIE, cookie)],
                ApiResponse::ok(serde_json::json!({
                    "username": user.username,
                    "permissions": user.permissions,
                })),
            )
                .into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::UNAUTHORIZED),
    }
}

/// POST /api/auth/logout
pub async fn logout(State(state): State<ApiState>, headers: HeaderMap) -> impl IntoResponse {
    if authed_user(&state, &headers).is_none() {
        return error_response("authentication required", StatusCode::UNAUTHORIZED);
    }

    let cookie = format!("{AUTH_COOKIE}=; Path=/; Max-Age=0; HttpOnly");
    ([(SET_COOKIE, cookie)], ApiResponse::ok("logged out")).into_response()
}

/// Extract the bearer cookie's raw value.
pub fn cookie_value(headers: &HeaderMap) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((name, value)) = pair.split_once('=') {
                if name.trim() == AUTH_COOKIE {
                    return Some(value.trim().to_string());
                }
            }
        }
    }
    None
}

/// The authenticated session user, if the cookie verifies.
pub fn authed_user(state: &ApiState, headers: &HeaderMap) -> Option<AuthUser> {
    state.sessions.verify(&cookie_value(headers)?)
}

/// The authenticated administrator, or an error response.
pub fn require_admin(
    state: &ApiState,
    headers: &HeaderMap,
) -> Result<AuthUser, axum::response::Response> {
    let Some(user) = authed_user(state, headers) else {
        return Err(error_response("authentication required", StatusCode::UNAUTHORIZED));
    };
    if !user.is_admin() {
        return Err(error_response("insufficient permissions", StatusCode::FORBIDDEN));
    }
    Ok(user)
}

/// Visibility rule for private competitions.
pub fn user_can_view(user: Option<&AuthUser>, comp: &Competition) -> bool {
    if !comp.is_private {
        return true;
    }

    let Some(user) = user else { return false };
    if user.is_admin() {
        return true;
    }

    if comp.allowed_groups.is_empty() || user.groups.is_empty() {
        return false;
    }
    comp.allowed_groups.iter().any(|allowed| {
        user.groups
            .iter()
            .any(|g| g.trim().eq_ignore_ascii_case(allowed.trim()))
    })
}
