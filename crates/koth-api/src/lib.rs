//! koth-api — the HTTP surface.
//!
//! Provides axum route handlers over the record store, the job
//! registries and the engines.
//!
//! # API Routes
//!
//! | Method | Path | Auth | Description |
//! |---|---|---|---|
//! | POST | `/api/auth/login` | form credentials | Issue the bearer cookie |
//! | POST | `/api/auth/logout` | logged-in | Clear the cookie |
//! | GET | `/api/competitions` | optional | List visible competitions |
//! | POST | `/api/competitions/upload` | admin | Archive intake → Upload job |
//! | GET | `/api/competitions/upload/{job_id}/stream` | owner | SSE job log |
//! | POST | `/api/competitions/{id}/teardown` | admin | Teardown job |
//! | GET | `/api/competitions/teardown/{job_id}/stream` | owner | SSE job log |
//! | GET | `/api/competitions/{id}/public/{*path}` | token or session | Public file |
//! | GET | `/api/competitions/{id}/artifacts/{*path}` | token or session | Package file |
//! | POST | `/api/competitions/{id}/scoring` | admin | Toggle scoring |
//! | GET | `/api/scoreboard` | optional | All visible scoreboards |
//! | GET | `/api/scoreboard/{id}` | optional | One scoreboard |
//! | POST | `/api/containers/power` | admin | Bulk start/stop |
//! | POST | `/api/containers/redeploy` | admin | Redeploy job |
//! | GET | `/api/containers/redeploy/{job_id}/stream` | owner | SSE job log |

pub mod auth;
pub mod competitions;
pub mod containers;
pub mod files;
pub mod response;
pub mod scoreboard;
pub mod streams;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use koth_auth::{AccessTokenStore, IdentityProvider, SessionSigner};
use koth_core::config::Config;
use koth_lifecycle::LifecycleController;
use koth_provision::Provisioner;
use koth_state::StateStore;
use koth_stream::{JobRegistry, RedeployJob, TeardownJob, UploadJob};

/// Allow some headroom over the archive cap for multipart framing.
const UPLOAD_BODY_LIMIT: usize = 80 * 1024 * 1024;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub config: Arc<Config>,
    pub sessions: Arc<SessionSigner>,
    pub identity: Arc<dyn IdentityProvider>,
    pub tokens: Arc<AccessTokenStore>,
    pub provisioner: Arc<Provisioner>,
    pub lifecycle: Arc<LifecycleController>,
    pub upload_jobs: Arc<JobRegistry<UploadJob>>,
    pub redeploy_jobs: Arc<JobRegistry<RedeployJob>>,
    pub teardown_jobs: Arc<JobRegistry<TeardownJob>>,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/competitions", get(competitions::list_competitions))
        .route(
            "/api/competitions/upload",
            post(competitions::upload_competition)
                .layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT)),
        )
        .route(
            "/api/competitions/upload/{job_id}/stream",
            get(streams::stream_upload_job),
        )
        .route(
            "/api/competitions/teardown/{job_id}/stream",
            get(streams::stream_teardown_job),
        )
        .route(
            "/api/competitions/{id}/teardown",
            post(competitions::teardown_competition),
        )
        .route(
            "/api/competitions/{id}/scoring",
            post(competitions::toggle_scoring),
        )
        .route(
            "/api/competitions/{id}/public/{*path}",
            get(files::get_public_file),
        )
        .route(
            "/api/competitions/{id}/artifacts/{*path}",
            get(files::get_artifact_file),
        )
        .route("/api/scoreboard", get(scoreboard::get_scoreboard))
        .route("/api/scoreboard/{id}", get(scoreboard::get_scoreboard_competition))
        .route("/api/containers/power", post(containers::power_containers))
        .route("/api/containers/redeploy", post(containers::redeploy_containers))
        .route(
            "/api/containers/redeploy/{job_id}/stream",
            get(streams::stream_redeploy_job),
        )
        .layer(cors)
        .with_state(state)
}
