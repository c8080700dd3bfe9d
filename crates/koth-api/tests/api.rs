//! Handler-level tests over a fully wired (mock-vendor) state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::header::{HeaderMap, HeaderValue, COOKIE, SET_COOKIE};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Form, Json};
use chrono::Utc;

use koth_api::auth::{login, logout, LoginForm};
use koth_api::competitions::{list_competitions, toggle_scoring, ScoringToggle};
use koth_api::containers::{power_containers, PowerRequest};
use koth_api::files::{get_artifact_file, get_public_file};
use koth_api::scoreboard::{get_scoreboard, get_scoreboard_competition};
use koth_api::streams::stream_upload_job;
use koth_api::ApiState;
use koth_auth::{
    AccessTokenStore, AuthUser, Permissions, SessionSigner, StaticIdentityProvider,
};
use koth_core::config::Config;
use koth_hypervisor::mock::MockHypervisor;
use koth_hypervisor::HypervisorAdapter;
use koth_lifecycle::LifecycleController;
use koth_provision::Provisioner;
use koth_ssh::mock::MockSshClient;
use koth_state::{
    Competition, ContainerRecord, ContainerRestrictions, ContainerStatus, StateStore, Team,
};
use koth_stream::{JobLogger, JobRegistry, UploadJob};

struct Fixture {
    state: ApiState,
    storage: PathBuf,
}

impl Fixture {
    fn new(tag: &str) -> Self {
        let storage = std::env::temp_dir().join(format!("koth-api-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&storage);
        std::fs::create_dir_all(&storage).unwrap();

        let mut config = Config::default();
        config.storage.base_path = storage.display().to_string();
        config.web.public_url = "https://koth.lab".to_string();
        let config = Arc::new(config);

        let store = StateStore::open_in_memory().unwrap();
        let hypervisor = Arc::new(HypervisorAdapter::new(Arc::new(MockHypervisor::new(vec![
            "pve1".to_string(),
        ]))));
        let ssh = Arc::new(MockSshClient::new());
        let tokens = Arc::new(AccessTokenStore::new());

        let identity = StaticIdentityProvider::new()
            .with_user("admin", "hunter2", true, vec!["admins".to_string()])
            .with_user("player", "pw", false, vec!["blue-team".to_string()]);

        let provisioner = Arc::new(
            Provisioner::new(
                store.clone(),
                hypervisor.clone(),
                ssh.clone(),
                tokens.clone(),
                config.clone(),
            )
            .unwrap()
            .with_rsa_bits(1024),
        );
        let lifecycle = Arc::new(
            LifecycleController::new(
                store.clone(),
                hypervisor.clone(),
                ssh,
                tokens.clone(),
                config.clone(),
            )
            .unwrap(),
        );

        let state = ApiState {
            store,
            config,
            sessions: Arc::new(SessionSigner::new(chrono::Duration::hours(8))),
            identity: Arc::new(identity),
            tokens,
            provisioner,
            lifecycle,
            upload_jobs: Arc::new(JobRegistry::new()),
            redeploy_jobs: Arc::new(JobRegistry::new()),
            teardown_jobs: Arc::new(JobRegistry::new()),
        };

        Self { state, storage }
    }

    fn headers_for(&self, username: &str, admin: bool, groups: Vec<String>) -> HeaderMap {
        let token = self.state.sessions.sign(&AuthUser {
            username: username.to_string(),
            permissions: if admin {
                Permissions::Administrator
            } else {
                Permissions::User
            },
            groups,
        });
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("Authorization={token}")).unwrap(),
        );
        headers
    }

    fn seed_competition(&self, system_id: &str, private: bool) -> Competition {
        let package_dir = self.storage.join("packages").join(format!("{system_id}-1"));
        std::fs::create_dir_all(package_dir.join("public")).unwrap();
        std::fs::write(package_dir.join("public/index.html"), "<html>hello</html>").unwrap();
        std::fs::write(package_dir.join("score_web.sh"), "#!/bin/bash\n").unwrap();

        let comp = Competition {
            system_id: system_id.to_string(),
            name: format!("{system_id} comp"),
            description: String::new(),
            host: "UNH".to_string(),
            is_private: private,
            allowed_groups: if private {
                vec!["blue-team".to_string()]
            } else {
                Vec::new()
            },
            created_at: Utc::now(),
            package_path: package_dir.display().to_string(),
            setup_public_folder: "public".to_string(),
            network_cidr: "10.0.0.0/16".to_string(),
            restrictions: ContainerRestrictions::default(),
            ssh_pub_key_path: String::new(),
            ssh_priv_key_path: String::new(),
            team_ids: Vec::new(),
            container_ids: Vec::new(),
            scoring_active: false,
        };
        self.state.store.put_competition(&comp).unwrap();
        comp
    }

    fn cleanup(&self) {
        let _ = std::fs::remove_dir_all(&self.storage);
    }
}

#[tokio::test]
async fn login_sets_a_verifiable_cookie() {
    let fixture = Fixture::new("login");

    let response = login(
        State(fixture.state.clone()),
        Form(LoginForm {
            username: "admin".to_string(),
            password: "hunter2".to_string(),
        }),
    )
    .await
    .into_response();
    assert_eq!(response.status(), StatusCode::OK);

    let cookie = response.headers().get(SET_COOKIE).unwrap().to_str().unwrap();
    assert!(cookie.starts_with("Authorization="));
    let token = cookie
        .trim_start_matches("Authorization=")
        .split(';')
        .next()
        .unwrap();
    let user = fixture.state.sessions.verify(token).unwrap();
    assert!(user.is_admin());

    let rejected = login(
        State(fixture.state.clone()),
        Form(LoginForm {
            username: "admin".to_string(),
            password: "wrong".to_string(),
        }),
    )
    .await
    .into_response();
    assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);
    fixture.cleanup();
}

#[tokio::test]
async fn logout_requires_and_clears_the_session() {
    let fixture = Fixture::new("logout");

    let anonymous = logout(State(fixture.state.clone()), HeaderMap::new())
        .await
        .into_response();
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    let headers = fixture.headers_for("admin", true, Vec::new());
    let response = logout(State(fixture.state.clone()), headers).await.into_response();
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response.headers().get(SET_COOKIE).unwrap().to_str().unwrap();
    assert!(cookie.contains("Max-Age=0"));
    fixture.cleanup();
}

#[tokio::test]
async fn private_competitions_hide_from_strangers() {
    let fixture = Fixture::new("privacy");
    fixture.seed_competition("open", false);
    fixture.seed_competition("secret", true);

    // Anonymous: only the public competition.
    let response = list_competitions(State(fixture.state.clone()), HeaderMap::new())
        .await
        .into_response();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let competitions = json["data"]["competitions"].as_array().unwrap();
    assert_eq!(competitions.len(), 1);
    assert_eq!(competitions[0]["competitionID"], "open");

    // Member of the allowed group sees both.
    let member = fixture.headers_for("player", false, vec!["blue-team".to_string()]);
    let response = list_competitions(State(fixture.state.clone()), member)
        .await
        .into_response();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["data"]["competitions"].as_array().unwrap().len(), 2);
    fixture.cleanup();
}

#[tokio::test]
async fn access_tokens_scope_to_one_competition() {
    let fixture = Fixture::new("tokens");
    fixture.seed_competition("comp-a", false);
    fixture.seed_competition("comp-b", false);

    let token = fixture
        .state
        .tokens
        .issue("comp-a", Duration::from_secs(60))
        .await;
    let mut headers = HeaderMap::new();
    headers.insert(
        COOKIE,
        HeaderValue::from_str(&format!("Authorization={token}")).unwrap(),
    );

    let allowed = get_public_file(
        State(fixture.state.clone()),
        Path(("comp-a".to_string(), "index.html".to_string())),
        headers.clone(),
    )
    .await
    .into_response();
    assert_eq!(allowed.status(), StatusCode::OK);

    let denied = get_public_file(
        State(fixture.state.clone()),
        Path(("comp-b".to_string(), "index.html".to_string())),
        headers,
    )
    .await
    .into_response();
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
    fixture.cleanup();
}

#[tokio::test]
async fn file_routes_refuse_path_escapes() {
    let fixture = Fixture::new("pathsafety");
    let comp = fixture.seed_competition("demo", false);

    // A secret outside the package directory.
    std::fs::write(fixture.storage.join("secret.txt"), "keys").unwrap();

    let headers = fixture.headers_for("admin", true, Vec::new());

    for escape in [
        "../../secret.txt",
        "..%2F..%2Fsecret.txt",
        "/etc/passwd",
        "./../secret.txt",
    ] {
        let response = get_artifact_file(
            State(fixture.state.clone()),
            Path(("demo".to_string(), escape.to_string())),
            headers.clone(),
        )
        .await
        .into_response();
        assert_ne!(
            response.status(),
            StatusCode::OK,
            "escape {escape:?} must not be served"
        );
    }

    // Symlink inside the public folder pointing outside.
    #[cfg(unix)]
    {
        let link = PathBuf::from(&comp.package_path).join("public/leak");
        std::os::unix::fs::symlink(fixture.storage.join("secret.txt"), &link).unwrap();
        let response = get_public_file(
            State(fixture.state.clone()),
            Path(("demo".to_string(), "leak".to_string())),
            headers.clone(),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    // Plain artifact fetch still works for a session user.
    let response = get_artifact_file(
        State(fixture.state.clone()),
        Path(("demo".to_string(), "score_web.sh".to_string())),
        headers,
    )
    .await
    .into_response();
    assert_eq!(response.status(), StatusCode::OK);
    fixture.cleanup();
}

#[tokio::test]
async fn power_requires_admin() {
    let fixture = Fixture::new("powerauth");
    fixture.seed_competition("demo", false);

    let request = || PowerRequest {
        ids: vec![101],
        action: "start".to_string(),
    };

    let anonymous = power_containers(
        State(fixture.state.clone()),
        HeaderMap::new(),
        Json(request()),
    )
    .await
    .into_response();
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    let player = power_containers(
        State(fixture.state.clone()),
        fixture.headers_for("player", false, Vec::new()),
        Json(request()),
    )
    .await
    .into_response();
    assert_eq!(player.status(), StatusCode::FORBIDDEN);

    // Admin passes the gate; unknown id is a validation error.
    let admin = power_containers(
        State(fixture.state.clone()),
        fixture.headers_for("admin", true, Vec::new()),
        Json(request()),
    )
    .await
    .into_response();
    assert_eq!(admin.status(), StatusCode::BAD_REQUEST);
    fixture.cleanup();
}

#[tokio::test]
async fn power_round_trips_against_records() {
    let fixture = Fixture::new("power");
    fixture.seed_competition("demo", false);

    // A container both recorded and present on the mock cluster.
    use koth_hypervisor::HypervisorClient;
    let client = fixture.state.lifecycle.hypervisor().client().clone();
    let ctid = client.next_ctid().await.unwrap();
    client
        .create_container(
            "pve1",
            ctid,
            &koth_hypervisor::CtCreateSpec {
                hostname: "koth-demo-team-1-web".to_string(),
                ..Default::default()
            }
            .to_options(),
        )
        .await
        .unwrap();
    fixture
        .state
        .store
        .put_container(&ContainerRecord {
            ctid,
            ip_address: "10.0.0.10".to_string(),
            status: ContainerStatus::Stopped,
            team_id: 1,
            config_name: "web".to_string(),
            storage_pool: "team".to_string(),
            node_name: "pve1".to_string(),
            last_updated: Utc::now(),
            created_at: Utc::now(),
        })
        .unwrap();

    let response = power_containers(
        State(fixture.state.clone()),
        fixture.headers_for("admin", true, Vec::new()),
        Json(PowerRequest {
            ids: vec![ctid],
            action: "start".to_string(),
        }),
    )
    .await
    .into_response();
    assert_eq!(response.status(), StatusCode::OK);

    let record = fixture.state.store.get_container(ctid).unwrap().unwrap();
    assert_eq!(record.status, ContainerStatus::Running);
    fixture.cleanup();
}

#[tokio::test]
async fn scoring_toggle_flips_the_flag() {
    let fixture = Fixture::new("toggle");
    fixture.seed_competition("demo", false);
    let headers = fixture.headers_for("admin", true, Vec::new());

    let response = toggle_scoring(
        State(fixture.state.clone()),
        Path("demo".to_string()),
        headers.clone(),
        Json(ScoringToggle { active: true }),
    )
    .await
    .into_response();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(fixture.state.store.get_competition("demo").unwrap().unwrap().scoring_active);

    let response = toggle_scoring(
        State(fixture.state.clone()),
        Path("demo".to_string()),
        headers,
        Json(ScoringToggle { active: false }),
    )
    .await
    .into_response();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!fixture.state.store.get_competition("demo").unwrap().unwrap().scoring_active);
    fixture.cleanup();
}

#[tokio::test]
async fn scoreboard_orders_teams_and_respects_privacy() {
    let fixture = Fixture::new("scoreboard");
    let mut comp = fixture.seed_competition("secret", true);

    for (name, score) in [("Team 1", 10), ("Team 2", 40)] {
        let mut team = Team {
            id: 0,
            name: name.to_string(),
            score,
            network_cidr: "10.0.0.0/24".to_string(),
            container_ids: Vec::new(),
            last_updated: Utc::now(),
            created_at: Utc::now(),
        };
        fixture.state.store.insert_team(&mut team).unwrap();
        comp.team_ids.push(team.id);
    }
    fixture.state.store.put_competition(&comp).unwrap();

    let stranger = get_scoreboard_competition(
        State(fixture.state.clone()),
        Path("secret".to_string()),
        HeaderMap::new(),
    )
    .await
    .into_response();
    assert_eq!(stranger.status(), StatusCode::FORBIDDEN);

    let admin = fixture.headers_for("admin", true, Vec::new());
    let response = get_scoreboard_competition(
        State(fixture.state.clone()),
        Path("secret".to_string()),
        admin.clone(),
    )
    .await
    .into_response();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let teams = json["data"]["teams"].as_array().unwrap();
    assert_eq!(teams[0]["name"], "Team 2");
    assert_eq!(teams[1]["name"], "Team 1");

    // The aggregate endpoint hides the private competition from strangers.
    let response = get_scoreboard(State(fixture.state.clone()), HeaderMap::new())
        .await
        .into_response();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(json["data"]["competitions"].as_array().unwrap().is_empty());
    fixture.cleanup();
}

#[tokio::test]
async fn job_streams_enforce_ownership() {
    let fixture = Fixture::new("jobstream");

    let job = fixture
        .state
        .upload_jobs
        .register(UploadJob::new("admin"))
        .await;
    job.status("m1");

    let anonymous = stream_upload_job(
        State(fixture.state.clone()),
        Path(job.stream().id.clone()),
        HeaderMap::new(),
    )
    .await;
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    let other = stream_upload_job(
        State(fixture.state.clone()),
        Path(job.stream().id.clone()),
        fixture.headers_for("player", false, Vec::new()),
    )
    .await;
    assert_eq!(other.status(), StatusCode::FORBIDDEN);

    let owner = stream_upload_job(
        State(fixture.state.clone()),
        Path(job.stream().id.clone()),
        fixture.headers_for("admin", true, Vec::new()),
    )
    .await;
    assert_eq!(owner.status(), StatusCode::OK);
    assert_eq!(
        owner.headers().get("content-type").unwrap().to_str().unwrap(),
        "text/event-stream"
    );

    let missing = stream_upload_job(
        State(fixture.state.clone()),
        Path("nope".to_string()),
        fixture.headers_for("admin", true, Vec::new()),
    )
    .await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    fixture.cleanup();
}
