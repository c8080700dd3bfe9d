//! Scoring passes against a mock hypervisor console.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use koth_auth::AccessTokenStore;
use koth_core::config::Config;
use koth_hypervisor::mock::MockHypervisor;
use koth_hypervisor::{Ctid, HypervisorAdapter};
use koth_scoring::ScoringEngine;
use koth_state::{
    Competition, ContainerRecord, ContainerRestrictions, ContainerStatus, StateStore, Team,
};

struct Fixture {
    store: StateStore,
    hypervisor: Arc<MockHypervisor>,
    engine: Arc<ScoringEngine>,
    storage: PathBuf,
    package_dir: PathBuf,
}

const PACKAGE_CONFIG: &str = r#"{
    "competitionID": "demo",
    "competitionName": "Demo Comp",
    "numTeams": 1,
    "containerSpecs": {"rootPassword": "hunter2"},
    "teamContainerConfigs": [
        {
            "name": "web",
            "lastOctetValue": 10,
            "scoringScript": ["score_web.sh"],
            "scoringSchema": [
                {"id": "http_200", "name": "HTTP up", "passPoints": 10, "failPoints": -5},
                {"id": "tls", "name": "TLS valid", "passPoints": 5, "failPoints": -2}
            ]
        },
        {
            "name": "db",
            "lastOctetValue": 20,
            "scoringScript": ["score_db.sh"],
            "scoringSchema": [
                {"id": "tcp_3306", "name": "DB up", "passPoints": 8, "failPoints": -4}
            ]
        }
    ]
}"#;

impl Fixture {
    fn new(tag: &str) -> Self {
        let storage = std::env::temp_dir().join(format!("koth-score-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&storage);
        let package_dir = storage.join("packages").join("demo-1");
        std::fs::create_dir_all(&package_dir).unwrap();
        std::fs::write(package_dir.join("config.json"), PACKAGE_CONFIG).unwrap();

        let mut config = Config::default();
        config.storage.base_path = storage.display().to_string();
        config.web.public_url = "https://koth.lab".to_string();

        let store = StateStore::open_in_memory().unwrap();
        let hypervisor = Arc::new(MockHypervisor::new(vec!["pve1".to_string()]));
        let engine = Arc::new(
            ScoringEngine::new(
                store.clone(),
                Arc::new(HypervisorAdapter::new(hypervisor.clone())),
                Arc::new(AccessTokenStore::new()),
                Arc::new(config),
            )
            .unwrap(),
        );

        Self {
            store,
            hypervisor,
            engine,
            storage,
            package_dir,
        }
    }

    /// One team with both containers provisioned and running.
    async fn seed_competition(&self) -> (Team, Ctid, Ctid) {
        let mut team = Team {
            id: 0,
            name: "Team 1".to_string(),
            score: 0,
            network_cidr: "10.0.0.0/24".to_string(),
            container_ids: Vec::new(),
            last_updated: Utc::now(),
            created_at: Utc::now(),
        };
        self.store.insert_team(&mut team).unwrap();

        let web_ctid = self.create_running_container("koth-demo-team-1-web").await;
        let db_ctid = self.create_running_container("koth-demo-team-1-db").await;

        for (ctid, name, ip) in [
            (web_ctid, "web", "10.0.0.10"),
            (db_ctid, "db", "10.0.0.20"),
        ] {
            self.store
                .put_container(&ContainerRecord {
                    ctid,
                    ip_address: ip.to_string(),
                    status: ContainerStatus::Running,
                    team_id: team.id,
                    config_name: name.to_string(),
                    storage_pool: "team".to_string(),
                    node_name: "pve1".to_string(),
                    last_updated: Utc::now(),
                    created_at: Utc::now(),
                })
                .unwrap();
        }

        team.container_ids = vec![web_ctid, db_ctid];
        self.store.put_team(&team).unwrap();

        self.store
            .put_competition(&Competition {
                system_id: "demo".to_string(),
                name: "Demo Comp".to_string(),
                description: String::new(),
                host: "UNH".to_string(),
                is_private: false,
                allowed_groups: Vec::new(),
                created_at: Utc::now(),
                package_path: self.package_dir.display().to_string(),
                setup_public_folder: "public".to_string(),
                network_cidr: "10.0.0.0/16".to_string(),
                restrictions: ContainerRestrictions {
                    hostname_prefix: "koth-demo".to_string(),
                    root_password: "hunter2".to_string(),
                    ..ContainerRestrictions::default()
                },
                ssh_pub_key_path: String::new(),
                ssh_priv_key_path: String::new(),
                team_ids: vec![team.id],
                container_ids: vec![web_ctid, db_ctid],
                scoring_active: true,
            })
            .unwrap();

        (team, web_ctid, db_ctid)
    }

    async fn create_running_container(&self, hostname: &str) -> Ctid {
        use koth_hypervisor::HypervisorClient;
        let ctid = self.hypervisor.next_ctid().await.unwrap();
        self.hypervisor
            .create_container(
                "pve1",
                ctid,
                &koth_hypervisor::CtCreateSpec {
                    hostname: hostname.to_string(),
                    ..Default::default()
                }
                .to_options(),
            )
            .await
            .unwrap();
        self.hypervisor.start_container(ctid).await.unwrap();
        ctid
    }

    fn cleanup(&self) {
        let _ = std::fs::remove_dir_all(&self.storage);
    }
}

#[tokio::test]
async fn pass_scores_all_containers_and_accumulates() {
    let fixture = Fixture::new("accumulate");
    let (team, web, db) = fixture.seed_competition().await;

    fixture
        .hypervisor
        .script_exec(web, r#"{"http_200": true, "tls": false}"#, "", 0)
        .await;
    fixture
        .hypervisor
        .script_exec(db, r#"{"checks": {"tcp_3306": true}}"#, "", 0)
        .await;

    fixture.engine.run_pass().await;

    // web: +10 (pass) + -2 (reported fail) = 8; db: +8. Total 16.
    let scored = fixture.store.get_team(team.id).unwrap().unwrap();
    assert_eq!(scored.score, 16);

    let rows = fixture.store.list_team_results(team.id).unwrap();
    assert_eq!(rows.len(), 3);
    let http = rows.iter().find(|r| r.check_id == "http_200").unwrap();
    assert!(http.passed);
    let tls = rows.iter().find(|r| r.check_id == "tls").unwrap();
    assert!(!tls.passed);

    // A second identical pass adds the same delta again (cumulative).
    fixture
        .hypervisor
        .script_exec(web, r#"{"http_200": true, "tls": false}"#, "", 0)
        .await;
    fixture
        .hypervisor
        .script_exec(db, r#"{"checks": {"tcp_3306": true}}"#, "", 0)
        .await;
    fixture.engine.run_pass().await;

    let rescored = fixture.store.get_team(team.id).unwrap().unwrap();
    assert_eq!(rescored.score, 32);

    let rows_again = fixture.store.list_team_results(team.id).unwrap();
    assert_eq!(rows_again.len(), 3);
    for (before, after) in rows.iter().zip(&rows_again) {
        assert_eq!(before.check_id, after.check_id);
        assert_eq!(before.passed, after.passed);
    }
    fixture.cleanup();
}

#[tokio::test]
async fn unreported_checks_earn_fail_points() {
    let fixture = Fixture::new("failpoints");
    let (team, web, db) = fixture.seed_competition().await;

    // web script fails outright, db reports an unknown check id.
    fixture.hypervisor.script_exec(web, "", "boom", 1).await;
    fixture
        .hypervisor
        .script_exec(db, r#"{"unknown_check": true}"#, "", 0)
        .await;

    fixture.engine.run_pass().await;

    // web: -5 + -2; db: -4. Total -11.
    let scored = fixture.store.get_team(team.id).unwrap().unwrap();
    assert_eq!(scored.score, -11);

    let rows = fixture.store.list_team_results(team.id).unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| !r.passed));
    fixture.cleanup();
}

#[tokio::test]
async fn redeploying_containers_are_skipped() {
    let fixture = Fixture::new("redeploy");
    let (team, web, db) = fixture.seed_competition().await;

    let mut record = fixture.store.get_container(db).unwrap().unwrap();
    record.status = ContainerStatus::Redeploying;
    fixture.store.put_container(&record).unwrap();

    fixture
        .hypervisor
        .script_exec(web, r#"{"http_200": true, "tls": true}"#, "", 0)
        .await;

    fixture.engine.run_pass().await;

    // Only the web container produced rows this pass.
    let rows = fixture.store.list_team_results(team.id).unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.container_name == "web"));

    // web scored normally: +10 +5.
    let scored = fixture.store.get_team(team.id).unwrap().unwrap();
    assert_eq!(scored.score, 15);
    fixture.cleanup();
}

#[tokio::test]
async fn inactive_competitions_are_not_scored() {
    let fixture = Fixture::new("inactive");
    let (team, _, _) = fixture.seed_competition().await;

    let mut comp = fixture.store.get_competition("demo").unwrap().unwrap();
    comp.scoring_active = false;
    fixture.store.put_competition(&comp).unwrap();

    fixture.engine.run_pass().await;

    let scored = fixture.store.get_team(team.id).unwrap().unwrap();
    assert_eq!(scored.score, 0);
    assert!(fixture.store.list_team_results(team.id).unwrap().is_empty());
    fixture.cleanup();
}

#[tokio::test]
async fn config_falls_back_to_stored_package_bytes() {
    let fixture = Fixture::new("fallback");
    let (team, web, db) = fixture.seed_competition().await;

    // Remove the on-disk config; persist the bytes with the package record.
    std::fs::remove_file(fixture.package_dir.join("config.json")).unwrap();
    fixture
        .store
        .put_package(&koth_state::CompetitionPackage {
            competition_id: "demo".to_string(),
            competition_name: "Demo Comp".to_string(),
            original_filename: "demo.zip".to_string(),
            storage_path: fixture.package_dir.display().to_string(),
            config_json: PACKAGE_CONFIG.as_bytes().to_vec(),
            attachment_count: 0,
            created_at: Utc::now(),
        })
        .unwrap();

    fixture
        .hypervisor
        .script_exec(web, r#"{"http_200": true, "tls": true}"#, "", 0)
        .await;
    fixture
        .hypervisor
        .script_exec(db, r#"{"tcp_3306": false}"#, "", 0)
        .await;

    fixture.engine.run_pass().await;

    // web +15; db reported false → -4. Total 11.
    let scored = fixture.store.get_team(team.id).unwrap().unwrap();
    assert_eq!(scored.score, 11);
    fixture.cleanup();
}
