//! The scoring engine: periodic passes over active competitions.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ipnet::Ipv4Net;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use koth_auth::AccessTokenStore;
use koth_core::config::Config;
use koth_core::sanitize::{sanitize_container_name, summarize_script_output};
use koth_core::spec::{CompetitionConfig, TeamContainerConfig};
use koth_core::urls;
use koth_hypervisor::HypervisorAdapter;
use koth_net::NetworkPlanner;
use koth_provision::{build_script_env, build_team_network, TeamNetwork};
use koth_ssh::build_script_command;
use koth_state::{Competition, ContainerStatus, ScoreResult, StateStore, Team, TeamId};

use crate::error::{ScoringError, ScoringResult};
use crate::payload::parse_check_payload;

/// Cadence of scoring passes.
pub const SCORING_INTERVAL: Duration = Duration::from_secs(60);
/// Lifetime of the token issued for one container's scoring scripts.
const SCORING_TOKEN_TTL: Duration = Duration::from_secs(5 * 60);
/// Console-exec retry budget per scoring script.
const EXEC_RETRIES: u32 = 2;

/// Outcome of every check on one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerScore {
    pub name: String,
    pub order: u32,
    pub checks: Vec<CheckScore>,
}

/// Outcome of one check.
#[derive(Debug, Clone)]
pub struct CheckScore {
    pub id: String,
    pub name: String,
    pub order: u32,
    pub pass_points: i64,
    pub fail_points: i64,
    pub passed: bool,
}

/// The periodic scoring engine.
pub struct ScoringEngine {
    store: StateStore,
    hypervisor: Arc<HypervisorAdapter>,
    tokens: Arc<AccessTokenStore>,
    config: Arc<Config>,
    planner: NetworkPlanner,
}

impl ScoringEngine {
    pub fn new(
        store: StateStore,
        hypervisor: Arc<HypervisorAdapter>,
        tokens: Arc<AccessTokenStore>,
        config: Arc<Config>,
    ) -> ScoringResult<Self> {
        let pool = config
            .network
            .validated_pool()
            .map_err(|e| ScoringError::NetworkInvalid {
                id: "<config>".to_string(),
                detail: e.to_string(),
            })?;
        let planner = NetworkPlanner::new(
            pool,
            config.network.competition_prefix,
            config.network.team_prefix,
        )?;

        Ok(Self {
            store,
            hypervisor,
            tokens,
            config,
            planner,
        })
    }

    /// Run scoring passes until the shutdown signal flips.
    pub async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = SCORING_INTERVAL.as_secs(), "scoring loop started");
        self.run_pass().await;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(SCORING_INTERVAL) => {
                    self.run_pass().await;
                }
                _ = shutdown.changed() => {
                    info!("scoring loop shutting down");
                    return;
                }
            }
        }
    }

    /// One pass over every competition with scoring enabled.
    ///
    /// Competitions are independent — one failing pass is logged and the
    /// others continue. Team scores are cumulative: the pass adds each
    /// team's delta to its running total.
    pub async fn run_pass(self: &Arc<Self>) {
        let comps = match self.store.list_competitions() {
            Ok(comps) => comps,
            Err(e) => {
                error!(error = %e, "failed to load competitions for scoring");
                return;
            }
        };

        let mut handles = Vec::new();
        for comp in comps.into_iter().filter(|c| c.scoring_active) {
            let engine = self.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = engine.score_competition(&comp).await {
                    error!(competition = %comp.system_id, error = %e, "scoring failed");
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Reload a competition's definition: prefer the on-disk package
    /// config, fall back to the bytes persisted with the package record.
    fn load_competition_definition(&self, comp: &Competition) -> ScoringResult<CompetitionConfig> {
        if !comp.package_path.is_empty() {
            let config_path = Path::new(&comp.package_path).join("config.json");
            match std::fs::read(&config_path) {
                Ok(bytes) => return Ok(serde_json::from_slice(&bytes)?),
                Err(e) => {
                    warn!(
                        competition = %comp.system_id,
                        path = %config_path.display(),
                        error = %e,
                        "failed to read package config; trying stored bytes"
                    );
                }
            }
        }

        let package = self
            .store
            .get_package(&comp.system_id)?
            .ok_or_else(|| ScoringError::PackageMissing(comp.system_id.clone()))?;
        Ok(serde_json::from_slice(&package.config_json)?)
    }

    async fn score_competition(self: &Arc<Self>, comp: &Competition) -> ScoringResult<()> {
        if !comp.scoring_active {
            return Ok(());
        }

        let definition = self.load_competition_definition(comp)?;
        if definition.team_container_configs.is_empty() || comp.team_ids.is_empty() {
            return Ok(());
        }

        let comp_net: Ipv4Net =
            comp.network_cidr
                .parse()
                .map_err(|e| ScoringError::NetworkInvalid {
                    id: comp.system_id.clone(),
                    detail: format!("{e}"),
                })?;

        let base_url = self.config.external_base_url();
        let public_folder_url = urls::join_url(
            &urls::competition_public_base(&base_url, &comp.system_id),
            &comp.setup_public_folder,
        );
        let artifact_base = urls::competition_artifact_base(&base_url, &comp.system_id);

        let mut handles = Vec::new();
        for (team_index, &team_id) in comp.team_ids.iter().enumerate() {
            let engine = self.clone();
            let comp = comp.clone();
            let definition = definition.clone();
            let public_folder_url = public_folder_url.clone();
            let artifact_base = artifact_base.clone();

            handles.push(tokio::spawn(async move {
                engine
                    .score_team_task(
                        &comp,
                        &definition,
                        comp_net,
                        team_index as u32,
                        team_id,
                        &public_folder_url,
                        &artifact_base,
                    )
                    .await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn score_team_task(
        self: &Arc<Self>,
        comp: &Competition,
        definition: &CompetitionConfig,
        comp_net: Ipv4Net,
        team_index: u32,
        team_id: TeamId,
        public_folder_url: &str,
        artifact_base: &str,
    ) {
        let team = match self.store.get_team(team_id) {
            Ok(Some(team)) => team,
            Ok(None) => return,
            Err(e) => {
                error!(team_id, error = %e, "failed to load team for scoring");
                return;
            }
        };

        let network = match build_team_network(
            &self.planner,
            comp_net,
            team_index,
            &definition.team_container_configs,
        ) {
            Ok(network) => network,
            Err(e) => {
                error!(
                    competition = %comp.system_id,
                    team_id,
                    error = %e,
                    "failed to build team network for scoring"
                );
                return;
            }
        };

        let (delta, results) = self
            .score_team(
                comp,
                &team,
                team_index,
                &definition.team_container_configs,
                &network,
                public_folder_url,
                artifact_base,
            )
            .await;

        self.persist_results(&team, delta, results);
    }

    /// Score every container a team runs, in parallel.
    #[allow(clippy::too_many_arguments)]
    async fn score_team(
        self: &Arc<Self>,
        comp: &Competition,
        team: &Team,
        team_index: u32,
        configs: &[TeamContainerConfig],
        network: &TeamNetwork,
        public_folder_url: &str,
        artifact_base: &str,
    ) -> (i64, Vec<ContainerScore>) {
        let mut handles = Vec::new();

        for (order, container_cfg) in configs.iter().enumerate() {
            let sanitized = sanitize_container_name(&container_cfg.name);
            let Some(ip_address) = network.ips_by_name.get(&sanitized).cloned() else {
                continue;
            };

            // Containers mid-redeploy are skipped entirely this pass.
            match self.store.find_container_for_team(team.id, &container_cfg.name) {
                Ok(Some(record)) if record.status == ContainerStatus::Redeploying => {
                    debug!(
                        team_id = team.id,
                        container = %container_cfg.name,
                        "skipping scoring while redeploying"
                    );
                    continue;
                }
                Err(e) => {
                    error!(team_id = team.id, container = %container_cfg.name, error = %e,
                        "failed to fetch container status");
                }
                _ => {}
            }

            let engine = self.clone();
            let comp = comp.clone();
            let team = team.clone();
            let container_cfg = container_cfg.clone();
            let network = network.clone();
            let public_folder_url = public_folder_url.to_string();
            let artifact_base = artifact_base.to_string();
            let hostname = format!(
                "{}-team-{}-{}",
                comp.restrictions.hostname_prefix,
                team_index + 1,
                container_cfg.name
            );

            handles.push(tokio::spawn(async move {
                engine
                    .score_container(
                        &comp,
                        &team,
                        &container_cfg,
                        order as u32,
                        &hostname,
                        &ip_address,
                        &network,
                        &public_folder_url,
                        &artifact_base,
                    )
                    .await
            }));
        }

        let mut total = 0i64;
        let mut results = Vec::new();
        for handle in handles {
            if let Ok((score, detail)) = handle.await {
                total += score;
                results.push(detail);
            }
        }
        (total, results)
    }

    /// Run one container's scoring scripts and apply the arithmetic.
    #[allow(clippy::too_many_arguments)]
    async fn score_container(
        self: &Arc<Self>,
        comp: &Competition,
        team: &Team,
        container_cfg: &TeamContainerConfig,
        order: u32,
        hostname: &str,
        ip_address: &str,
        network: &TeamNetwork,
        public_folder_url: &str,
        artifact_base: &str,
    ) -> (i64, ContainerScore) {
        let mut result = ContainerScore {
            name: container_cfg.name.clone(),
            order,
            checks: Vec::new(),
        };

        // Declared checks, first declaration winning on duplicate ids.
        let mut schema_index: HashMap<String, usize> = HashMap::new();
        for (index, check) in container_cfg.scoring_schema.iter().enumerate() {
            let id = check.id.trim().to_string();
            if id.is_empty() {
                continue;
            }
            if schema_index.contains_key(&id) {
                warn!(container = %hostname, check = %id, "duplicate scoring check; ignoring duplicate entry");
                continue;
            }
            schema_index.insert(id.clone(), result.checks.len());
            result.checks.push(CheckScore {
                id,
                name: check.name.clone(),
                order: index as u32,
                pass_points: check.pass_points,
                fail_points: check.fail_points,
                passed: false,
            });
        }
        if result.checks.is_empty() {
            return (0, result);
        }

        let record = match self.store.find_container_for_team(team.id, &container_cfg.name) {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(container = %hostname, "container not provisioned; treating checks as failed");
                return (0, result);
            }
            Err(e) => {
                error!(container = %hostname, error = %e, "failed to load container record");
                return (0, result);
            }
        };

        if let Err(e) = self.hypervisor.resolve_container(record.ctid).await {
            error!(container = %hostname, ctid = record.ctid, error = %e,
                "failed to resolve container on the hypervisor");
            return (0, result);
        }

        let mut reported: HashSet<String> = HashSet::new();

        if !container_cfg.scoring_script.is_empty() {
            let mut envs = build_script_env(
                &comp.system_id,
                team.id,
                hostname,
                ip_address,
                public_folder_url,
                network,
            );
            let token = self
                .tokens
                .issue(&comp.system_id, SCORING_TOKEN_TTL)
                .await;
            envs.insert("KOTH_ACCESS_TOKEN".to_string(), token.clone());

            for script in &container_cfg.scoring_script {
                let script = script.trim();
                if script.is_empty() {
                    continue;
                }

                let script_url = urls::join_url(artifact_base, script);
                let command = build_script_command(&script_url, &token, &envs);

                let output = match self
                    .hypervisor
                    .raw_execute_with_retries(
                        record.ctid,
                        "root",
                        &comp.restrictions.root_password,
                        &command,
                        EXEC_RETRIES,
                    )
                    .await
                {
                    Ok(output) => output,
                    Err(e) => {
                        error!(container = %hostname, script, error = %e,
                            "failed to execute scoring script");
                        continue;
                    }
                };

                if output.exit_code != 0 {
                    error!(
                        container = %hostname,
                        script,
                        exit_code = output.exit_code,
                        stdout = %summarize_script_output(&output.stdout),
                        stderr = %summarize_script_output(&output.stderr),
                        "scoring script exited nonzero"
                    );
                    continue;
                }

                let payload = match parse_check_payload(&output.stdout) {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!(
                            container = %hostname,
                            script,
                            error = %e,
                            stdout = %summarize_script_output(&output.stdout),
                            "invalid scoring payload"
                        );
                        continue;
                    }
                };

                for (raw_id, passed) in payload {
                    let id = raw_id.trim().to_string();
                    if id.is_empty() {
                        continue;
                    }
                    let Some(&index) = schema_index.get(&id) else {
                        debug!(container = %hostname, script, check = %id,
                            "scoring script reported unknown check; ignoring");
                        continue;
                    };
                    if !reported.insert(id) {
                        debug!(container = %hostname, script,
                            "duplicate check report; keeping first result");
                        continue;
                    }
                    result.checks[index].passed = passed;
                }
            }

            self.tokens.revoke(&token).await;
        }

        let mut total = 0i64;
        for check in &result.checks {
            if reported.contains(&check.id) && check.passed {
                total += check.pass_points;
            } else {
                total += check.fail_points;
            }
        }

        (total, result)
    }

    /// Replace the team's score rows and apply the cumulative delta.
    fn persist_results(&self, team: &Team, delta: i64, containers: Vec<ContainerScore>) {
        let now = Utc::now();

        let rows: Vec<ScoreResult> = containers
            .iter()
            .flat_map(|container| {
                container.checks.iter().map(|check| ScoreResult {
                    team_id: team.id,
                    container_name: container.name.clone(),
                    container_order: container.order,
                    check_id: check.id.clone(),
                    check_name: check.name.clone(),
                    check_order: check.order,
                    pass_points: check.pass_points,
                    fail_points: check.fail_points,
                    passed: check.passed,
                    updated_at: now,
                })
            })
            .collect();

        if let Err(e) = self.store.replace_team_results(team.id, &rows) {
            error!(team_id = team.id, error = %e, "failed to persist score results");
        }

        match self.store.get_team(team.id) {
            Ok(Some(mut fresh)) => {
                fresh.score += delta;
                fresh.last_updated = now;
                if let Err(e) = self.store.put_team(&fresh) {
                    error!(team_id = team.id, error = %e, "failed to update team score");
                }
            }
            Ok(None) => {}
            Err(e) => error!(team_id = team.id, error = %e, "failed to reload team"),
        }
    }
}
