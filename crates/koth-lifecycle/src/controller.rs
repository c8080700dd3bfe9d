//! Redeploy, teardown and bulk power actions.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ipnet::Ipv4Net;
use tracing::{info, warn};

use koth_auth::AccessTokenStore;
use koth_core::config::Config;
use koth_core::sanitize::summarize_script_output;
use koth_core::spec::{CompetitionConfig, TeamContainerConfig};
use koth_core::urls;
use koth_hypervisor::{BulkAction, CtCreateSpec, Ctid, HypervisorAdapter};
use koth_net::NetworkPlanner;
use koth_provision::{build_script_env, build_team_network, TeamNetwork};
use koth_ssh::{
    build_script_command, connect_once_ready_with_retry, set_envs, SshAuth, SshClient,
};
use koth_state::{Competition, ContainerRecord, ContainerStatus, StateStore, Team};
use koth_stream::JobLogger;

use crate::error::{ErrorList, LifecycleError, LifecycleResult};

/// SSH dial retry budget during redeploy.
const SSH_RETRIES: u32 = 5;
/// Token lifetime covering a redeployed container's setup scripts.
const SETUP_TOKEN_TTL: Duration = Duration::from_secs(30 * 60);

/// Bulk power verbs accepted by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Start,
    Stop,
}

/// The lifecycle controller.
pub struct LifecycleController {
    store: StateStore,
    hypervisor: Arc<HypervisorAdapter>,
    ssh: Arc<dyn SshClient>,
    tokens: Arc<AccessTokenStore>,
    config: Arc<Config>,
    planner: NetworkPlanner,
}

impl LifecycleController {
    pub fn new(
        store: StateStore,
        hypervisor: Arc<HypervisorAdapter>,
        ssh: Arc<dyn SshClient>,
        tokens: Arc<AccessTokenStore>,
        config: Arc<Config>,
    ) -> LifecycleResult<Self> {
        let pool = config
            .network
            .validated_pool()
            .map_err(|e| LifecycleError::NetworkInvalid {
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
            ssh,
            tokens,
            config,
            planner,
        })
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn hypervisor(&self) -> &Arc<HypervisorAdapter> {
        &self.hypervisor
    }

    // ── Redeploy ───────────────────────────────────────────────────

    /// Mark records `redeploying` so scoring skips them.
    pub fn mark_redeploying(&self, ids: &[Ctid]) {
        let now = Utc::now();
        for &id in ids {
            if let Ok(Some(mut record)) = self.store.get_container(id) {
                record.status = ContainerStatus::Redeploying;
                record.last_updated = now;
                if let Err(e) = self.store.put_container(&record) {
                    warn!(ctid = id, error = %e, "failed to mark container redeploying");
                }
            }
        }
    }

    /// Delete and rebuild the requested containers one at a time, using
    /// the original competition plan and the recorded CTIDs and IPs.
    pub async fn redeploy_containers(
        &self,
        ids: &[Ctid],
        log: &dyn JobLogger,
        start_after: bool,
    ) -> LifecycleResult<()> {
        let normalized = normalize_ids(ids);
        if normalized.is_empty() {
            return Err(LifecycleError::NoIds);
        }

        self.mark_redeploying(&normalized);

        for &id in &normalized {
            log.status(&format!("Redeploying container {id}..."));
            if let Err(source) = self.redeploy_container(id, log, start_after).await {
                return Err(LifecycleError::Container {
                    ctid: id,
                    source: Box::new(source),
                });
            }
            log.success(&format!("Container {id} redeployed successfully."));
        }

        Ok(())
    }

    async fn redeploy_container(
        &self,
        id: Ctid,
        log: &dyn JobLogger,
        start_after: bool,
    ) -> LifecycleResult<()> {
        let mut record = self
            .store
            .get_container(id)?
            .ok_or(LifecycleError::ContainerNotFound(id))?;

        let comp = self.find_competition_for_container(id)?;
        let definition = self.load_competition_definition(&comp)?;
        if definition.team_container_configs.is_empty() {
            return Err(LifecycleError::ConfigMismatch(id));
        }

        let (team, team_index) = self.resolve_team_for_container(&comp, &mut record)?;
        let (container_cfg, _) = resolve_container_config(&definition.team_container_configs, &record)
            .ok_or(LifecycleError::ConfigMismatch(id))?;

        let public_key = read_key_file(&comp.ssh_pub_key_path, &comp.system_id)?;
        let private_key = read_key_file(&comp.ssh_priv_key_path, &comp.system_id)?;

        if record.ip_address.trim().is_empty() {
            return Err(LifecycleError::ConfigMismatch(id));
        }

        let comp_net: Ipv4Net =
            comp.network_cidr
                .parse()
                .map_err(|e| LifecycleError::NetworkInvalid {
                    id: comp.system_id.clone(),
                    detail: format!("{e}"),
                })?;
        let network = build_team_network(
            &self.planner,
            comp_net,
            team_index,
            &definition.team_container_configs,
        )?;

        let hostname = format!(
            "{}-team-{}-{}",
            comp.restrictions.hostname_prefix,
            team_index + 1,
            container_cfg.name
        );
        let spec = CtCreateSpec {
            template_path: comp.restrictions.template.clone(),
            storage_pool: comp.restrictions.storage_pool.clone(),
            hostname: hostname.clone(),
            root_password: comp.restrictions.root_password.clone(),
            root_ssh_public_key: public_key.trim().to_string(),
            storage_size_gb: comp.restrictions.storage_gb,
            memory_mb: comp.restrictions.memory_mb,
            cores: comp.restrictions.cores,
            gateway_ipv4: comp.restrictions.gateway_ipv4.clone(),
            ipv4_address: record.ip_address.clone(),
            cidr_block: comp.restrictions.container_prefix,
            nameserver: comp.restrictions.nameserver.clone(),
            search_domain: comp.restrictions.search_domain.clone(),
        };

        // Prefer the recorded node; fall back to rotation.
        let node = self.hypervisor.node_or_next(&record.node_name).await?;

        // Out with the old.
        if self.hypervisor.container_exists(id).await? {
            let _ = self.hypervisor.stop_container(id).await;
            self.hypervisor.delete_container(id).await?;
        }

        let created = self
            .hypervisor
            .create_container_with_id(&node, &spec, id)
            .await?;

        // From here on, a failure must not leave the fresh container
        // behind.
        let bootstrap = self
            .bootstrap_redeployed(&comp, &team, &container_cfg, &network, id, &spec, &private_key, log)
            .await;

        if let Err(error) = bootstrap {
            log.error(&format!(
                "Redeploy of container {id} failed; cleaning up the new container"
            ));
            if let Err(e) = self.hypervisor.stop_container(id).await {
                log.error(&format!("Failed to stop container {id} after failed redeploy: {e}"));
            }
            if let Err(e) = self.hypervisor.delete_container(id).await {
                log.error(&format!("Failed to clean up container {id} after failed redeploy: {e}"));
            }
            return Err(error);
        }

        // Record refresh: same CTID, fresh placement metadata.
        record.node_name = created.node;
        record.storage_pool = spec.storage_pool.clone();
        record.status = ContainerStatus::Stopped;
        record.team_id = team.id;
        record.config_name = container_cfg.name.trim().to_string();
        record.last_updated = Utc::now();
        self.store.put_container(&record)?;

        let mut team = team;
        team.last_updated = Utc::now();
        self.store.put_team(&team)?;

        if start_after {
            self.hypervisor.start_container(id).await?;
            record.status = ContainerStatus::Running;
            record.last_updated = Utc::now();
            self.store.put_container(&record)?;
        }

        info!(ctid = id, hostname = %hostname, start_after, "container redeployed");
        Ok(())
    }

    /// Start, bootstrap and stop a freshly recreated container.
    #[allow(clippy::too_many_arguments)]
    async fn bootstrap_redeployed(
        &self,
        comp: &Competition,
        team: &Team,
        container_cfg: &TeamContainerConfig,
        network: &TeamNetwork,
        ctid: Ctid,
        spec: &CtCreateSpec,
        private_key: &str,
        log: &dyn JobLogger,
    ) -> LifecycleResult<()> {
        self.hypervisor.start_container(ctid).await?;

        log.status(&format!(
            "Waiting for container {} ({}) to come online...",
            spec.hostname, spec.ipv4_address
        ));
        let mut session = connect_once_ready_with_retry(
            self.ssh.as_ref(),
            "root",
            &spec.ipv4_address,
            22,
            SSH_RETRIES,
            &[SshAuth::PrivateKey(private_key.to_string())],
        )
        .await?;

        let result = self
            .run_setup_scripts(comp, team, container_cfg, network, spec, session.as_mut(), log)
            .await;
        session.close().await;
        result?;

        self.hypervisor.stop_container(ctid).await?;
        Ok(())
    }

    /// Run the config's setup scripts, logging the environment (the
    /// redeploy path always logs env for operator debugging).
    #[allow(clippy::too_many_arguments)]
    async fn run_setup_scripts(
        &self,
        comp: &Competition,
        team: &Team,
        container_cfg: &TeamContainerConfig,
        network: &TeamNetwork,
        spec: &CtCreateSpec,
        session: &mut dyn koth_ssh::SshSession,
        log: &dyn JobLogger,
    ) -> LifecycleResult<()> {
        if container_cfg.setup_script.is_empty() {
            log.status(&format!(
                "No setup scripts defined for {}; skipping.",
                spec.hostname
            ));
            return Ok(());
        }

        let base_url = self.config.external_base_url();
        let public_folder_url = urls::join_url(
            &urls::competition_public_base(&base_url, &comp.system_id),
            &comp.setup_public_folder,
        );
        let artifact_base = urls::competition_artifact_base(&base_url, &comp.system_id);

        let mut envs = build_script_env(
            &comp.system_id,
            team.id,
            &spec.hostname,
            &spec.ipv4_address,
            &public_folder_url,
            network,
        );
        log.status(&format!("Script environment: {}", set_envs(&envs)));

        let token = self.tokens.issue(&comp.system_id, SETUP_TOKEN_TTL).await;
        envs.insert("KOTH_ACCESS_TOKEN".to_string(), token.clone());

        let result = async {
            for script in &container_cfg.setup_script {
                let script_url = urls::join_url(&artifact_base, script);
                log.status(&format!(
                    "Running setup script {script} on container {}...",
                    spec.hostname
                ));

                let command = build_script_command(&script_url, &token, &envs);
                let output = session.run(&command).await?;
                log.status(&format!(
                    "Setup script {script} exited with {}. Output: {}",
                    output.exit_code,
                    summarize_script_output(&output.output)
                ));

                if output.exit_code != 0 {
                    return Err(LifecycleError::SetupScriptFailed {
                        script: script.clone(),
                        exit_code: output.exit_code,
                    });
                }
                session.reset().await?;
            }
            Ok(())
        }
        .await;

        self.tokens.revoke(&token).await;
        result
    }

    fn find_competition_for_container(&self, id: Ctid) -> LifecycleResult<Competition> {
        self.store
            .list_competitions()?
            .into_iter()
            .find(|comp| comp.container_ids.contains(&id))
            .ok_or(LifecycleError::CompetitionNotFound(id))
    }

    /// Resolve the owning team and its index within the competition.
    fn resolve_team_for_container(
        &self,
        comp: &Competition,
        record: &mut ContainerRecord,
    ) -> LifecycleResult<(Team, u32)> {
        if record.team_id != 0 {
            if let Some(team) = self.store.get_team(record.team_id)? {
                if team.container_ids.contains(&record.ctid) {
                    if let Some(index) = comp.team_ids.iter().position(|&t| t == team.id) {
                        return Ok((team, index as u32));
                    }
                }
            }
        }

        for (index, &team_id) in comp.team_ids.iter().enumerate() {
            let Some(team) = self.store.get_team(team_id)? else {
                continue;
            };
            if team.container_ids.contains(&record.ctid) {
                record.team_id = team.id;
                return Ok((team, index as u32));
            }
        }

        Err(LifecycleError::TeamNotFound(record.ctid))
    }

    fn load_competition_definition(
        &self,
        comp: &Competition,
    ) -> LifecycleResult<CompetitionConfig> {
        if !comp.package_path.is_empty() {
            let config_path = Path::new(&comp.package_path).join("config.json");
            if let Ok(bytes) = std::fs::read(&config_path) {
                return Ok(serde_json::from_slice(&bytes)?);
            }
        }

        let package = self
            .store
            .get_package(&comp.system_id)?
            .ok_or_else(|| LifecycleError::PackageMissing(comp.system_id.clone()))?;
        Ok(serde_json::from_slice(&package.config_json)?)
    }

    // ── Teardown ───────────────────────────────────────────────────

    /// Destroy a competition and everything it owns. Best-effort: every
    /// step runs even when earlier ones fail, and all failures come back
    /// joined.
    pub async fn teardown_competition(
        &self,
        comp: &Competition,
        log: &dyn JobLogger,
    ) -> LifecycleResult<()> {
        log.status(&format!("Destroying competition: {}", comp.name));
        let mut errors = ErrorList::new();

        if comp.container_ids.is_empty() {
            log.status("No containers recorded; skipping stop/delete.");
        } else {
            let retries = 1 + comp.container_ids.len() as u32 / 4;

            log.status("Stopping containers...");
            if let Err(e) = self
                .hypervisor
                .bulk_action_with_retries(BulkAction::Stop, &comp.container_ids, retries)
                .await
            {
                log.error(&format!("Failed to stop containers: {e}"));
                errors.push(e);
            }

            log.status("Deleting containers...");
            if let Err(e) = self
                .hypervisor
                .bulk_action_with_retries(BulkAction::Delete, &comp.container_ids, retries)
                .await
            {
                log.error(&format!("Failed to delete containers: {e}"));
                errors.push(e);
            }
        }

        for &ctid in &comp.container_ids {
            if let Err(e) = self.store.delete_container(ctid) {
                log.error(&format!("Failed to remove container record {ctid}: {e}"));
                errors.push(e);
            }
        }

        for &team_id in &comp.team_ids {
            if let Err(e) = self.store.delete_team(team_id) {
                log.error(&format!("Failed to remove team record {team_id}: {e}"));
                errors.push(e);
            }
            if let Err(e) = self.store.delete_team_results(team_id) {
                log.error(&format!("Failed to delete score results for team {team_id}: {e}"));
                errors.push(e);
            }
        }

        if let Err(e) = self.store.delete_competition(&comp.system_id) {
            log.error(&format!("Failed to delete competition record: {e}"));
            errors.push(e);
        }

        if !comp.system_id.is_empty() {
            let data_dir = Path::new(self.config.storage_base())
                .join("competitions")
                .join(&comp.system_id);
            if data_dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(&data_dir) {
                    log.error(&format!(
                        "Failed to remove competition data at {}: {e}",
                        data_dir.display()
                    ));
                    errors.push(e);
                } else {
                    log.status(&format!(
                        "Removed competition data directory {}",
                        data_dir.display()
                    ));
                }
            }
        }

        if !comp.package_path.is_empty() && Path::new(&comp.package_path).exists() {
            if let Err(e) = std::fs::remove_dir_all(&comp.package_path) {
                log.error(&format!(
                    "Failed to remove package directory {}: {e}",
                    comp.package_path
                ));
                errors.push(e);
            } else {
                log.status(&format!("Removed package directory {}", comp.package_path));
            }
        }

        match self.store.get_package(&comp.system_id) {
            Ok(Some(_)) => {
                if let Err(e) = self.store.delete_package(&comp.system_id) {
                    log.error(&format!("Failed to remove package record: {e}"));
                    errors.push(e);
                } else {
                    log.status(&format!("Removed package record for {}", comp.system_id));
                }
            }
            Ok(None) => {}
            Err(e) => {
                log.error(&format!("Failed to load package record: {e}"));
                errors.push(e);
            }
        }

        if errors.is_empty() {
            log.success(&format!("Competition {} torn down successfully.", comp.system_id));
        }
        errors.into_result()
    }

    // ── Power actions ──────────────────────────────────────────────

    /// Validate and dispatch a bulk power action, then refresh statuses.
    pub async fn bulk_power(&self, ids: &[Ctid], action: PowerAction) -> LifecycleResult<()> {
        let normalized = normalize_ids(ids);
        if normalized.is_empty() {
            return Err(LifecycleError::NoIds);
        }

        for &id in &normalized {
            if self.store.get_container(id)?.is_none() {
                return Err(LifecycleError::ContainerNotFound(id));
            }
        }

        let bulk = match action {
            PowerAction::Start => BulkAction::Start,
            PowerAction::Stop => BulkAction::Stop,
        };
        self.hypervisor
            .bulk_action_with_retries(bulk, &normalized, 2)
            .await?;

        self.refresh_statuses(Some(&normalized)).await
    }

    // ── Status reconciliation ──────────────────────────────────────

    /// Update recorded power states from the hypervisor. With `None`,
    /// every container referenced by any competition is refreshed.
    pub async fn refresh_statuses(&self, ids: Option<&[Ctid]>) -> LifecycleResult<()> {
        let targets = match ids {
            Some(ids) => normalize_ids(ids),
            None => {
                let mut all = Vec::new();
                for comp in self.store.list_competitions()? {
                    all.extend(comp.container_ids);
                }
                normalize_ids(&all)
            }
        };
        if targets.is_empty() {
            return Ok(());
        }

        let snapshot = self.hypervisor.get_containers(&targets).await?;
        let now = Utc::now();

        for &id in &targets {
            let Some(mut record) = self.store.get_container(id)? else {
                continue;
            };

            // Redeploys own the status until they finish.
            if record.status == ContainerStatus::Redeploying {
                continue;
            }

            let status = snapshot
                .iter()
                .find(|c| c.ctid == id)
                .map(|c| ContainerStatus::from_runtime(&c.status))
                .unwrap_or(ContainerStatus::Unknown);

            if record.status != status {
                record.status = status;
                record.last_updated = now;
                if let Err(e) = self.store.put_container(&record) {
                    warn!(ctid = id, error = %e, "failed to update container status");
                }
            }
        }

        Ok(())
    }
}

/// Deduplicate and drop non-positive ids, preserving order.
pub fn normalize_ids(ids: &[Ctid]) -> Vec<Ctid> {
    let mut seen = std::collections::HashSet::new();
    ids.iter()
        .copied()
        .filter(|&id| id > 0 && seen.insert(id))
        .collect()
}

fn read_key_file(path: &str, system_id: &str) -> LifecycleResult<String> {
    if path.trim().is_empty() {
        return Err(LifecycleError::MissingKeys(system_id.to_string()));
    }
    Ok(std::fs::read_to_string(path)?)
}

/// Match a record to its container config: by recorded name first, then
/// by the last octet of the recorded IP.
fn resolve_container_config(
    configs: &[TeamContainerConfig],
    record: &ContainerRecord,
) -> Option<(TeamContainerConfig, u32)> {
    let name = record.config_name.trim();
    if !name.is_empty() {
        if let Some((index, cfg)) = configs
            .iter()
            .enumerate()
            .find(|(_, cfg)| cfg.name.trim().eq_ignore_ascii_case(name))
        {
            return Some((cfg.clone(), index as u32));
        }
    }

    let last_octet = record
        .ip_address
        .trim()
        .parse::<std::net::Ipv4Addr>()
        .ok()
        .map(|ip| ip.octets()[3] as u32)?;
    configs
        .iter()
        .enumerate()
        .find(|(_, cfg)| cfg.last_octet_value == last_octet)
        .map(|(index, cfg)| (cfg.clone(), index as u32))
}
