//! The provisioning engine.
//!
//! Provisioning is all-or-nothing: every container plan runs in its own
//! task under a shared cancellation signal, and the first failure rolls
//! back everything that was created — hypervisor containers, records,
//! teams, the competition, its data directory and the package.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ipnet::Ipv4Net;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{info, warn};

use koth_auth::AccessTokenStore;
use koth_core::config::Config;
use koth_core::sanitize::{sanitize_container_name, summarize_script_output};
use koth_core::spec::CompetitionConfig;
use koth_core::urls;
use koth_hypervisor::{CtCreateSpec, Ctid, HypervisorAdapter};
use koth_net::NetworkPlanner;
use koth_ssh::{
    build_script_command, connect_once_ready_with_retry, create_keypair_with_bits,
    ensure_authorized_key, SshAuth, SshClient,
};
use koth_state::{
    Competition, ContainerRecord, ContainerRestrictions, ContainerStatus, StateStore, Team, TeamId,
};
use koth_stream::JobLogger;

use crate::error::{ProvisionError, ProvisionResult};
use crate::plan::{build_script_env, build_team_network, ContainerPlan, TeamNetwork};

/// Creation/start retry budget per container.
const CREATE_RETRIES: u32 = 3;
/// Fixed delay between create/start attempts.
const CREATE_RETRY_DELAY: Duration = Duration::from_secs(5);
/// SSH dial retry budget once the host answers pings.
const SSH_RETRIES: u32 = 5;
/// Token lifetime covering a container's setup scripts.
const SETUP_TOKEN_TTL: Duration = Duration::from_secs(30 * 60);

/// One container that made it onto the hypervisor.
#[derive(Debug, Clone)]
struct Provisioned {
    ctid: Ctid,
    team_id: TeamId,
    recorded: bool,
}

/// Accumulates everything that must be undone on failure.
#[derive(Default)]
struct RollbackContext {
    system_id: String,
    data_dir: Option<PathBuf>,
    competition_created: bool,
    team_ids: Vec<TeamId>,
    provisioned: Vec<Provisioned>,
}

/// The provisioning engine.
pub struct Provisioner {
    store: StateStore,
    hypervisor: Arc<HypervisorAdapter>,
    ssh: Arc<dyn SshClient>,
    tokens: Arc<AccessTokenStore>,
    config: Arc<Config>,
    planner: NetworkPlanner,
    rsa_bits: usize,
}

impl Provisioner {
    pub fn new(
        store: StateStore,
        hypervisor: Arc<HypervisorAdapter>,
        ssh: Arc<dyn SshClient>,
        tokens: Arc<AccessTokenStore>,
        config: Arc<Config>,
    ) -> ProvisionResult<Self> {
        let pool = config
            .network
            .validated_pool()
            .map_err(|e| ProvisionError::Config(e.to_string()))?;
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
            rsa_bits: 4096,
        })
    }

    /// Override the bootstrap key size (smaller keys for test runs).
    pub fn with_rsa_bits(mut self, bits: usize) -> Self {
        self.rsa_bits = bits;
        self
    }

    pub fn planner(&self) -> &NetworkPlanner {
        &self.planner
    }

    /// Provision a competition from a validated package.
    ///
    /// On any failure the partially created fleet, records, data
    /// directory and package are removed before the error is returned.
    pub async fn create_competition(
        self: &Arc<Self>,
        request: &CompetitionConfig,
        package_path: &str,
        log: Arc<dyn JobLogger>,
    ) -> ProvisionResult<Competition> {
        let mut ctx = RollbackContext {
            system_id: request.competition_id.clone(),
            ..RollbackContext::default()
        };

        match self.create_inner(request, package_path, log.clone(), &mut ctx).await {
            Ok(comp) => Ok(comp),
            Err(error) => {
                log.error(&format!("provisioning failed: {error}"));
                self.rollback(&ctx, log.as_ref()).await;
                Err(error)
            }
        }
    }

    async fn create_inner(
        self: &Arc<Self>,
        request: &CompetitionConfig,
        package_path: &str,
        log: Arc<dyn JobLogger>,
        ctx: &mut RollbackContext,
    ) -> ProvisionResult<Competition> {
        log.status(&format!(
            "Creating new competition: {}",
            request.competition_name
        ));

        // 1. Data directories.
        log.status("Creating data directories...");
        let storage_root = PathBuf::from(self.config.storage_base());
        std::fs::create_dir_all(&storage_root)?;

        let data_dir = storage_root
            .join("competitions")
            .join(&request.competition_id);
        if data_dir.exists() {
            std::fs::remove_dir_all(&data_dir)?;
        }
        std::fs::create_dir_all(&data_dir)?;
        ctx.data_dir = Some(data_dir.clone());

        // 2. Package sanity.
        let package_root = PathBuf::from(package_path);
        if package_path.trim().is_empty() || !package_root.is_dir() {
            return Err(ProvisionError::PackageMissing(package_path.to_string()));
        }

        let public_folder = request.public_folder();
        let public_source = package_root.join(&public_folder);
        if !public_source.is_dir() {
            return Err(ProvisionError::PublicFolderMissing(
                public_source.display().to_string(),
            ));
        }

        // 3. Keys.
        log.status("Generating SSH keypair...");
        let ssh_dir = data_dir.join("ssh");
        let (public_key, private_key) = create_keypair_with_bits(&ssh_dir, self.rsa_bits)?;

        // 4. Network.
        log.status("Allocating network resources...");
        let used: Vec<Ipv4Net> = self
            .store
            .list_competitions()?
            .iter()
            .filter_map(|c| c.network_cidr.parse().ok())
            .collect();
        let comp_subnet = self.planner.allocate_competition_subnet(&used)?;

        let capacity = self.planner.max_teams_per_competition();
        if request.num_teams > capacity {
            return Err(ProvisionError::TooManyTeams {
                requested: request.num_teams,
                capacity,
            });
        }

        // 5. Provisional competition record.
        log.status("Creating competition record...");
        let mut comp = Competition {
            system_id: request.competition_id.clone(),
            name: request.competition_name.clone(),
            description: request.competition_description.clone(),
            host: request.competition_host.clone(),
            is_private: !request.privacy.public,
            allowed_groups: if request.privacy.public {
                Vec::new()
            } else {
                request.privacy.allowed_groups.clone()
            },
            created_at: Utc::now(),
            package_path: package_root.display().to_string(),
            setup_public_folder: public_folder.clone(),
            network_cidr: comp_subnet.to_string(),
            restrictions: ContainerRestrictions {
                hostname_prefix: format!("koth-{}", request.competition_id),
                root_password: request.container_specs.root_password.clone(),
                template: request.container_specs.template_path.clone(),
                storage_pool: request.container_specs.storage_pool.clone(),
                gateway_ipv4: request.container_specs.gateway_ipv4.clone(),
                nameserver: request.container_specs.nameserver_ipv4.clone(),
                search_domain: request.container_specs.search_domain.clone(),
                storage_gb: request.container_specs.storage_size_gb,
                memory_mb: request.container_specs.memory_mb,
                cores: request.container_specs.cores,
                container_prefix: request.container_specs.cidr_block,
            },
            ssh_pub_key_path: ssh_dir.join("id_rsa.pub").display().to_string(),
            ssh_priv_key_path: ssh_dir.join("id_rsa").display().to_string(),
            team_ids: Vec::new(),
            container_ids: Vec::new(),
            scoring_active: false,
        };
        self.store.put_competition(&comp)?;
        ctx.competition_created = true;

        // 6. Teams and container plans.
        let mut plans: Vec<ContainerPlan> = Vec::new();
        let mut networks: HashMap<TeamId, TeamNetwork> = HashMap::new();

        for team_index in 0..request.num_teams {
            let team_subnet = self.planner.team_subnet(comp_subnet, team_index)?;
            let mut team = Team {
                id: 0,
                name: format!("Team {}", team_index + 1),
                score: 0,
                network_cidr: team_subnet.to_string(),
                container_ids: Vec::new(),
                last_updated: Utc::now(),
                created_at: Utc::now(),
            };
            self.store.insert_team(&mut team)?;
            ctx.team_ids.push(team.id);
            comp.team_ids.push(team.id);

            let network = build_team_network(
                &self.planner,
                comp_subnet,
                team_index,
                &request.team_container_configs,
            )?;
            networks.insert(team.id, network.clone());

            for (order, container_cfg) in request.team_container_configs.iter().enumerate() {
                let team_base = self.planner.team_subnet_base(comp_subnet, team_index)?;
                let host_ip = self
                    .planner
                    .host_ip(team_base, container_cfg.last_octet_value)?;

                plans.push(ContainerPlan {
                    team_id: team.id,
                    team_index,
                    team_name: team.name.clone(),
                    config_name: container_cfg.name.clone(),
                    sanitized_name: sanitize_container_name(&container_cfg.name),
                    order: order as u32,
                    ip_address: host_ip.to_string(),
                    setup_scripts: container_cfg.setup_script.clone(),
                    spec: CtCreateSpec {
                        template_path: request.container_specs.template_path.clone(),
                        storage_pool: request.container_specs.storage_pool.clone(),
                        hostname: format!(
                            "{}-team-{}-{}",
                            comp.restrictions.hostname_prefix,
                            team_index + 1,
                            container_cfg.name
                        ),
                        root_password: request.container_specs.root_password.clone(),
                        root_ssh_public_key: public_key.trim().to_string(),
                        storage_size_gb: request.container_specs.storage_size_gb,
                        memory_mb: request.container_specs.memory_mb,
                        cores: request.container_specs.cores,
                        gateway_ipv4: request.container_specs.gateway_ipv4.clone(),
                        ipv4_address: host_ip.to_string(),
                        cidr_block: request.container_specs.cidr_block,
                        nameserver: request.container_specs.nameserver_ipv4.clone(),
                        search_domain: request.container_specs.search_domain.clone(),
                    },
                });
            }
        }
        self.store.put_competition(&comp)?;

        if plans.is_empty() {
            log.status("No team container configurations provided; skipping container provisioning.");
            log.success(&format!(
                "Successfully created competition: {}",
                request.competition_name
            ));
            return Ok(comp);
        }

        // 7. Concurrent provisioning.
        let base_url = self.config.external_base_url();
        let public_folder_url = urls::join_url(
            &urls::competition_public_base(&base_url, &comp.system_id),
            &comp.setup_public_folder,
        );
        let artifact_base = urls::competition_artifact_base(&base_url, &comp.system_id);

        let shared = Arc::new(WorkerShared {
            engine: self.clone(),
            system_id: comp.system_id.clone(),
            root_password: request.container_specs.root_password.clone(),
            public_key,
            private_key,
            public_folder_url,
            artifact_base,
            provisioned: Mutex::new(Vec::new()),
            team_locks: ctx
                .team_ids
                .iter()
                .map(|&id| (id, Mutex::new(())))
                .collect(),
            comp_lock: Mutex::new(()),
            log: log.clone(),
        });

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);
        let (err_tx, mut err_rx) = mpsc::channel::<ProvisionError>(plans.len());

        let mut handles = Vec::with_capacity(plans.len());
        for plan in plans {
            let shared = shared.clone();
            let network = networks.get(&plan.team_id).cloned().unwrap_or_default();
            let cancel_rx = cancel_rx.clone();
            let cancel_tx = cancel_tx.clone();
            let err_tx = err_tx.clone();

            handles.push(tokio::spawn(async move {
                if let Err(error) = provision_plan(&shared, &plan, &network, cancel_rx).await {
                    if !matches!(error, ProvisionError::Cancelled) {
                        shared.log.error(&format!(
                            "Failed to provision container {}: {error}",
                            plan.spec.hostname
                        ));
                        let _ = err_tx.try_send(error);
                    }
                    let _ = cancel_tx.send(true);
                }
            }));
        }
        drop(err_tx);

        for handle in handles {
            if let Err(join_error) = handle.await {
                let _ = cancel_tx.send(true);
                warn!(error = %join_error, "provisioning worker panicked");
                ctx.provisioned = shared.provisioned.lock().await.clone();
                return Err(ProvisionError::WorkerPanic(join_error.to_string()));
            }
        }
        ctx.provisioned = shared.provisioned.lock().await.clone();

        if let Ok(error) = err_rx.try_recv() {
            return Err(error);
        }

        // 8. Final record refresh.
        let comp = self
            .store
            .get_competition(&ctx.system_id)?
            .ok_or_else(|| koth_state::StateError::NotFound(ctx.system_id.clone()))?;

        log.success(&format!(
            "Successfully created competition: {}",
            request.competition_name
        ));
        info!(
            system_id = %comp.system_id,
            teams = comp.team_ids.len(),
            containers = comp.container_ids.len(),
            "competition provisioned"
        );
        Ok(comp)
    }

    /// Undo a failed provisioning run, newest container first.
    async fn rollback(&self, ctx: &RollbackContext, log: &dyn JobLogger) {
        for entry in ctx.provisioned.iter().rev() {
            log.error(&format!("Cleaning up container {} after failure...", entry.ctid));
            if let Err(e) = self.hypervisor.stop_container(entry.ctid).await {
                log.error(&format!("Failed to stop container {}: {e}", entry.ctid));
            }
            if let Err(e) = self.hypervisor.delete_container(entry.ctid).await {
                log.error(&format!("Failed to delete container {}: {e}", entry.ctid));
            }

            if entry.recorded {
                if let Err(e) = self.store.delete_container(entry.ctid) {
                    log.error(&format!("Failed to remove container record {}: {e}", entry.ctid));
                }
                if let Ok(Some(mut team)) = self.store.get_team(entry.team_id) {
                    team.container_ids.retain(|&id| id != entry.ctid);
                    team.last_updated = Utc::now();
                    if let Err(e) = self.store.put_team(&team) {
                        log.error(&format!(
                            "Failed to update team {} during cleanup: {e}",
                            team.id
                        ));
                    }
                }
            }
        }

        for &team_id in &ctx.team_ids {
            if let Err(e) = self.store.delete_team(team_id) {
                log.error(&format!("Failed to remove team record {team_id}: {e}"));
            }
        }

        if ctx.competition_created {
            if let Err(e) = self.store.delete_competition(&ctx.system_id) {
                log.error(&format!("Failed to remove competition record: {e}"));
            }
        }

        if let Some(data_dir) = &ctx.data_dir {
            if data_dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(data_dir) {
                    log.error(&format!(
                        "Failed to remove competition data at {}: {e}",
                        data_dir.display()
                    ));
                }
            }
        }

        // Remove the package as well so the competition id frees up.
        if let Ok(Some(package)) = self.store.get_package(&ctx.system_id) {
            if !package.storage_path.is_empty() {
                let _ = std::fs::remove_dir_all(&package.storage_path);
            }
            if let Err(e) = self.store.delete_package(&ctx.system_id) {
                log.error(&format!("Failed to remove package record: {e}"));
            }
        }
    }
}

/// Per-run state shared by every provisioning worker.
struct WorkerShared {
    engine: Arc<Provisioner>,
    system_id: String,
    root_password: String,
    public_key: String,
    private_key: String,
    public_folder_url: String,
    artifact_base: String,
    provisioned: Mutex<Vec<Provisioned>>,
    /// Serializes team-record mutation per team.
    team_locks: HashMap<TeamId, Mutex<()>>,
    /// Serializes competition-record mutation.
    comp_lock: Mutex<()>,
    log: Arc<dyn JobLogger>,
}

fn check_cancelled(cancel: &watch::Receiver<bool>) -> ProvisionResult<()> {
    if *cancel.borrow() {
        Err(ProvisionError::Cancelled)
    } else {
        Ok(())
    }
}

async fn retry_fixed<T, E, F, Fut>(retries: u32, delay: Duration, mut op: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= retries => return Err(e),
            Err(e) => {
                attempt += 1;
                warn!(attempt, retries, error = %e, "provisioning step failed; retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Provision one planned container end to end.
async fn provision_plan(
    shared: &WorkerShared,
    plan: &ContainerPlan,
    network: &TeamNetwork,
    cancel: watch::Receiver<bool>,
) -> ProvisionResult<()> {
    let engine = &shared.engine;
    let hostname = &plan.spec.hostname;

    check_cancelled(&cancel)?;
    shared.log.status(&format!(
        "Provisioning container {hostname} for {}...",
        plan.team_name
    ));

    let node = engine.hypervisor.next_node().await?;
    let created = retry_fixed(CREATE_RETRIES, CREATE_RETRY_DELAY, || {
        engine.hypervisor.create_container(&node, &plan.spec)
    })
    .await?;
    {
        let mut provisioned = shared.provisioned.lock().await;
        provisioned.push(Provisioned {
            ctid: created.ctid,
            team_id: plan.team_id,
            recorded: false,
        });
    }

    check_cancelled(&cancel)?;
    shared.log.status(&format!(
        "Container {hostname} created (CTID: {}). Starting...",
        created.ctid
    ));
    retry_fixed(CREATE_RETRIES, CREATE_RETRY_DELAY, || {
        engine.hypervisor.start_container(created.ctid)
    })
    .await?;

    check_cancelled(&cancel)?;
    shared.log.status(&format!(
        "Waiting for container {} ({}) to come online...",
        created.ctid, plan.ip_address
    ));

    // Password-first when the spec carries one, so the generated key can
    // be installed; always ends on a key-authenticated session.
    let mut auth_attempts: Vec<Vec<SshAuth>> = Vec::new();
    if !shared.root_password.is_empty() {
        auth_attempts.push(vec![
            SshAuth::Password(shared.root_password.clone()),
            SshAuth::KeyboardInteractive(shared.root_password.clone()),
        ]);
    }
    auth_attempts.push(vec![SshAuth::PrivateKey(shared.private_key.clone())]);

    let mut session = None;
    let mut connected_with_password = false;
    let mut last_error = None;
    for (index, methods) in auth_attempts.iter().enumerate() {
        check_cancelled(&cancel)?;
        match connect_once_ready_with_retry(
            engine.ssh.as_ref(),
            "root",
            &plan.ip_address,
            22,
            SSH_RETRIES,
            methods,
        )
        .await
        {
            Ok(s) => {
                session = Some(s);
                connected_with_password =
                    index == 0 && !shared.root_password.is_empty();
                break;
            }
            Err(e) => {
                shared
                    .log
                    .error(&format!("SSH attempt {} for {hostname} failed: {e}", index + 1));
                last_error = Some(e);
            }
        }
    }
    let mut session = match session {
        Some(s) => s,
        None => {
            return Err(last_error
                .map(ProvisionError::from)
                .unwrap_or(ProvisionError::Cancelled))
        }
    };

    if let Err(e) = ensure_authorized_key(session.as_mut(), &shared.public_key).await {
        session.close().await;
        return Err(e.into());
    }

    if connected_with_password {
        session.close().await;
        session = connect_once_ready_with_retry(
            engine.ssh.as_ref(),
            "root",
            &plan.ip_address,
            22,
            SSH_RETRIES,
            &[SshAuth::PrivateKey(shared.private_key.clone())],
        )
        .await?;
    }

    check_cancelled(&cancel)?;
    let script_result = run_setup_scripts(shared, plan, network, session.as_mut()).await;
    session.close().await;
    script_result?;

    check_cancelled(&cancel)?;
    record_provisioned_container(shared, plan, created.ctid, &created.node).await?;

    // Fleet starts powered off; the operator brings it up when the
    // competition goes live.
    engine.hypervisor.stop_container(created.ctid).await?;
    if let Some(mut record) = engine.store.get_container(created.ctid)? {
        record.status = ContainerStatus::Stopped;
        record.last_updated = Utc::now();
        engine.store.put_container(&record)?;
    }

    shared.log.status(&format!(
        "Container {hostname} (CTID: {}) provisioned successfully.",
        created.ctid
    ));
    Ok(())
}

async fn run_setup_scripts(
    shared: &WorkerShared,
    plan: &ContainerPlan,
    network: &TeamNetwork,
    session: &mut dyn koth_ssh::SshSession,
) -> ProvisionResult<()> {
    if plan.setup_scripts.is_empty() {
        shared.log.status(&format!(
            "No setup scripts defined for {}; skipping.",
            plan.spec.hostname
        ));
        return Ok(());
    }

    let mut envs = build_script_env(
        &shared.system_id,
        plan.team_id,
        &plan.spec.hostname,
        &plan.ip_address,
        &shared.public_folder_url,
        network,
    );
    let token = shared
        .engine
        .tokens
        .issue(&shared.system_id, SETUP_TOKEN_TTL)
        .await;
    envs.insert("KOTH_ACCESS_TOKEN".to_string(), token.clone());

    let result = async {
        for script in &plan.setup_scripts {
            let script_url = urls::join_url(&shared.artifact_base, script);
            shared.log.status(&format!(
                "Running setup script {script} on container {}...",
                plan.spec.hostname
            ));

            let command = build_script_command(&script_url, &token, &envs);
            let output = session.run(&command).await?;
            shared.log.status(&format!(
                "Setup script {script} exited with {}. Output: {}",
                output.exit_code,
                summarize_script_output(&output.output)
            ));

            if output.exit_code != 0 {
                return Err(ProvisionError::SetupScriptFailed {
                    script: script.clone(),
                    exit_code: output.exit_code,
                });
            }
            session.reset().await?;
        }
        Ok(())
    }
    .await;

    shared.engine.tokens.revoke(&token).await;
    result
}

/// Write the container record and link it into its team and competition.
async fn record_provisioned_container(
    shared: &WorkerShared,
    plan: &ContainerPlan,
    ctid: Ctid,
    node: &str,
) -> ProvisionResult<()> {
    let engine = &shared.engine;
    let now = Utc::now();

    engine.store.put_container(&ContainerRecord {
        ctid,
        ip_address: plan.ip_address.clone(),
        status: ContainerStatus::Running,
        team_id: plan.team_id,
        config_name: plan.config_name.trim().to_string(),
        storage_pool: plan.spec.storage_pool.clone(),
        node_name: node.to_string(),
        last_updated: now,
        created_at: now,
    })?;

    if let Some(lock) = shared.team_locks.get(&plan.team_id) {
        let _guard = lock.lock().await;
        if let Some(mut team) = engine.store.get_team(plan.team_id)? {
            team.container_ids.push(ctid);
            team.last_updated = now;
            engine.store.put_team(&team)?;
        }
    }

    {
        let _guard = shared.comp_lock.lock().await;
        if let Some(mut comp) = engine.store.get_competition(&shared.system_id)? {
            comp.container_ids.push(ctid);
            engine.store.put_competition(&comp)?;
        }
    }

    let mut provisioned = shared.provisioned.lock().await;
    if let Some(entry) = provisioned.iter_mut().find(|p| p.ctid == ctid) {
        entry.recorded = true;
    }
    Ok(())
}
