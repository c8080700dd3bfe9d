//! kothd — the KOTH orchestrator daemon.
//!
//! Wires the record store, the hypervisor and SSH clients, the engines
//! and the HTTP surface into one process: a scoring ticker, a container
//! status monitor, and the axum API server with graceful shutdown.
//!
//! ```text
//! kothd --config /etc/koth/koth.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use koth_api::ApiState;
use koth_auth::{AccessTokenStore, SessionSigner, StaticIdentityProvider};
use koth_core::config::Config;
use koth_hypervisor::{HypervisorAdapter, PveRestClient};
use koth_lifecycle::{run_status_monitor, LifecycleController};
use koth_provision::Provisioner;
use koth_scoring::ScoringEngine;
use koth_ssh::ProcessSshClient;
use koth_state::StateStore;
use koth_stream::JobRegistry;

/// Session cookie lifetime.
const SESSION_HOURS: i64 = 12;

#[derive(Parser)]
#[command(name = "kothd", about = "King-of-the-Hill competition orchestrator")]
struct Cli {
    /// Path to the TOML configuration file. A template is written there
    /// when the file does not exist.
    #[arg(long, default_value = "koth.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,kothd=debug")),
        )
        .init();

    let cli = Cli::parse();
    let config = Arc::new(Config::load(&cli.config).context("failed to load configuration")?);
    info!(path = %cli.config.display(), "configuration loaded");

    if !config.web.tls_dir.is_empty() {
        // TLS material discovery lives with the front terminator; the
        // daemon itself always speaks plain HTTP.
        warn!(tls_dir = %config.web.tls_dir, "tls_dir configured; expecting an external TLS terminator");
    }

    // ── Record store ───────────────────────────────────────────────
    let storage_base = PathBuf::from(config.storage_base());
    std::fs::create_dir_all(&storage_base).context("failed to create storage directory")?;
    let store =
        StateStore::open(&storage_base.join("koth.redb")).context("failed to open record store")?;
    info!(path = %storage_base.display(), "record store opened");

    // ── Vendor clients ─────────────────────────────────────────────
    let hypervisor_client =
        PveRestClient::new(&config.hypervisor).context("failed to build hypervisor client")?;
    let hypervisor = Arc::new(HypervisorAdapter::new(Arc::new(hypervisor_client)));
    let ssh = Arc::new(ProcessSshClient::new());

    let identity = {
        let mut provider = StaticIdentityProvider::new();
        for user in &config.auth.users {
            provider =
                provider.with_user(&user.username, &user.password, user.admin, user.groups.clone());
        }
        if provider.is_empty() {
            warn!("no accounts configured under [auth]; logins will fail");
        }
        Arc::new(provider)
    };

    // ── Engines ────────────────────────────────────────────────────
    let tokens = Arc::new(AccessTokenStore::new());
    let provisioner = Arc::new(
        Provisioner::new(
            store.clone(),
            hypervisor.clone(),
            ssh.clone(),
            tokens.clone(),
            config.clone(),
        )
        .context("failed to initialize provisioning engine")?,
    );
    let lifecycle = Arc::new(
        LifecycleController::new(
            store.clone(),
            hypervisor.clone(),
            ssh.clone(),
            tokens.clone(),
            config.clone(),
        )
        .context("failed to initialize lifecycle controller")?,
    );
    let scoring = Arc::new(
        ScoringEngine::new(store.clone(), hypervisor.clone(), tokens.clone(), config.clone())
            .context("failed to initialize scoring engine")?,
    );
    info!("engines initialized");

    // ── Background loops ───────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scoring_handle = tokio::spawn(scoring.run_loop(shutdown_rx.clone()));
    let monitor_handle = tokio::spawn(run_status_monitor(lifecycle.clone(), shutdown_rx));

    // ── HTTP surface ───────────────────────────────────────────────
    let state = ApiState {
        store,
        config: config.clone(),
        sessions: Arc::new(SessionSigner::new(chrono::Duration::hours(SESSION_HOURS))),
        identity,
        tokens,
        provisioner,
        lifecycle,
        upload_jobs: Arc::new(JobRegistry::new()),
        redeploy_jobs: Arc::new(JobRegistry::new()),
        teardown_jobs: Arc::new(JobRegistry::new()),
    };
    let router = koth_api::build_router(state);

    let addr = parse_listen_addr(&config.web.address)
        .with_context(|| format!("invalid listen address {:?}", config.web.address))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    info!(%addr, "API server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("server error")?;

    let _ = scoring_handle.await;
    let _ = monitor_handle.await;
    info!("kothd stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        warn!("failed to install Ctrl+C handler; shutting down immediately");
    }
    info!("shutdown signal received");
}

/// Accept ":8080" shorthand as well as full socket addresses.
fn parse_listen_addr(address: &str) -> anyhow::Result<SocketAddr> {
    let address = address.trim();
    let full = if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    };
    Ok(full.parse()?)
}

#[cfg(test)]
mod tests {
    use super::parse_listen_addr;

    #[test]
    fn listen_addr_accepts_port_shorthand() {
        assert_eq!(parse_listen_addr(":8080").unwrap().port(), 8080);
        assert_eq!(
            parse_listen_addr("127.0.0.1:9000").unwrap().to_string(),
            "127.0.0.1:9000"
        );
        assert!(parse_listen_addr("nonsense").is_err());
    }
}
