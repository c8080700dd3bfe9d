//! Transport contracts for the SSH runtime.

use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use crate::error::{SshError, SshResult};

/// How long to keep probing an address before giving up.
const WAIT_ONLINE_CAP: Duration = Duration::from_secs(3 * 60);
/// Pause between reachability probes.
const WAIT_ONLINE_INTERVAL: Duration = Duration::from_secs(3);

/// Authentication methods, attempted in the order given.
#[derive(Debug, Clone)]
pub enum SshAuth {
    /// OpenSSH-format private key material.
    PrivateKey(String),
    Password(String),
    /// Password answered over keyboard-interactive.
    KeyboardInteractive(String),
}

/// Combined output of one remote command.
///
/// A non-zero exit status is not an error: the command ran and said no.
/// Only transport failures surface as `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub output: String,
}

/// One established session.
#[async_trait]
pub trait SshSession: Send {
    /// Run a command, capturing combined output and exit status.
    async fn run(&mut self, command: &str) -> SshResult<CommandOutput>;

    /// Recreate the session on the same transport. Required between
    /// consecutive setup scripts.
    async fn reset(&mut self) -> SshResult<()>;

    async fn close(&mut self);
}

/// The SSH client primitive (external collaborator).
#[async_trait]
pub trait SshClient: Send + Sync {
    /// Dial a host, trying each auth method in order.
    async fn connect(
        &self,
        user: &str,
        host: &str,
        port: u16,
        auth: &[SshAuth],
    ) -> SshResult<Box<dyn SshSession>>;

    /// Block until the host answers ICMP, with a three-minute cap.
    ///
    /// The default implementation shells out to `ping`; test doubles
    /// override this to return immediately.
    async fn wait_online(&self, host: &str) -> SshResult<()> {
        let deadline = tokio::time::Instant::now() + WAIT_ONLINE_CAP;
        loop {
            if ping_host(host).await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SshError::HostUnreachable(host.to_string()));
            }
            tokio::time::sleep(WAIT_ONLINE_INTERVAL).await;
        }
    }
}

/// One ICMP echo attempt via the system `ping`.
pub async fn ping_host(host: &str) -> bool {
    let status = tokio::process::Command::new("ping")
        .args(["-c", "1", "-W", "2", host])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await;

    match status {
        Ok(status) => status.success(),
        Err(e) => {
            trace!(host, error = %e, "ping invocation failed");
            false
        }
    }
}
