//! Connection and bootstrap helpers on top of the transport contract.

use std::time::Duration;

use tracing::{debug, warn};

use crate::client::{SshAuth, SshClient, SshSession};
use crate::error::{SshError, SshResult};

/// Wait for the host to answer pings, then dial with linear-backoff
/// retries (1 s, 2 s, …) between attempts.
pub async fn connect_once_ready_with_retry(
    client: &dyn SshClient,
    user: &str,
    host: &str,
    port: u16,
    retries: u32,
    auth: &[SshAuth],
) -> SshResult<Box<dyn SshSession>> {
    client.wait_online(host).await?;

    let mut attempt: u32 = 0;
    loop {
        match client.connect(user, host, port, auth).await {
            Ok(session) => {
                if attempt > 0 {
                    debug!(host, attempt, "ssh connected after retries");
                }
                return Ok(session);
            }
            Err(e) if attempt >= retries => return Err(e),
            Err(e) => {
                attempt += 1;
                warn!(host, attempt, retries, error = %e, "ssh connect failed; retrying");
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
            }
        }
    }
}

/// Append the public key to `authorized_keys` inside the container,
/// creating the directory and file with the right modes first. The grep
/// guard keeps repeated bootstraps from duplicating the key.
pub async fn ensure_authorized_key(
    session: &mut dyn SshSession,
    public_key: &str,
) -> SshResult<()> {
    let key = public_key.trim();
    if key.is_empty() {
        return Err(SshError::Rejected("empty SSH public key".to_string()));
    }

    let escaped = escape_single_quotes(key);
    let command = format!(
        "install -m 700 -d /root/.ssh && \
         touch /root/.ssh/authorized_keys && \
         chmod 600 /root/.ssh/authorized_keys && \
         grep -qxF '{escaped}' /root/.ssh/authorized_keys || \
         printf '{escaped}\\n' >> /root/.ssh/authorized_keys"
    );

    let result = session.run(&command).await?;
    if result.exit_code != 0 {
        return Err(SshError::Rejected(format!(
            "failed to install SSH key (exit {}): {}",
            result.exit_code,
            result.output.trim()
        )));
    }
    Ok(())
}

/// Escape a value for interpolation into a single-quoted shell string.
pub fn escape_single_quotes(input: &str) -> String {
    if !input.contains('\'') {
        return input.to_string();
    }
    input.replace('\'', "'\"'\"'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::CommandOutput;
    use crate::mock::MockSshClient;

    #[test]
    fn single_quote_escaping() {
        assert_eq!(escape_single_quotes("plain"), "plain");
        assert_eq!(escape_single_quotes("it's"), "it'\"'\"'s");
    }

    #[tokio::test]
    async fn authorized_key_install_runs_the_guard_command() {
        let client = MockSshClient::new();
        let mut session = client
            .connect("root", "10.0.0.10", 22, &[SshAuth::Password("pw".to_string())])
            .await
            .unwrap();

        ensure_authorized_key(session.as_mut(), "ssh-rsa AAAA key\n")
            .await
            .unwrap();

        let commands = client.commands_for("10.0.0.10").await;
        assert_eq!(commands.len(), 1);
        assert!(commands[0].contains("authorized_keys"));
        assert!(commands[0].contains("grep -qxF 'ssh-rsa AAAA key'"));
    }

    #[tokio::test]
    async fn authorized_key_install_rejects_empty_keys() {
        let client = MockSshClient::new();
        let mut session = client
            .connect("root", "10.0.0.10", 22, &[SshAuth::Password("pw".to_string())])
            .await
            .unwrap();

        assert!(ensure_authorized_key(session.as_mut(), "  ").await.is_err());
    }

    #[tokio::test]
    async fn authorized_key_install_surfaces_nonzero_exit() {
        let client = MockSshClient::new();
        client
            .respond_when("10.0.0.10", "authorized_keys", CommandOutput {
                exit_code: 1,
                output: "read-only fs".to_string(),
            })
            .await;

        let mut session = client
            .connect("root", "10.0.0.10", 22, &[SshAuth::Password("pw".to_string())])
            .await
            .unwrap();

        let err = ensure_authorized_key(session.as_mut(), "ssh-rsa AAAA")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exit 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_retries_until_the_host_accepts() {
        let client = MockSshClient::new();
        client.fail_connects("10.0.0.10", 2).await;

        let session = connect_once_ready_with_retry(
            &client,
            "root",
            "10.0.0.10",
            22,
            5,
            &[SshAuth::Password("pw".to_string())],
        )
        .await;
        assert!(session.is_ok());
        assert_eq!(client.connect_attempts("10.0.0.10").await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_gives_up_after_the_retry_budget() {
        let client = MockSshClient::new();
        client.fail_connects("10.0.0.10", 100).await;

        let result = connect_once_ready_with_retry(
            &client,
            "root",
            "10.0.0.10",
            22,
            2,
            &[SshAuth::Password("pw".to_string())],
        )
        .await;
        assert!(result.is_err());
        assert_eq!(client.connect_attempts("10.0.0.10").await, 3);
    }
}
