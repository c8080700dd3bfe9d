//! Scriptable SSH test double used across the workspace.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::client::{CommandOutput, SshAuth, SshClient, SshSession};
use crate::error::{SshError, SshResult};

#[derive(Clone)]
struct Rule {
    command_needle: String,
    response: CommandOutput,
}

#[derive(Default)]
struct MockState {
    /// Remaining connect failures per host.
    connect_failures: HashMap<String, u32>,
    connect_attempts: HashMap<String, u32>,
    /// Commands executed, per host, in order.
    commands: HashMap<String, Vec<String>>,
    rules: HashMap<String, Vec<Rule>>,
}

/// In-memory SSH client: instantly "reachable", records every command.
#[derive(Default)]
pub struct MockSshClient {
    state: Arc<Mutex<MockState>>,
}

impl MockSshClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` connect attempts against `host`.
    pub async fn fail_connects(&self, host: &str, count: u32) {
        let mut state = self.state.lock().await;
        state.connect_failures.insert(host.to_string(), count);
    }

    /// Respond with `response` whenever a command on `host` contains
    /// `command_needle`. Later rules win over earlier ones.
    pub async fn respond_when(&self, host: &str, command_needle: &str, response: CommandOutput) {
        let mut state = self.state.lock().await;
        state.rules.entry(host.to_string()).or_default().push(Rule {
            command_needle: command_needle.to_string(),
            response,
        });
    }

    /// Commands executed against `host`, in order.
    pub async fn commands_for(&self, host: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state.commands.get(host).cloned().unwrap_or_default()
    }

    pub async fn connect_attempts(&self, host: &str) -> u32 {
        let state = self.state.lock().await;
        state.connect_attempts.get(host).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SshClient for MockSshClient {
    async fn connect(
        &self,
        user: &str,
        host: &str,
        port: u16,
        _auth: &[SshAuth],
    ) -> SshResult<Box<dyn SshSession>> {
        let mut state = self.state.lock().await;
        *state.connect_attempts.entry(host.to_string()).or_insert(0) += 1;

        if let Some(remaining) = state.connect_failures.get_mut(host) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SshError::Connect {
                    user: user.to_string(),
                    host: host.to_string(),
                    port,
                    detail: "mock connect refused".to_string(),
                });
            }
        }

        Ok(Box::new(MockSshSession {
            host: host.to_string(),
            state: self.state.clone(),
        }))
    }

    async fn wait_online(&self, _host: &str) -> SshResult<()> {
        Ok(())
    }
}

struct MockSshSession {
    host: String,
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl SshSession for MockSshSession {
    async fn run(&mut self, command: &str) -> SshResult<CommandOutput> {
        let mut state = self.state.lock().await;
        state
            .commands
            .entry(self.host.clone())
            .or_default()
            .push(command.to_string());

        let response = state
            .rules
            .get(&self.host)
            .and_then(|rules| {
                rules
                    .iter()
                    .rev()
                    .find(|rule| command.contains(&rule.command_needle))
            })
            .map(|rule| rule.response.clone())
            .unwrap_or(CommandOutput {
                exit_code: 0,
                output: String::new(),
            });

        Ok(response)
    }

    async fn reset(&mut self) -> SshResult<()> {
        Ok(())
    }

    async fn close(&mut self) {}
}
