//! In-memory hypervisor test double.
//!
//! Used by this crate's tests and by the engines downstream (provisioning,
//! scoring, lifecycle) to exercise orchestration logic without a cluster.
//! The mock console speaks enough of the console protocol — handshake,
//! login dialogue, command echo — to drive the real exec driver.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::client::{ConsoleChannel, ConsoleHandle, ContainerInfo, Ctid, HypervisorClient};
use crate::error::{HvResult, HypervisorError};
use crate::spec::CtOption;

#[derive(Debug, Clone)]
struct MockContainer {
    name: String,
    node: String,
    status: String,
}

#[derive(Debug, Clone)]
struct ScriptedExec {
    stdout: String,
    stderr: String,
    exit_code: i32,
}

#[derive(Default)]
struct MockState {
    next_ctid: Ctid,
    containers: HashMap<Ctid, MockContainer>,
    fail_create_hostnames: HashSet<String>,
    fail_start_hostnames: HashSet<String>,
    created_hostnames: Vec<String>,
}

/// A scriptable in-memory hypervisor.
pub struct MockHypervisor {
    nodes: Vec<String>,
    state: Mutex<MockState>,
    scripts: Arc<Mutex<HashMap<Ctid, VecDeque<ScriptedExec>>>>,
}

impl MockHypervisor {
    pub fn new(nodes: Vec<String>) -> Self {
        Self {
            nodes,
            state: Mutex::new(MockState {
                next_ctid: 100,
                ..MockState::default()
            }),
            scripts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Make creation fail for any hostname containing `needle`.
    pub async fn fail_create_when_hostname_contains(&self, needle: &str) {
        let mut state = self.state.lock().await;
        state.fail_create_hostnames.insert(needle.to_string());
    }

    /// Make the first start fail for any hostname containing `needle`.
    pub async fn fail_start_when_hostname_contains(&self, needle: &str) {
        let mut state = self.state.lock().await;
        state.fail_start_hostnames.insert(needle.to_string());
    }

    /// Queue the output of the next console exec on a container.
    pub async fn script_exec(&self, ctid: Ctid, stdout: &str, stderr: &str, exit_code: i32) {
        let mut scripts = self.scripts.lock().await;
        scripts.entry(ctid).or_default().push_back(ScriptedExec {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code,
        });
    }

    /// Hostnames of every container ever created, in creation order.
    pub async fn created_hostnames(&self) -> Vec<String> {
        self.state.lock().await.created_hostnames.clone()
    }

    /// Hostnames of containers currently present on the cluster.
    pub async fn live_hostnames(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<String> =
            state.containers.values().map(|c| c.name.clone()).collect();
        names.sort();
        names
    }

    pub async fn container_count(&self) -> usize {
        self.state.lock().await.containers.len()
    }
}

fn option_value(options: &[CtOption], name: &str) -> String {
    options
        .iter()
        .find(|o| o.name == name)
        .map(|o| o.value.clone())
        .unwrap_or_default()
}

#[async_trait]
impl HypervisorClient for MockHypervisor {
    async fn nodes(&self) -> HvResult<Vec<String>> {
        Ok(self.nodes.clone())
    }

    async fn next_ctid(&self) -> HvResult<Ctid> {
        let mut state = self.state.lock().await;
        let mut candidate = state.next_ctid;
        while state.containers.contains_key(&candidate) {
            candidate += 1;
        }
        state.next_ctid = candidate + 1;
        Ok(candidate)
    }

    async fn is_ctid_free(&self, ctid: Ctid) -> HvResult<bool> {
        let state = self.state.lock().await;
        Ok(!state.containers.contains_key(&ctid))
    }

    async fn create_container(&self, node: &str, ctid: Ctid, options: &[CtOption]) -> HvResult<()> {
        let hostname = option_value(options, "hostname");
        let mut state = self.state.lock().await;

        if state.containers.contains_key(&ctid) {
            return Err(HypervisorError::CtidInUse(ctid));
        }
        if state
            .fail_create_hostnames
            .iter()
            .any(|needle| hostname.contains(needle.as_str()))
        {
            return Err(HypervisorError::Vendor(format!(
                "mock create failure for {hostname}"
            )));
        }

        state.created_hostnames.push(hostname.clone());
        state.containers.insert(
            ctid,
            MockContainer {
                name: hostname,
                node: node.to_string(),
                status: "stopped".to_string(),
            },
        );
        Ok(())
    }

    async fn start_container(&self, ctid: Ctid) -> HvResult<()> {
        let mut state = self.state.lock().await;
        let fail_start = {
            let container = state
                .containers
                .get(&ctid)
                .ok_or(HypervisorError::NotFound(ctid))?;
            state
                .fail_start_hostnames
                .iter()
                .find(|needle| container.name.contains(needle.as_str()))
                .cloned()
        };
        if let Some(needle) = fail_start {
            state.fail_start_hostnames.remove(&needle);
            return Err(HypervisorError::Vendor(format!(
                "mock start failure for container {ctid}"
            )));
        }

        let container = state
            .containers
            .get_mut(&ctid)
            .ok_or(HypervisorError::NotFound(ctid))?;
        if container.status == "running" {
            return Err(HypervisorError::Vendor(format!(
                "CT {ctid} already running"
            )));
        }
        container.status = "running".to_string();
        Ok(())
    }

    async fn stop_container(&self, ctid: Ctid) -> HvResult<()> {
        let mut state = self.state.lock().await;
        let container = state
            .containers
            .get_mut(&ctid)
            .ok_or(HypervisorError::NotFound(ctid))?;
        if container.status != "running" {
            return Err(HypervisorError::Vendor(format!("CT {ctid} not running")));
        }
        container.status = "stopped".to_string();
        Ok(())
    }

    async fn delete_container(&self, ctid: Ctid) -> HvResult<()> {
        let mut state = self.state.lock().await;
        state
            .containers
            .remove(&ctid)
            .map(|_| ())
            .ok_or(HypervisorError::NotFound(ctid))
    }

    async fn list_containers(&self) -> HvResult<Vec<ContainerInfo>> {
        let state = self.state.lock().await;
        Ok(state
            .containers
            .iter()
            .map(|(&ctid, c)| ContainerInfo {
                ctid,
                name: c.name.clone(),
                status: c.status.clone(),
                node: c.node.clone(),
            })
            .collect())
    }

    async fn open_console(&self, _node: &str, ctid: Ctid) -> HvResult<ConsoleHandle> {
        {
            let state = self.state.lock().await;
            if !state.containers.contains_key(&ctid) {
                return Err(HypervisorError::NotFound(ctid));
            }
        }

        Ok(ConsoleHandle {
            user: "root@pam".to_string(),
            ticket: "mock-ticket".to_string(),
            channel: Box::new(MockConsoleChannel {
                ctid,
                phase: Phase::Handshake,
                outbox: VecDeque::new(),
                scripts: self.scripts.clone(),
            }),
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Phase {
    Handshake,
    Idle,
    AwaitUser,
    AwaitPassword,
    Shell,
}

/// A console channel emulating the guest side of the exec protocol.
struct MockConsoleChannel {
    ctid: Ctid,
    phase: Phase,
    outbox: VecDeque<Vec<u8>>,
    scripts: Arc<Mutex<HashMap<Ctid, VecDeque<ScriptedExec>>>>,
}

impl MockConsoleChannel {
    fn push(&mut self, text: &str) {
        self.outbox.push_back(text.as_bytes().to_vec());
    }

    async fn run_scripted(&mut self, input: &str) {
        let script = {
            let mut scripts = self.scripts.lock().await;
            scripts
                .get_mut(&self.ctid)
                .and_then(|queue| queue.pop_front())
        }
        .unwrap_or(ScriptedExec {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        });

        // Echo roughly what a terminal would: the typed line, then the
        // framed output produced by the wrapper script.
        let framed = format!(
            "{input}__KOTH_BEGIN__\n__KOTH_RC={rc}__\n{stdout}\n__KOTH_SPLIT__\n{stderr}\n__KOTH_DONE__\nroot@mock:~# ",
            rc = script.exit_code,
            stdout = script.stdout,
            stderr = script.stderr,
        );
        self.push(&framed);
    }
}

#[async_trait]
impl ConsoleChannel for MockConsoleChannel {
    async fn send(&mut self, frame: &[u8]) -> HvResult<()> {
        let text = String::from_utf8_lossy(frame).into_owned();

        // Keep-alive and resize frames need no reply.
        if text == "2" || text.starts_with("1:") {
            return Ok(());
        }

        if self.phase == Phase::Handshake {
            if text.contains(':') {
                self.push("OK");
                self.phase = Phase::Idle;
                return Ok(());
            }
            return Err(HypervisorError::Console("handshake expected".to_string()));
        }

        // Terminal input frame: 0:<len>:<data>
        let data = match text.strip_prefix("0:") {
            Some(rest) => rest.split_once(':').map(|(_, d)| d.to_string()),
            None => None,
        };
        let Some(data) = data else {
            return Err(HypervisorError::Console(format!(
                "unexpected console frame: {text}"
            )));
        };

        match self.phase {
            Phase::Idle => {
                self.push("mock login: ");
                self.phase = Phase::AwaitUser;
            }
            Phase::AwaitUser => {
                self.push("Password: ");
                self.phase = Phase::AwaitPassword;
            }
            Phase::AwaitPassword => {
                self.push("root@mock:~# ");
                self.phase = Phase::Shell;
            }
            Phase::Shell => {
                self.run_scripted(&data).await;
            }
            Phase::Handshake => unreachable!(),
        }

        Ok(())
    }

    async fn recv(&mut self) -> HvResult<Vec<u8>> {
        match self.outbox.pop_front() {
            Some(frame) => Ok(frame),
            None => Err(HypervisorError::Console(
                "mock console has nothing to say".to_string(),
            )),
        }
    }
}
