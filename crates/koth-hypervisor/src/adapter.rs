//! The hypervisor adapter: policy on top of the raw vendor client.
//!
//! Creation is serialized on a process-wide lock because id allocation
//! on the cluster is not transactional. Power actions are idempotent.
//! Bulk operations run in buckets of at most five concurrent tasks.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::client::{ContainerInfo, Ctid, HypervisorClient};
use crate::console::{run_console_command_with_timeouts, ConsoleTimeouts, ExecOutput};
use crate::error::{HvResult, HypervisorError};
use crate::spec::CtCreateSpec;

/// Maximum concurrent tasks per bulk bucket.
const BULK_BUCKET_SIZE: usize = 5;

/// Result of a container creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateResult {
    pub ctid: Ctid,
    pub node: String,
}

/// Bulk power/delete actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkAction {
    Start,
    Stop,
    Delete,
}

/// Uniform container operations over any [`HypervisorClient`].
pub struct HypervisorAdapter {
    client: Arc<dyn HypervisorClient>,
    create_lock: Mutex<()>,
    node_rotator: AtomicUsize,
    console_timeouts: ConsoleTimeouts,
}

impl HypervisorAdapter {
    pub fn new(client: Arc<dyn HypervisorClient>) -> Self {
        Self {
            client,
            create_lock: Mutex::new(()),
            node_rotator: AtomicUsize::new(0),
            console_timeouts: ConsoleTimeouts::default(),
        }
    }

    pub fn with_console_timeouts(mut self, timeouts: ConsoleTimeouts) -> Self {
        self.console_timeouts = timeouts;
        self
    }

    pub fn client(&self) -> &Arc<dyn HypervisorClient> {
        &self.client
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Next node in rotation.
    pub async fn next_node(&self) -> HvResult<String> {
        let nodes = self.client.nodes().await?;
        if nodes.is_empty() {
            return Err(HypervisorError::NoNodes);
        }
        let index = self.node_rotator.fetch_add(1, Ordering::Relaxed);
        Ok(nodes[index % nodes.len()].clone())
    }

    /// The named node when the cluster still knows it, otherwise the
    /// next node in rotation.
    pub async fn node_or_next(&self, name: &str) -> HvResult<String> {
        let name = name.trim();
        if !name.is_empty() {
            let nodes = self.client.nodes().await?;
            if nodes.iter().any(|n| n == name) {
                return Ok(name.to_string());
            }
        }
        self.next_node().await
    }

    // ── Creation ───────────────────────────────────────────────────

    /// Create a container with a cluster-allocated id.
    pub async fn create_container(&self, node: &str, spec: &CtCreateSpec) -> HvResult<CreateResult> {
        let _guard = self.create_lock.lock().await;
        let ctid = self.client.next_ctid().await?;
        self.client
            .create_container(node, ctid, &spec.to_options())
            .await?;
        debug!(ctid, node, hostname = %spec.hostname, "container created");
        Ok(CreateResult {
            ctid,
            node: node.to_string(),
        })
    }

    /// Create a container reusing a specific id (redeploy path).
    pub async fn create_container_with_id(
        &self,
        node: &str,
        spec: &CtCreateSpec,
        ctid: Ctid,
    ) -> HvResult<CreateResult> {
        if ctid <= 0 {
            return Err(HypervisorError::Vendor(format!("invalid container id {ctid}")));
        }

        let _guard = self.create_lock.lock().await;
        if !self.client.is_ctid_free(ctid).await? {
            return Err(HypervisorError::CtidInUse(ctid));
        }
        self.client
            .create_container(node, ctid, &spec.to_options())
            .await?;
        debug!(ctid, node, hostname = %spec.hostname, "container recreated with fixed id");
        Ok(CreateResult {
            ctid,
            node: node.to_string(),
        })
    }

    // ── Power actions ──────────────────────────────────────────────

    /// Start a container; "already running" counts as success.
    pub async fn start_container(&self, ctid: Ctid) -> HvResult<()> {
        match self.client.start_container(ctid).await {
            Err(e) if error_mentions(&e, "already running") => Ok(()),
            other => other,
        }
    }

    /// Stop a container; "not running" counts as success.
    pub async fn stop_container(&self, ctid: Ctid) -> HvResult<()> {
        match self.client.stop_container(ctid).await {
            Err(e) if error_mentions(&e, "not running") => Ok(()),
            other => other,
        }
    }

    pub async fn delete_container(&self, ctid: Ctid) -> HvResult<()> {
        self.client.delete_container(ctid).await
    }

    // ── Bulk operations ────────────────────────────────────────────

    /// Apply a bulk action over ids in buckets of at most five
    /// concurrent tasks, waiting for each bucket before the next.
    /// Every id is attempted; the first error is returned at the end.
    pub async fn bulk_action(&self, action: BulkAction, ids: &[Ctid]) -> HvResult<()> {
        let mut first_error = None;

        for bucket in ids.chunks(BULK_BUCKET_SIZE) {
            let tasks = bucket.iter().map(|&ctid| async move {
                let result = match action {
                    BulkAction::Start => self.start_container(ctid).await,
                    BulkAction::Stop => self.stop_container(ctid).await,
                    BulkAction::Delete => self.delete_container(ctid).await,
                };
                (ctid, result)
            });

            for (ctid, result) in join_all(tasks).await {
                if let Err(e) = result {
                    warn!(ctid, action = ?action, error = %e, "bulk action failed for container");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn bulk_start(&self, ids: &[Ctid]) -> HvResult<()> {
        self.bulk_action(BulkAction::Start, ids).await
    }

    pub async fn bulk_stop(&self, ids: &[Ctid]) -> HvResult<()> {
        self.bulk_action(BulkAction::Stop, ids).await
    }

    pub async fn bulk_delete(&self, ids: &[Ctid]) -> HvResult<()> {
        self.bulk_action(BulkAction::Delete, ids).await
    }

    /// Bulk action with linear-backoff retries.
    pub async fn bulk_action_with_retries(
        &self,
        action: BulkAction,
        ids: &[Ctid],
        retries: u32,
    ) -> HvResult<()> {
        with_retries(retries, || self.bulk_action(action, ids)).await
    }

    // ── Snapshots ──────────────────────────────────────────────────

    /// Snapshot of the given containers across all nodes.
    pub async fn get_containers(&self, ids: &[Ctid]) -> HvResult<Vec<ContainerInfo>> {
        let all = self.client.list_containers().await?;
        Ok(all.into_iter().filter(|c| ids.contains(&c.ctid)).collect())
    }

    /// Resolve one container or fail with `NotFound`.
    pub async fn resolve_container(&self, ctid: Ctid) -> HvResult<ContainerInfo> {
        self.get_containers(&[ctid])
            .await?
            .into_iter()
            .next()
            .ok_or(HypervisorError::NotFound(ctid))
    }

    /// Whether the cluster knows this container at all.
    pub async fn container_exists(&self, ctid: Ctid) -> HvResult<bool> {
        Ok(!self.get_containers(&[ctid]).await?.is_empty())
    }

    // ── Console exec ───────────────────────────────────────────────

    /// Execute a command inside a container through the console proxy.
    pub async fn raw_execute(
        &self,
        ctid: Ctid,
        username: &str,
        password: &str,
        command: &str,
    ) -> HvResult<ExecOutput> {
        let info = self.resolve_container(ctid).await?;
        let mut handle = self.client.open_console(&info.node, ctid).await?;
        run_console_command_with_timeouts(
            handle.channel.as_mut(),
            &handle.user,
            &handle.ticket,
            username,
            password,
            command,
            self.console_timeouts,
        )
        .await
    }

    /// [`Self::raw_execute`] with linear-backoff retries.
    pub async fn raw_execute_with_retries(
        &self,
        ctid: Ctid,
        username: &str,
        password: &str,
        command: &str,
        retries: u32,
    ) -> HvResult<ExecOutput> {
        with_retries(retries, || self.raw_execute(ctid, username, password, command)).await
    }
}

/// Retry an operation with linear backoff (1 s, 2 s, …) between attempts.
pub async fn with_retries<T, E, F, Fut>(retries: u32, mut op: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= retries => return Err(e),
            Err(e) => {
                attempt += 1;
                debug!(attempt, retries, error = %e, "operation failed; retrying");
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
            }
        }
    }
}

fn error_mentions(error: &HypervisorError, needle: &str) -> bool {
    error.to_string().to_lowercase().contains(needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHypervisor;

    fn spec(hostname: &str) -> CtCreateSpec {
        CtCreateSpec {
            hostname: hostname.to_string(),
            ipv4_address: "10.0.0.10".to_string(),
            ..CtCreateSpec::default()
        }
    }

    #[tokio::test]
    async fn create_allocates_sequential_ids() {
        let mock = Arc::new(MockHypervisor::new(vec!["pve1".into(), "pve2".into()]));
        let adapter = HypervisorAdapter::new(mock);

        let a = adapter.create_container("pve1", &spec("a")).await.unwrap();
        let b = adapter.create_container("pve1", &spec("b")).await.unwrap();
        assert!(b.ctid > a.ctid);
    }

    #[tokio::test]
    async fn create_with_id_rejects_taken_ids() {
        let mock = Arc::new(MockHypervisor::new(vec!["pve1".into()]));
        let adapter = HypervisorAdapter::new(mock);

        let created = adapter.create_container("pve1", &spec("a")).await.unwrap();
        let err = adapter
            .create_container_with_id("pve1", &spec("b"), created.ctid)
            .await
            .unwrap_err();
        assert!(matches!(err, HypervisorError::CtidInUse(_)));

        adapter.delete_container(created.ctid).await.unwrap();
        let again = adapter
            .create_container_with_id("pve1", &spec("b"), created.ctid)
            .await
            .unwrap();
        assert_eq!(again.ctid, created.ctid);
    }

    #[tokio::test]
    async fn power_actions_are_idempotent() {
        let mock = Arc::new(MockHypervisor::new(vec!["pve1".into()]));
        let adapter = HypervisorAdapter::new(mock);
        let created = adapter.create_container("pve1", &spec("a")).await.unwrap();

        adapter.start_container(created.ctid).await.unwrap();
        // Second start reports "already running" from the vendor.
        adapter.start_container(created.ctid).await.unwrap();

        adapter.stop_container(created.ctid).await.unwrap();
        adapter.stop_container(created.ctid).await.unwrap();
    }

    #[tokio::test]
    async fn bulk_actions_touch_every_container() {
        let mock = Arc::new(MockHypervisor::new(vec!["pve1".into()]));
        let adapter = HypervisorAdapter::new(mock.clone());

        let mut ids = Vec::new();
        for i in 0..12 {
            ids.push(
                adapter
                    .create_container("pve1", &spec(&format!("ct-{i}")))
                    .await
                    .unwrap()
                    .ctid,
            );
        }

        adapter.bulk_start(&ids).await.unwrap();
        let snapshot = adapter.get_containers(&ids).await.unwrap();
        assert_eq!(snapshot.len(), 12);
        assert!(snapshot.iter().all(|c| c.status == "running"));

        adapter.bulk_stop(&ids).await.unwrap();
        let snapshot = adapter.get_containers(&ids).await.unwrap();
        assert!(snapshot.iter().all(|c| c.status == "stopped"));

        adapter.bulk_delete(&ids).await.unwrap();
        assert!(adapter.get_containers(&ids).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn node_rotation_cycles() {
        let mock = Arc::new(MockHypervisor::new(vec!["pve1".into(), "pve2".into()]));
        let adapter = HypervisorAdapter::new(mock);

        let first = adapter.next_node().await.unwrap();
        let second = adapter.next_node().await.unwrap();
        let third = adapter.next_node().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[tokio::test]
    async fn node_or_next_prefers_known_nodes() {
        let mock = Arc::new(MockHypervisor::new(vec!["pve1".into(), "pve2".into()]));
        let adapter = HypervisorAdapter::new(mock);

        assert_eq!(adapter.node_or_next("pve2").await.unwrap(), "pve2");
        let fallback = adapter.node_or_next("gone").await.unwrap();
        assert!(fallback == "pve1" || fallback == "pve2");
    }

    #[tokio::test(start_paused = true)]
    async fn with_retries_backs_off_linearly() {
        let attempts = std::sync::Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result: Result<(), HypervisorError> = with_retries(3, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(HypervisorError::Vendor("transient".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn raw_execute_runs_the_console_protocol() {
        let mock = Arc::new(MockHypervisor::new(vec!["pve1".into()]));
        let adapter = HypervisorAdapter::new(mock.clone());
        let created = adapter.create_container("pve1", &spec("web")).await.unwrap();
        adapter.start_container(created.ctid).await.unwrap();

        mock.script_exec(created.ctid, "{\"http_200\": true}", "", 0).await;

        let output = adapter
            .raw_execute(created.ctid, "root", "hunter2", "run-checks")
            .await
            .unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout.trim(), "{\"http_200\": true}");
    }
}
