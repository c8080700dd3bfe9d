//! Vendor contracts: the narrow surface the actual hypervisor client
//! must provide. Everything else in this crate is built on top.

use async_trait::async_trait;

use crate::error::HvResult;
use crate::spec::CtOption;

/// Hypervisor container id.
pub type Ctid = i64;

/// Snapshot of one container as reported by the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub ctid: Ctid,
    pub name: String,
    /// Raw status string ("running", "stopped", …).
    pub status: String,
    pub node: String,
}

/// An open console proxy: the terminal session credentials plus the
/// bidirectional frame channel.
pub struct ConsoleHandle {
    /// Terminal user for the websocket handshake.
    pub user: String,
    /// One-shot console ticket.
    pub ticket: String,
    pub channel: Box<dyn ConsoleChannel>,
}

/// Bidirectional console frames. The vendor client owns the transport;
/// the exec driver owns the protocol.
#[async_trait]
pub trait ConsoleChannel: Send {
    async fn send(&mut self, frame: &[u8]) -> HvResult<()>;
    async fn recv(&mut self) -> HvResult<Vec<u8>>;
}

/// Raw vendor surface. Every operation that waits on a hypervisor task
/// returns only after the task finishes; error text is surfaced verbatim
/// so the adapter can apply idempotence rules.
#[async_trait]
pub trait HypervisorClient: Send + Sync {
    /// Names of online cluster nodes.
    async fn nodes(&self) -> HvResult<Vec<String>>;

    /// Next free container id suggested by the cluster.
    async fn next_ctid(&self) -> HvResult<Ctid>;

    /// Whether a specific container id is unused cluster-wide.
    async fn is_ctid_free(&self, ctid: Ctid) -> HvResult<bool>;

    /// Create a container and wait for the creation task.
    async fn create_container(&self, node: &str, ctid: Ctid, options: &[CtOption]) -> HvResult<()>;

    async fn start_container(&self, ctid: Ctid) -> HvResult<()>;
    async fn stop_container(&self, ctid: Ctid) -> HvResult<()>;
    async fn delete_container(&self, ctid: Ctid) -> HvResult<()>;

    /// Snapshot of every container on every node.
    async fn list_containers(&self) -> HvResult<Vec<ContainerInfo>>;

    /// Open a console proxy into a container.
    async fn open_console(&self, node: &str, ctid: Ctid) -> HvResult<ConsoleHandle>;
}
