//! Provisioning error types.

use thiserror::Error;

pub type ProvisionResult<T> = Result<T, ProvisionError>;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("competition package path missing or not a directory: {0}")]
    PackageMissing(String),

    #[error("public folder {0} unavailable in package")]
    PublicFolderMissing(String),

    #[error("requested {requested} teams exceeds the {capacity} team subnets available")]
    TooManyTeams { requested: u32, capacity: u32 },

    #[error("setup script {script} exited with code {exit_code}")]
    SetupScriptFailed { script: String, exit_code: i32 },

    #[error("provisioning cancelled after a peer failure")]
    Cancelled,

    #[error("provisioning worker panicked: {0}")]
    WorkerPanic(String),

    #[error(transparent)]
    Net(#[from] koth_net::NetError),

    #[error(transparent)]
    State(#[from] koth_state::StateError),

    #[error(transparent)]
    Ssh(#[from] koth_ssh::SshError),

    #[error(transparent)]
    Hypervisor(#[from] koth_hypervisor::HypervisorError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
