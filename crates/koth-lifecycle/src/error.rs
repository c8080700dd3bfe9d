//! Lifecycle error types.

use thiserror::Error;

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("no container IDs supplied")]
    NoIds,

    #[error("container {0} not found")]
    ContainerNotFound(i64),

    #[error("container {0} is not assigned to a competition")]
    CompetitionNotFound(i64),

    #[error("container {0} is not associated with any team")]
    TeamNotFound(i64),

    #[error("unable to match container {0} to a config")]
    ConfigMismatch(i64),

    #[error("competition {0} missing SSH key material")]
    MissingKeys(String),

    #[error("competition {0} has no stored package or config")]
    PackageMissing(String),

    #[error("competition config invalid: {0}")]
    ConfigInvalid(#[from] serde_json::Error),

    #[error("competition {id} network invalid: {detail}")]
    NetworkInvalid { id: String, detail: String },

    #[error("setup script {script} exited with code {exit_code}")]
    SetupScriptFailed { script: String, exit_code: i32 },

    #[error("container {ctid}: {source}")]
    Container {
        ctid: i64,
        #[source]
        source: Box<LifecycleError>,
    },

    /// Several independent failures, joined.
    #[error("{}", .0.join("; "))]
    Combined(Vec<String>),

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

/// Accumulates best-effort failures for combined reporting.
#[derive(Default)]
pub struct ErrorList {
    errors: Vec<String>,
}

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: impl std::fmt::Display) {
        self.errors.push(error.to_string());
    }

    pub fn record<T, E: std::fmt::Display>(&mut self, result: Result<T, E>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.push(e);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_result(self) -> LifecycleResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::Combined(self.errors))
        }
    }
}
