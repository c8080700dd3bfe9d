//! Scoring error types.

use thiserror::Error;

pub type ScoringResult<T> = Result<T, ScoringError>;

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("competition {0} has no stored package or config")]
    PackageMissing(String),

    #[error("competition config invalid: {0}")]
    ConfigInvalid(#[from] serde_json::Error),

    #[error("competition {id} network invalid: {detail}")]
    NetworkInvalid { id: String, detail: String },

    #[error(transparent)]
    Net(#[from] koth_net::NetError),

    #[error(transparent)]
    State(#[from] koth_state::StateError),

    #[error(transparent)]
    Hypervisor(#[from] koth_hypervisor::HypervisorError),
}
