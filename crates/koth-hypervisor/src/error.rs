//! Hypervisor adapter error types.

use thiserror::Error;

/// Result type alias for hypervisor operations.
pub type HvResult<T> = Result<T, HypervisorError>;

/// Errors that can occur talking to the hypervisor.
#[derive(Debug, Error)]
pub enum HypervisorError {
    #[error("hypervisor request failed: {0}")]
    Vendor(String),

    #[error("container {0} not found")]
    NotFound(i64),

    #[error("container id {0} is already in use")]
    CtidInUse(i64),

    #[error("no hypervisor nodes available")]
    NoNodes,

    #[error("hypervisor task failed: {0}")]
    TaskFailed(String),

    #[error("console error: {0}")]
    Console(String),

    #[error("console command timed out")]
    ConsoleTimeout,

    #[error("failed to authenticate to container console as {0}")]
    ConsoleLogin(String),

    #[error("failed to locate command markers in console output")]
    MarkersMissing,
}
