//! SSH runtime error types.

use thiserror::Error;

/// Result type alias for SSH operations.
pub type SshResult<T> = Result<T, SshError>;

/// Errors that can occur during SSH operations.
#[derive(Debug, Error)]
pub enum SshError {
    #[error("host {0} not reachable within the wait window")]
    HostUnreachable(String),

    #[error("failed to connect to {user}@{host}:{port}: {detail}")]
    Connect {
        user: String,
        host: String,
        port: u16,
        detail: String,
    },

    #[error("command transport failed: {0}")]
    Transport(String),

    #[error("remote command refused: {0}")]
    Rejected(String),

    #[error("keypair generation failed: {0}")]
    Keygen(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
