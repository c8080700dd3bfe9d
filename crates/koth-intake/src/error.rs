//! Intake error types. Everything here is a caller fault (4xx) except
//! the store and io wrappers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("file exceeds {limit} byte limit (got {size})")]
    TooLarge { size: u64, limit: u64 },

    #[error("file is empty")]
    Empty,

    #[error("file is not a valid zip: {0}")]
    NotAZip(String),

    #[error("zip contains invalid file paths: entry {0:?}")]
    UnsafePath(String),

    #[error("failed to read archive entry {name}: {detail}")]
    EntryRead { name: String, detail: String },

    #[error("config.json missing from archive")]
    ConfigMissing,

    #[error("config.json is invalid: {0}")]
    ConfigInvalid(#[from] serde_json::Error),

    #[error("competitionID is required")]
    IdMissing,

    #[error("competitionID {0} already exists")]
    IdConflict(String),

    #[error("container spec violates restrictions: {0}")]
    RestrictionViolation(String),

    #[error("attachment path escapes storage directory: {0}")]
    AttachmentEscape(String),

    #[error(transparent)]
    State(#[from] koth_state::StateError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntakeError {
    /// Whether this is a caller fault (HTTP 4xx) rather than a server
    /// failure.
    pub fn is_validation(&self) -> bool {
        !matches!(self, IntakeError::State(_) | IntakeError::Io(_))
    }
}
