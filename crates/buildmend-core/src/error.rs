//! Error taxonomy for the correction-retry engine.

use std::path::PathBuf;

use crate::config::ConfigError;
use crate::gateway::GatewayError;

/// buildmend core errors.
///
/// A build that exits non-zero is a normal outcome carried by
/// [`BuildResult`](crate::build::BuildResult), never a `Process` error.
#[derive(Debug, thiserror::Error)]
pub enum BuildmendError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("process error running `{command}`: {reason}")]
    Process { command: String, reason: String },

    #[error("service error: {0}")]
    Service(#[from] GatewayError),

    #[error("invalid correction set for {}: {reason}", path.display())]
    CorrectionConflict { path: PathBuf, reason: String },

    #[error("refusing to edit {}: outside project root {}", path.display(), root.display())]
    OutsideProject { path: PathBuf, root: PathBuf },

    #[error("corruption detected in {}: expected digest {expected}, got {actual}", path.display())]
    CorruptionDetected {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error(
        "could not self-correct {} after {attempts} build attempt(s){}",
        path.display(),
        last_error.as_deref().map(|e| format!(": {e}")).unwrap_or_default()
    )]
    RetryBudgetExhausted {
        path: PathBuf,
        attempts: u32,
        last_error: Option<String>,
    },

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
}

/// Result type for buildmend core operations.
pub type Result<T> = std::result::Result<T, BuildmendError>;
