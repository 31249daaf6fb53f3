//! Error types for the apply coordinator.

use std::path::PathBuf;

use finops_bus::BusError;
use thiserror::Error;

/// How the transport should treat a failed apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Redeliver with backoff.
    Transient,
    /// Acknowledge; retrying cannot help.
    Terminal,
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: &'static str, secs: u64 },

    #[error("blocking task failed: {0}")]
    Join(String),

    #[error("no manifest for {workload} in {}", dir.display())]
    ManifestNotFound { workload: String, dir: PathBuf },

    #[error("{} has several containers and none is named {container}", path.display())]
    AmbiguousContainer { container: String, path: PathBuf },

    #[error("invalid manifest {}: {reason}", path.display())]
    InvalidManifest { path: PathBuf, reason: String },

    #[error("pull request failed: {0}")]
    PullRequest(String),

    #[error("publish failed: {0}")]
    Publish(#[from] BusError),
}

impl ApplyError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ApplyError::Git(_)
            | ApplyError::Io(_)
            | ApplyError::Timeout { .. }
            | ApplyError::Join(_)
            | ApplyError::PullRequest(_) => ErrorClass::Transient,
            ApplyError::Publish(BusError::Closed) => ErrorClass::Terminal,
            ApplyError::Publish(_) => ErrorClass::Transient,
            ApplyError::ManifestNotFound { .. }
            | ApplyError::AmbiguousContainer { .. }
            | ApplyError::InvalidManifest { .. } => ErrorClass::Terminal,
        }
    }
}
