use finops_bus::{BusError, Retryable};
use finops_state::StateError;
use thiserror::Error;

/// Errors from the cluster API.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("cluster returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("cluster query timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("unsupported workload kind {0:?}")]
    UnsupportedKind(String),
}

pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors surfaced to the transport by the reconciler's event handler.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("pending verification set is full ({max} entries)")]
    AtCapacity { max: usize },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Publish(#[from] BusError),
}

impl Retryable for SyncError {
    fn is_retryable(&self) -> bool {
        match self {
            SyncError::AtCapacity { .. } | SyncError::State(_) => true,
            SyncError::Publish(e) => !matches!(e, BusError::Closed),
        }
    }
}
