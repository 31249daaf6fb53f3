//! finops-sync — confirms that approved changes actually land.
//!
//! The reconciler keeps a bounded map of pending verifications, one per
//! approved recommendation, and polls the cluster on a fixed interval.
//!
//! # Architecture
//!
//! ```text
//! SyncReconciler
//!   ├── register_approved()  ← recommendation-approved
//!   ├── register_pr()        ← pr-created (restarts the window)
//!   └── tick() every interval
//!       ├── ClusterClient::workload_state() per entry (bounded timeout)
//!       ├── match   → change-applied, record APPLIED
//!       └── expired → change-failed,  record FAILED
//! ```
//!
//! A query error on one entry is counted on that entry and never stops
//! the rest of the tick.

pub mod cluster;
pub mod error;
pub mod reconciler;

pub use cluster::{ClusterClient, KubeApiClient, WorkloadState};
pub use error::{ClusterError, ClusterResult, SyncError};
pub use reconciler::{
    PendingVerification, ReconcilerSettings, Registration, SyncReconciler, TickReport,
};
