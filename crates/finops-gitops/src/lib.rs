//! finops-gitops — applies approved recommendations through Git.
//!
//! For every approved event the [`ApplyCoordinator`] walks these phases:
//!
//! ```text
//! RepoReady        open, clone or re-clone the working copy; reset to base
//! BranchCreated    fix/rightsize-<sha256(id)[..12]> at the base head
//! ManifestPatched  replicas + container requests/limits rewritten
//! Pushed           commit (if the tree changed) and force-push the branch
//! PrAnnounced      pull request opened, PR-created event published
//! ```
//!
//! A failure stops the sequence. Transient failures (git, IO, timeouts)
//! are handed back to the transport for redelivery; terminal ones (missing
//! manifest, ambiguous container) are logged and acknowledged.

pub mod coordinator;
pub mod error;
pub mod git;
pub mod manifest;
pub mod pr;

pub use coordinator::{Aborted, ApplyCoordinator, ApplyPhase, ApplyReport, branch_name};
pub use error::{ApplyError, ErrorClass};
pub use git::{GitSettings, GitWorkspace};
pub use pr::{PullRequest, PullRequestHost, SimulatedHost};
