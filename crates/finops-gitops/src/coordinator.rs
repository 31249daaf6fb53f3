//! Drives one approved recommendation through the GitOps phases.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use finops_bus::{EventHandler, EventPublisher, RetryPolicy, Retryable, publish_with_retry};
use finops_core::event::{PrCreated, RecommendationApproved};
use finops_core::{Event, epoch_secs};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::error::{ApplyError, ErrorClass};
use crate::git::GitWorkspace;
use crate::manifest::{ManifestPatch, find_manifest, patch_file};
use crate::pr::{PullRequest, PullRequestHost};

/// Last phase an apply completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyPhase {
    Started,
    RepoReady,
    BranchCreated,
    ManifestPatched,
    Pushed,
    PrAnnounced,
}

/// An apply that stopped after `phase`.
#[derive(Debug)]
pub struct Aborted {
    pub phase: ApplyPhase,
    pub error: ApplyError,
}

impl Aborted {
    pub fn class(&self) -> ErrorClass {
        self.error.class()
    }
}

impl From<ApplyError> for Aborted {
    fn from(error: ApplyError) -> Self {
        Self {
            phase: ApplyPhase::Started,
            error,
        }
    }
}

impl fmt::Display for Aborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "apply aborted after {:?}: {}", self.phase, self.error)
    }
}

impl std::error::Error for Aborted {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl Retryable for Aborted {
    fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

fn after(phase: ApplyPhase) -> impl FnOnce(ApplyError) -> Aborted {
    move |error| Aborted { phase, error }
}

/// What a completed apply did.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub recommendation_id: String,
    pub branch_name: String,
    /// Manifest path relative to the repository root.
    pub manifest: PathBuf,
    /// `false` when the manifest already matched the target.
    pub committed: bool,
    pub pr_url: String,
    pub phase: ApplyPhase,
}

/// `fix/rightsize-` plus the first 12 hex chars of SHA-256(id).
pub fn branch_name(recommendation_id: &str) -> String {
    let digest = Sha256::digest(recommendation_id.as_bytes());
    format!("fix/rightsize-{}", &hex::encode(digest)[..12])
}

struct GitOutcome {
    manifest: PathBuf,
    committed: bool,
}

/// Consumes approved events and turns them into pushed branches and PRs.
pub struct ApplyCoordinator {
    workspace: GitWorkspace,
    manifest_root: PathBuf,
    host: Arc<dyn PullRequestHost>,
    publisher: Arc<dyn EventPublisher>,
    retry: RetryPolicy,
}

impl ApplyCoordinator {
    pub fn new(
        workspace: GitWorkspace,
        manifest_root: PathBuf,
        host: Arc<dyn PullRequestHost>,
        publisher: Arc<dyn EventPublisher>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            workspace,
            manifest_root,
            host,
            publisher,
            retry,
        }
    }

    pub async fn apply(&self, event: &RecommendationApproved) -> Result<ApplyReport, Aborted> {
        let id = event.recommendation_id.clone();
        let branch = branch_name(&id);
        info!(
            recommendation = %id,
            workload = %event.workload_ref,
            namespace = %event.namespace,
            %branch,
            "applying approved recommendation"
        );

        let result = self.push_change(event, &branch).await;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(aborted) => {
                self.log_abort(&id, &aborted);
                return Err(aborted);
            }
        };

        match self.announce(event, &branch).await {
            Ok(pr_url) => {
                info!(recommendation = %id, %branch, %pr_url, "apply complete");
                Ok(ApplyReport {
                    recommendation_id: id,
                    branch_name: branch,
                    manifest: outcome.manifest,
                    committed: outcome.committed,
                    pr_url,
                    phase: ApplyPhase::PrAnnounced,
                })
            }
            Err(error) => {
                let aborted = Aborted {
                    phase: ApplyPhase::Pushed,
                    error,
                };
                self.log_abort(&id, &aborted);
                Err(aborted)
            }
        }
    }

    /// Branch, patch, commit and push on the blocking pool.
    async fn push_change(
        &self,
        event: &RecommendationApproved,
        branch: &str,
    ) -> Result<GitOutcome, Aborted> {
        let branch = branch.to_string();
        let manifest_root = self.manifest_root.clone();
        let namespace = event.namespace.clone();
        let workload = event.workload_ref.clone();
        let resources = event.approved_resources.clone();
        let replicas = event.replicas;
        let message = format!(
            "chore: rightsizing {} based on recommendation {}",
            event.workload_ref, event.recommendation_id
        );

        self.workspace
            .run("apply", move |session| {
                session
                    .start_branch(&branch)
                    .map_err(after(ApplyPhase::RepoReady))?;

                let dir = session.workdir().join(&manifest_root).join(&namespace);
                let path = find_manifest(&dir, &workload).map_err(after(ApplyPhase::BranchCreated))?;
                let changed = patch_file(
                    &path,
                    &ManifestPatch {
                        container: &workload.name,
                        resources: &resources,
                        replicas,
                    },
                )
                .map_err(after(ApplyPhase::BranchCreated))?;
                let manifest = path
                    .strip_prefix(session.workdir())
                    .map(|p| p.to_path_buf())
                    .unwrap_or(path.clone());

                let commit = session
                    .commit_all(&message)
                    .map_err(after(ApplyPhase::ManifestPatched))?;
                if commit.is_none() {
                    debug!(manifest = %manifest.display(), changed, "manifest already at target");
                }
                session
                    .push_branch(&branch)
                    .map_err(after(ApplyPhase::ManifestPatched))?;

                Ok(GitOutcome {
                    manifest,
                    committed: commit.is_some(),
                })
            })
            .await
    }

    /// Open the pull request and publish PR-created.
    async fn announce(
        &self,
        event: &RecommendationApproved,
        branch: &str,
    ) -> Result<String, ApplyError> {
        let settings = self.workspace.settings();
        let request = PullRequest {
            repository: settings.url.clone(),
            branch: branch.to_string(),
            base: settings.base_branch.clone(),
            title: format!(
                "Rightsize {} in {} ({:.2} {}/month)",
                event.workload_ref,
                event.namespace,
                event.estimated_monthly_savings,
                event.currency
            ),
        };
        let pr_url = self.host.open(&request).await?;

        let created = Event::PrCreated(PrCreated {
            recommendation_id: event.recommendation_id.clone(),
            pr_url: pr_url.clone(),
            repository: request.repository,
            branch_name: request.branch,
            created_at: epoch_secs(),
        });
        publish_with_retry(self.publisher.as_ref(), created, &self.retry).await?;
        Ok(pr_url)
    }

    fn log_abort(&self, id: &str, aborted: &Aborted) {
        match aborted.class() {
            ErrorClass::Terminal => error!(
                recommendation = %id,
                phase = ?aborted.phase,
                error = %aborted.error,
                "apply aborted permanently"
            ),
            ErrorClass::Transient => warn!(
                recommendation = %id,
                phase = ?aborted.phase,
                error = %aborted.error,
                "apply aborted, will retry"
            ),
        }
    }
}

#[async_trait]
impl EventHandler for ApplyCoordinator {
    type Error = Aborted;

    async fn handle(&self, event: &Event) -> Result<(), Aborted> {
        match event {
            Event::Approved(approved) => self.apply(approved).await.map(|_| ()),
            other => {
                debug!(topic = %other.topic(), "coordinator ignoring event");
                Ok(())
            }
        }
    }
}
