//! Pull request hosting.

use async_trait::async_trait;
use tracing::info;

use crate::error::ApplyError;

/// A pushed branch that should be proposed for merging.
#[derive(Debug, Clone)]
pub struct PullRequest {
    pub repository: String,
    pub branch: String,
    pub base: String,
    pub title: String,
}

/// A code host that can open pull requests.
#[async_trait]
pub trait PullRequestHost: Send + Sync {
    /// Open (or find the already open) pull request; returns its URL.
    async fn open(&self, request: &PullRequest) -> Result<String, ApplyError>;
}

/// Host that opens nothing and returns a deterministic link for the
/// branch, in the style of a code host's "new pull request" page.
#[derive(Debug, Clone)]
pub struct SimulatedHost {
    base_url: String,
}

impl SimulatedHost {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url
                .trim_end_matches('/')
                .trim_end_matches(".git")
                .to_string(),
        }
    }
}

#[async_trait]
impl PullRequestHost for SimulatedHost {
    async fn open(&self, request: &PullRequest) -> Result<String, ApplyError> {
        let url = format!("{}/pull/new/{}", self.base_url, request.branch);
        info!(
            branch = %request.branch,
            base = %request.base,
            %url,
            "pull request opened (simulated)"
        );
        Ok(url)
    }
}
