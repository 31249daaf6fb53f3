//! Archive of generated recommendations.

use std::path::PathBuf;

use async_trait::async_trait;
use finops_core::{ResourceSet, WorkloadRef};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ReportError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecommendationReport {
    pub id: String,
    pub recommendation_id: String,
    pub workload_ref: WorkloadRef,
    pub namespace: String,
    pub current_resources: ResourceSet,
    pub suggested_resources: ResourceSet,
    pub estimated_monthly_savings: f64,
    pub currency: String,
    pub generated_at: u64,
}

#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Store `report`; returns where it was written.
    async fn put(&self, report: &RecommendationReport) -> Result<String, ReportError>;
}

/// Reports as `<root>/reports/<recommendation id>.json`.
pub struct FsReportStore {
    root: PathBuf,
}

impl FsReportStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, recommendation_id: &str) -> PathBuf {
        self.root
            .join("reports")
            .join(format!("{recommendation_id}.json"))
    }
}

#[async_trait]
impl ReportStore for FsReportStore {
    async fn put(&self, report: &RecommendationReport) -> Result<String, ReportError> {
        let path = self.path_for(&report.recommendation_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(report)?;

        // Write then rename so readers never see a partial report.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(path = %path.display(), "report written");
        Ok(path.display().to_string())
    }
}
