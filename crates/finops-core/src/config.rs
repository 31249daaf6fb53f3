//! finops.toml configuration parser.
//!
//! Every field has a default, so an empty file is a valid configuration.
//! Secrets are never stored in the file: `password_env` / `token_env`
//! name environment variables that hold them.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cost::CostModel;
use crate::types::{Policy, ResourceSet};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FinopsConfig {
    pub store: StoreConfig,
    pub pricing: CostModel,
    pub bus: BusConfig,
    pub gitops: GitopsConfig,
    pub sync: SyncConfig,
    pub recommender: RecommenderConfig,
    pub metrics: MetricsConfig,
    /// Policies installed into the store at startup (upserted by name).
    pub policies: Vec<Policy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/finops/finops.redb"),
        }
    }
}

/// Redelivery and publish retry settings for the message transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Deliveries per event before it is dead-lettered.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Attempts for a single publish before giving up.
    pub publish_attempts: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            publish_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitopsConfig {
    /// Remote manifest repository.
    pub url: String,
    pub base_branch: String,
    pub username: Option<String>,
    /// Environment variable holding the password or access token.
    pub password_env: Option<String>,
    pub clone_path: PathBuf,
    /// Directory inside the repository holding `<namespace>/` folders.
    pub manifest_root: PathBuf,
    pub author_name: String,
    pub author_email: String,
    /// Bound on clone/push network operations.
    pub network_timeout_secs: u64,
    /// Base URL for pull request links; defaults to the repository URL.
    pub pr_base_url: Option<String>,
}

impl Default for GitopsConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            base_branch: "main".to_string(),
            username: None,
            password_env: Some("FINOPS_GIT_PASSWORD".to_string()),
            clone_path: PathBuf::from("/tmp/finops-gitops-repo"),
            manifest_root: PathBuf::new(),
            author_name: "finops-bot".to_string(),
            author_email: "finops-bot@localhost".to_string(),
            network_timeout_secs: 60,
            pr_base_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_secs: u64,
    /// Pending verifications older than this are failed.
    pub verification_timeout_secs: u64,
    pub max_pending: usize,
    pub query_timeout_secs: u64,
    /// Kubernetes API base URL (e.g. a `kubectl proxy` address).
    pub cluster_api_url: String,
    /// Environment variable holding a bearer token for the API.
    pub token_env: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            verification_timeout_secs: 30 * 60,
            max_pending: 10_000,
            query_timeout_secs: 5,
            cluster_api_url: "http://127.0.0.1:8001".to_string(),
            token_env: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommenderConfig {
    pub interval_secs: u64,
    pub prometheus_url: String,
    pub query_timeout_secs: u64,
    pub currency: String,
    /// Directory for archived recommendation reports. Disabled if unset.
    pub report_dir: Option<PathBuf>,
    pub targets: Vec<TargetConfig>,
    /// Replica changes published at fixed times of day.
    pub schedules: Vec<ScheduleConfig>,
}

impl Default for RecommenderConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            prometheus_url: "http://127.0.0.1:9090".to_string(),
            query_timeout_secs: 5,
            currency: "USD".to_string(),
            report_dir: None,
            targets: Vec::new(),
            schedules: Vec::new(),
        }
    }
}

/// A workload the recommender evaluates every cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetConfig {
    pub namespace: String,
    /// `kind/name` or bare deployment name.
    pub workload: String,
    /// Resources the workload currently requests.
    #[serde(default)]
    pub current: ResourceSet,
}

/// Scale a workload to a fixed replica count at a local time of day.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleConfig {
    pub name: String,
    pub namespace: String,
    /// `kind/name` or bare deployment name.
    pub workload: String,
    pub replicas: u32,
    /// Local time, `HH:MM`.
    pub at: String,
    /// Weekday names (`mon`, `tue`, ...); empty means every day.
    #[serde(default)]
    pub days: Vec<String>,
    #[serde(default)]
    pub estimated_monthly_savings: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Address for the Prometheus `/metrics` endpoint; empty disables it.
    pub listen_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9464".to_string(),
        }
    }
}

impl FinopsConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: FinopsConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
