//! Recommendation generation loop.

use std::sync::Arc;
use std::time::Duration;

use finops_bus::{EventPublisher, RetryPolicy, publish_with_retry};
use finops_core::config::TargetConfig;
use finops_core::event::RecommendationCreated;
use finops_core::{CostModel, Event, ResourceSet, WorkloadRef, WorkloadRefError, epoch_secs};
use finops_metrics::MetricsCollector;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::RecommendError;
use crate::report::{RecommendationReport, ReportStore};
use crate::usage::UsageSource;

const HEADROOM: f64 = 1.2;
const MIN_CPU_CORES: f64 = 0.01;
const MIB: f64 = 1024.0 * 1024.0;
const MIN_MEMORY_BYTES: f64 = 64.0 * MIB;
const CONFIDENCE: f64 = 0.90;

/// Suggested CPU request for an observed p95, in whole millicores.
pub fn suggest_cpu(p95_cores: f64) -> String {
    let millis = (p95_cores.max(MIN_CPU_CORES) * HEADROOM * 1000.0).round();
    format!("{}m", millis as u64)
}

/// Suggested memory request for an observed p95, in whole MiB.
pub fn suggest_memory(p95_bytes: f64) -> String {
    let mib = (p95_bytes.max(MIN_MEMORY_BYTES) / MIB * HEADROOM).round();
    format!("{}Mi", mib as u64)
}

/// A workload evaluated every cycle.
#[derive(Debug, Clone)]
pub struct Target {
    pub namespace: String,
    pub workload: WorkloadRef,
    pub current: ResourceSet,
}

impl Target {
    pub fn from_config(config: &TargetConfig) -> Result<Self, WorkloadRefError> {
        Ok(Self {
            namespace: config.namespace.clone(),
            workload: config.workload.parse()?,
            current: config.current.clone(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub published: usize,
    pub skipped: usize,
}

pub struct Recommender {
    usage: Arc<dyn UsageSource>,
    publisher: Arc<dyn EventPublisher>,
    retry: RetryPolicy,
    cost: CostModel,
    currency: String,
    reports: Option<Arc<dyn ReportStore>>,
    metrics: Option<Arc<MetricsCollector>>,
    targets: Vec<Target>,
}

impl Recommender {
    pub fn new(
        usage: Arc<dyn UsageSource>,
        publisher: Arc<dyn EventPublisher>,
        retry: RetryPolicy,
        cost: CostModel,
        currency: &str,
        targets: Vec<Target>,
    ) -> Self {
        Self {
            usage,
            publisher,
            retry,
            cost,
            currency: currency.to_string(),
            reports: None,
            metrics: None,
            targets,
        }
    }

    pub fn with_reports(mut self, reports: Arc<dyn ReportStore>) -> Self {
        self.reports = Some(reports);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Build a recommendation for `target` from current usage.
    pub async fn recommend(&self, target: &Target) -> Result<RecommendationCreated, RecommendError> {
        let cpu = self
            .usage
            .p95_cpu_cores(&target.namespace, &target.workload)
            .await?;
        let memory = self
            .usage
            .p95_memory_bytes(&target.namespace, &target.workload)
            .await?;

        let suggested: ResourceSet = [
            ("cpu".to_string(), suggest_cpu(cpu)),
            ("memory".to_string(), suggest_memory(memory)),
        ]
        .into();
        let savings = self.cost.monthly_savings(&target.current, &suggested)?;

        Ok(RecommendationCreated {
            id: uuid::Uuid::new_v4().to_string(),
            workload_ref: target.workload.clone(),
            namespace: target.namespace.clone(),
            current_resources: target.current.clone(),
            suggested_resources: suggested,
            replicas: None,
            confidence_score: CONFIDENCE,
            estimated_monthly_savings: savings,
            currency: self.currency.clone(),
            created_at: epoch_secs(),
        })
    }

    /// Evaluate every target once.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        for target in &self.targets {
            match self.publish_for(target).await {
                Ok(()) => report.published += 1,
                Err(e) => {
                    warn!(
                        workload = %target.workload,
                        namespace = %target.namespace,
                        error = %e,
                        "skipping target this cycle"
                    );
                    report.skipped += 1;
                }
            }
        }
        report
    }

    async fn publish_for(&self, target: &Target) -> Result<(), RecommendError> {
        let created = self.recommend(target).await?;
        info!(
            recommendation = %created.id,
            workload = %created.workload_ref,
            namespace = %created.namespace,
            cpu = ?created.suggested_resources.get("cpu"),
            memory = ?created.suggested_resources.get("memory"),
            savings = created.estimated_monthly_savings,
            "sending recommendation"
        );
        publish_with_retry(
            self.publisher.as_ref(),
            Event::Created(created.clone()),
            &self.retry,
        )
        .await?;
        if let Some(metrics) = &self.metrics {
            metrics
                .record_created(&created.namespace, created.estimated_monthly_savings)
                .await;
        }
        self.archive(&created).await;
        Ok(())
    }

    async fn archive(&self, created: &RecommendationCreated) {
        let Some(reports) = &self.reports else {
            return;
        };
        let report = RecommendationReport {
            id: uuid::Uuid::new_v4().to_string(),
            recommendation_id: created.id.clone(),
            workload_ref: created.workload_ref.clone(),
            namespace: created.namespace.clone(),
            current_resources: created.current_resources.clone(),
            suggested_resources: created.suggested_resources.clone(),
            estimated_monthly_savings: created.estimated_monthly_savings,
            currency: created.currency.clone(),
            generated_at: epoch_secs(),
        };
        match reports.put(&report).await {
            Ok(location) => debug!(recommendation = %created.id, %location, "report archived"),
            Err(e) => warn!(recommendation = %created.id, error = %e, "failed to archive report"),
        }
    }

    /// Run a cycle now and then every `interval` until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            targets = self.targets.len(),
            interval_secs = interval.as_secs(),
            "recommender starting"
        );
        loop {
            let report = self.run_cycle().await;
            debug!(published = report.published, skipped = report.skipped, "recommender cycle");

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    debug!("recommender shutting down");
                    break;
                }
            }
        }
    }
}
