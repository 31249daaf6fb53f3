//! Stage assembly on the in-process transport.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use finops_bus::{EventHandler, EventPublisher, InMemoryBus, RetryPolicy, run_consumer};
use finops_core::{CostModel, Event, FinopsConfig, Topic};
use finops_gitops::{ApplyCoordinator, GitSettings, GitWorkspace, PullRequestHost, SimulatedHost};
use finops_metrics::MetricsCollector;
use finops_policy::{PolicyEngine, RecommendationListener};
use finops_recommender::{
    FsReportStore, PrometheusClient, Recommender, ReplicaScheduler, ScheduledScaling, Target,
};
use finops_state::StateStore;
use finops_sync::{ClusterClient, KubeApiClient, ReconcilerSettings, SyncReconciler};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const POLICY_GROUP: &str = "policy-engine";
pub const GITOPS_GROUP: &str = "gitops-bot";
pub const SYNC_GROUP: &str = "sync-monitor";
pub const AUDIT_GROUP: &str = "audit-log";

/// How often the replica scheduler checks the clock.
const SCHEDULE_CHECK_INTERVAL: Duration = Duration::from_secs(15);

pub struct GitopsStage {
    pub workspace: GitWorkspace,
    pub manifest_root: PathBuf,
    pub host: Arc<dyn PullRequestHost>,
}

pub struct SyncStage {
    pub cluster: Arc<dyn ClusterClient>,
    pub settings: ReconcilerSettings,
    pub interval: Duration,
}

pub struct RecommenderStage {
    pub recommender: Recommender,
    pub interval: Duration,
}

pub struct SchedulerStage {
    pub scheduler: ReplicaScheduler,
    pub interval: Duration,
}

/// Everything the pipeline needs, built before any task starts.
pub struct Stages {
    pub store: StateStore,
    pub bus: InMemoryBus,
    pub retry: RetryPolicy,
    pub cost: CostModel,
    /// `None` disables applying; approvals are still tracked.
    pub gitops: Option<GitopsStage>,
    pub sync: SyncStage,
    pub recommender: Option<RecommenderStage>,
    pub scheduler: Option<SchedulerStage>,
    pub metrics: Arc<MetricsCollector>,
    /// `None` disables the `/metrics` endpoint.
    pub metrics_addr: Option<SocketAddr>,
}

impl Stages {
    /// Build production adapters from the config file.
    pub fn from_config(config: &FinopsConfig) -> anyhow::Result<Self> {
        let store = StateStore::open(&config.store.path)
            .with_context(|| format!("opening store at {}", config.store.path.display()))?;
        info!(path = %config.store.path.display(), "state store opened");

        for policy in &config.policies {
            store.put_policy(policy)?;
            info!(policy = %policy.name, namespace = ?policy.namespace, "policy installed");
        }

        let bus = InMemoryBus::new();
        let retry = RetryPolicy::from_config(&config.bus);
        let metrics = Arc::new(MetricsCollector::new());
        let listen_addr = &config.metrics.listen_addr;
        let metrics_addr = if listen_addr.is_empty() {
            None
        } else {
            let addr: SocketAddr = listen_addr
                .parse()
                .with_context(|| format!("invalid metrics.listen_addr {listen_addr:?}"))?;
            Some(addr)
        };

        let gitops = if config.gitops.url.is_empty() {
            warn!("gitops.url not set, approved recommendations will not be applied");
            None
        } else {
            let settings = GitSettings::from_config(&config.gitops);
            let pr_base = config
                .gitops
                .pr_base_url
                .clone()
                .unwrap_or_else(|| config.gitops.url.clone());
            Some(GitopsStage {
                workspace: GitWorkspace::new(settings),
                manifest_root: config.gitops.manifest_root.clone(),
                host: Arc::new(SimulatedHost::new(&pr_base)),
            })
        };

        let cluster = KubeApiClient::from_config(&config.sync).context("building cluster client")?;
        let sync = SyncStage {
            cluster: Arc::new(cluster),
            settings: ReconcilerSettings::from_config(&config.sync),
            interval: Duration::from_secs(config.sync.interval_secs.max(1)),
        };

        let recommender = if config.recommender.targets.is_empty() {
            None
        } else {
            let targets = config
                .recommender
                .targets
                .iter()
                .map(Target::from_config)
                .collect::<Result<Vec<_>, _>>()?;
            let usage = PrometheusClient::new(
                &config.recommender.prometheus_url,
                Duration::from_secs(config.recommender.query_timeout_secs.max(1)),
            )?;
            let mut recommender = Recommender::new(
                Arc::new(usage),
                Arc::new(bus.clone()),
                retry.clone(),
                config.pricing,
                &config.recommender.currency,
                targets,
            )
            .with_metrics(metrics.clone());
            if let Some(dir) = &config.recommender.report_dir {
                recommender = recommender.with_reports(Arc::new(FsReportStore::new(dir)));
            }
            Some(RecommenderStage {
                recommender,
                interval: Duration::from_secs(config.recommender.interval_secs.max(1)),
            })
        };

        let scheduler = if config.recommender.schedules.is_empty() {
            None
        } else {
            let entries = config
                .recommender
                .schedules
                .iter()
                .map(ScheduledScaling::from_config)
                .collect::<Result<Vec<_>, _>>()?;
            Some(SchedulerStage {
                scheduler: ReplicaScheduler::new(
                    Arc::new(bus.clone()),
                    retry.clone(),
                    &config.recommender.currency,
                    entries,
                ),
                interval: SCHEDULE_CHECK_INTERVAL,
            })
        };

        Ok(Self {
            store,
            bus,
            retry,
            cost: config.pricing,
            gitops,
            sync,
            recommender,
            scheduler,
            metrics,
            metrics_addr,
        })
    }
}

/// Logs terminal outcomes so every recommendation's fate is visible.
struct OutcomeLogger;

#[async_trait]
impl EventHandler for OutcomeLogger {
    type Error = Infallible;

    async fn handle(&self, event: &Event) -> Result<(), Infallible> {
        match event {
            Event::Violated(e) => info!(
                recommendation = %e.recommendation_id,
                policy = %e.policy_name,
                reason = %e.reason,
                "recommendation rejected"
            ),
            Event::Applied(e) => info!(
                recommendation = %e.recommendation_id,
                workload = %e.workload_ref,
                namespace = %e.namespace,
                "change applied"
            ),
            Event::Failed(e) => warn!(
                recommendation = %e.recommendation_id,
                error = %e.error_message,
                "change failed"
            ),
            _ => {}
        }
        Ok(())
    }
}

/// Running stages.
pub struct Pipeline {
    bus: InMemoryBus,
    metrics: Arc<MetricsCollector>,
    reconciler: Arc<SyncReconciler>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Pipeline {
    pub async fn start(stages: Stages) -> anyhow::Result<Self> {
        let Stages {
            store,
            bus,
            retry,
            cost,
            gitops,
            sync,
            recommender,
            scheduler,
            metrics,
            metrics_addr,
        } = stages;
        let publisher: Arc<dyn EventPublisher> = Arc::new(bus.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        // Policy listener.
        let listener = Arc::new(
            RecommendationListener::new(
                store.clone(),
                PolicyEngine::new(store.clone(), cost),
                publisher.clone(),
                retry.clone(),
            )
            .with_metrics(metrics.clone()),
        );
        let sub = bus.subscribe(Topic::RecommendationCreated, POLICY_GROUP).await?;
        handles.push(tokio::spawn(run_consumer(
            sub,
            listener,
            retry.clone(),
            shutdown_rx.clone(),
        )));

        // Apply coordinator.
        if let Some(gitops) = gitops {
            let coordinator = Arc::new(ApplyCoordinator::new(
                gitops.workspace,
                gitops.manifest_root,
                gitops.host,
                publisher.clone(),
                retry.clone(),
            ));
            let sub = bus.subscribe(Topic::RecommendationApproved, GITOPS_GROUP).await?;
            handles.push(tokio::spawn(run_consumer(
                sub,
                coordinator,
                retry.clone(),
                shutdown_rx.clone(),
            )));
        }

        // Sync reconciler: both registration paths plus the tick loop.
        let reconciler = Arc::new(
            SyncReconciler::new(sync.cluster, publisher.clone(), retry.clone(), sync.settings)
                .with_store(store.clone()),
        );
        for topic in [Topic::RecommendationApproved, Topic::PrCreated] {
            let sub = bus.subscribe(topic, SYNC_GROUP).await?;
            handles.push(tokio::spawn(run_consumer(
                sub,
                reconciler.clone(),
                retry.clone(),
                shutdown_rx.clone(),
            )));
        }
        {
            let reconciler = reconciler.clone();
            let shutdown = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                reconciler.run(sync.interval, shutdown).await;
            }));
        }

        // Terminal outcomes.
        let logger = Arc::new(OutcomeLogger);
        for topic in [Topic::PolicyViolated, Topic::ChangeApplied, Topic::ChangeFailed] {
            let sub = bus.subscribe(topic, AUDIT_GROUP).await?;
            handles.push(tokio::spawn(run_consumer(
                sub,
                logger.clone(),
                retry.clone(),
                shutdown_rx.clone(),
            )));
        }

        // Recommender.
        if let Some(stage) = recommender {
            let shutdown = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                stage.recommender.run(stage.interval, shutdown).await;
            }));
        }

        if let Some(stage) = scheduler {
            let shutdown = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                stage.scheduler.run(stage.interval, shutdown).await;
            }));
        }

        if let Some(addr) = metrics_addr {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding metrics endpoint on {addr}"))?;
            handles.push(tokio::spawn(crate::metrics::serve(
                listener,
                metrics.clone(),
                shutdown_rx.clone(),
            )));
        }

        info!(tasks = handles.len(), "pipeline started");
        Ok(Self {
            bus,
            metrics,
            reconciler,
            shutdown_tx,
            handles,
        })
    }

    /// Transport the stages are attached to.
    pub fn bus(&self) -> &InMemoryBus {
        &self.bus
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn reconciler(&self) -> &Arc<SyncReconciler> {
        &self.reconciler
    }

    /// Signal every task to stop and wait for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.bus.close();
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("pipeline stopped");
    }
}
