//! Sync reconciler: polls the cluster until an approved change lands or
//! its verification window runs out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use finops_bus::{EventHandler, EventPublisher, RetryPolicy, publish_with_retry};
use finops_core::config::SyncConfig;
use finops_core::event::{ChangeApplied, ChangeFailed, PrCreated, RecommendationApproved};
use finops_core::quantity::parse_quantity;
use finops_core::{
    Event, Recommendation, RecommendationStatus, ResourceKind, ResourceSet, WorkloadRef,
    epoch_secs,
};
use finops_state::{StateError, StateStore};
use tokio::sync::{RwLock, watch};
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterClient, WorkloadState};
use crate::error::{ClusterError, SyncError};

/// Bounds on the pending set and on each poll.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub verification_timeout: Duration,
    pub max_pending: usize,
    pub query_timeout: Duration,
}

impl ReconcilerSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            verification_timeout: Duration::from_secs(config.verification_timeout_secs),
            max_pending: config.max_pending,
            query_timeout: Duration::from_secs(config.query_timeout_secs.max(1)),
        }
    }
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

/// One change waiting to be observed in the cluster.
#[derive(Debug, Clone)]
pub struct PendingVerification {
    pub recommendation_id: String,
    pub workload_ref: WorkloadRef,
    pub namespace: String,
    pub target_resources: ResourceSet,
    pub replicas: Option<u32>,
    pub started_at: Instant,
    pub deadline: Instant,
    pub pr_url: Option<String>,
    pub branch_name: Option<String>,
    /// Failed cluster queries so far.
    pub errors: u32,
}

impl PendingVerification {
    fn new(
        recommendation_id: &str,
        workload_ref: &WorkloadRef,
        namespace: &str,
        target_resources: &ResourceSet,
        replicas: Option<u32>,
        window: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            recommendation_id: recommendation_id.to_string(),
            workload_ref: workload_ref.clone(),
            namespace: namespace.to_string(),
            target_resources: target_resources.clone(),
            replicas,
            started_at: now,
            deadline: now + window,
            pr_url: None,
            branch_name: None,
            errors: 0,
        }
    }

    fn from_approved(event: &RecommendationApproved, window: Duration) -> Self {
        Self::new(
            &event.recommendation_id,
            &event.workload_ref,
            &event.namespace,
            &event.approved_resources,
            event.replicas,
            window,
        )
    }

    fn from_record(rec: &Recommendation, window: Duration) -> Self {
        Self::new(
            &rec.id,
            &rec.workload_ref,
            &rec.namespace,
            &rec.suggested_resources,
            rec.replicas,
            window,
        )
    }

    /// Whether the cluster runs the target. Every tracked field in the
    /// target must match.
    pub fn is_synchronized(&self, state: &WorkloadState) -> bool {
        if let Some(replicas) = self.replicas
            && state.replicas != Some(replicas)
        {
            return false;
        }
        self.target_resources
            .iter()
            .filter_map(|(key, want)| ResourceKind::from_key(key).map(|kind| (key, kind, want)))
            .all(|(key, kind, want)| {
                state
                    .requests
                    .get(key)
                    .is_some_and(|have| quantities_equal(want, have, kind))
            })
    }
}

fn quantities_equal(want: &str, have: &str, kind: ResourceKind) -> bool {
    if want.trim() == have.trim() {
        return true;
    }
    match (parse_quantity(want, kind), parse_quantity(have, kind)) {
        (Ok(a), Ok(b)) => (a - b).abs() <= f64::EPSILON * a.abs().max(b.abs()).max(1.0),
        _ => false,
    }
}

/// Result of registering a verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Registered,
    AlreadyPending,
    /// An existing entry got its PR details and a fresh window.
    Updated,
    /// Nothing to track (unknown or already settled recommendation).
    Ignored,
    AtCapacity,
}

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub applied: usize,
    pub failed: usize,
    pub pending: usize,
    pub errors: usize,
}

enum Check {
    Synchronized,
    Mismatch,
    Error(String),
}

pub struct SyncReconciler {
    cluster: Arc<dyn ClusterClient>,
    publisher: Arc<dyn EventPublisher>,
    retry: RetryPolicy,
    settings: ReconcilerSettings,
    store: Option<StateStore>,
    pending: Arc<RwLock<HashMap<String, PendingVerification>>>,
}

impl SyncReconciler {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        publisher: Arc<dyn EventPublisher>,
        retry: RetryPolicy,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            cluster,
            publisher,
            retry,
            settings,
            store: None,
            pending: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Keep stored records in step with verification outcomes.
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    pub async fn pending(&self, id: &str) -> Option<PendingVerification> {
        self.pending.read().await.get(id).cloned()
    }

    /// Start verifying an approved change. Never blocks on the cluster.
    ///
    /// With a store attached, a recommendation whose record has already
    /// left APPROVED is not tracked again.
    pub async fn register_approved(
        &self,
        event: &RecommendationApproved,
    ) -> Result<Registration, SyncError> {
        let id = &event.recommendation_id;
        if let Some(store) = &self.store
            && let Some(rec) = store.get_recommendation(id)?
            && rec.status != RecommendationStatus::Approved
        {
            debug!(recommendation = %id, status = ?rec.status, "recommendation already settled");
            return Ok(Registration::Ignored);
        }
        let entry = PendingVerification::from_approved(event, self.settings.verification_timeout);
        Ok(self.insert(entry).await)
    }

    /// Attach PR details and restart the window; the change cannot land
    /// before the PR exists.
    pub async fn register_pr(&self, event: &PrCreated) -> Result<Registration, SyncError> {
        let id = &event.recommendation_id;
        {
            let mut pending = self.pending.write().await;
            if let Some(entry) = pending.get_mut(id) {
                entry.pr_url = Some(event.pr_url.clone());
                entry.branch_name = Some(event.branch_name.clone());
                entry.deadline = Instant::now() + self.settings.verification_timeout;
                info!(recommendation = %id, pr_url = %event.pr_url, "verification window restarted");
                return Ok(Registration::Updated);
            }
        }

        let Some(store) = &self.store else {
            warn!(recommendation = %id, "pr created for unknown recommendation, ignoring");
            return Ok(Registration::Ignored);
        };
        let rec = match store.get_recommendation(id)? {
            Some(rec) if rec.status == RecommendationStatus::Approved => rec,
            Some(rec) => {
                debug!(recommendation = %id, status = ?rec.status, "recommendation already settled");
                return Ok(Registration::Ignored);
            }
            None => {
                warn!(recommendation = %id, "pr created for unknown recommendation, ignoring");
                return Ok(Registration::Ignored);
            }
        };

        let mut entry = PendingVerification::from_record(&rec, self.settings.verification_timeout);
        entry.pr_url = Some(event.pr_url.clone());
        entry.branch_name = Some(event.branch_name.clone());
        Ok(self.insert(entry).await)
    }

    async fn insert(&self, entry: PendingVerification) -> Registration {
        let mut pending = self.pending.write().await;
        if pending.contains_key(&entry.recommendation_id) {
            debug!(recommendation = %entry.recommendation_id, "already pending");
            return Registration::AlreadyPending;
        }
        if pending.len() >= self.settings.max_pending {
            warn!(
                recommendation = %entry.recommendation_id,
                max = self.settings.max_pending,
                "pending verification set full"
            );
            return Registration::AtCapacity;
        }
        info!(
            recommendation = %entry.recommendation_id,
            workload = %entry.workload_ref,
            namespace = %entry.namespace,
            "started monitoring sync"
        );
        pending.insert(entry.recommendation_id.clone(), entry);
        Registration::Registered
    }

    /// One pass over a snapshot of the pending set.
    pub async fn tick(&self) -> TickReport {
        let snapshot: Vec<PendingVerification> =
            self.pending.read().await.values().cloned().collect();
        let mut report = TickReport::default();
        if !snapshot.is_empty() {
            debug!(count = snapshot.len(), "verifying pending changes");
        }

        for entry in snapshot {
            let id = entry.recommendation_id.clone();
            match self.check(&entry).await {
                Check::Synchronized => match self.settle_applied(&entry).await {
                    Ok(()) => report.applied += 1,
                    Err(e) => {
                        error!(recommendation = %id, error = %e, "failed to publish applied event");
                        report.errors += 1;
                    }
                },
                check => {
                    if let Check::Error(reason) = &check {
                        warn!(recommendation = %id, error = %reason, "cluster sync check failed");
                        report.errors += 1;
                        if let Some(e) = self.pending.write().await.get_mut(&id) {
                            e.errors += 1;
                        }
                    }
                    if Instant::now() >= entry.deadline {
                        match self.settle_expired(&id).await {
                            Ok(true) => report.failed += 1,
                            Ok(false) => {}
                            Err(e) => {
                                error!(recommendation = %id, error = %e, "failed to publish failed event");
                                report.errors += 1;
                            }
                        }
                    }
                }
            }
        }

        report.pending = self.pending.read().await.len();
        report
    }

    async fn check(&self, entry: &PendingVerification) -> Check {
        let query = self.cluster.workload_state(
            &entry.namespace,
            &entry.workload_ref.kind,
            &entry.workload_ref.name,
        );
        match tokio::time::timeout(self.settings.query_timeout, query).await {
            Ok(Ok(Some(state))) if entry.is_synchronized(&state) => Check::Synchronized,
            Ok(Ok(Some(state))) => {
                debug!(
                    recommendation = %entry.recommendation_id,
                    replicas = ?state.replicas,
                    requests = ?state.requests,
                    "not yet synchronized"
                );
                Check::Mismatch
            }
            Ok(Ok(None)) => Check::Error(format!(
                "{} not found in namespace {}",
                entry.workload_ref, entry.namespace
            )),
            Ok(Err(e)) => Check::Error(e.to_string()),
            Err(_) => Check::Error(
                ClusterError::Timeout {
                    secs: self.settings.query_timeout.as_secs(),
                }
                .to_string(),
            ),
        }
    }

    async fn settle_applied(&self, entry: &PendingVerification) -> Result<(), SyncError> {
        let event = Event::Applied(ChangeApplied {
            recommendation_id: entry.recommendation_id.clone(),
            workload_ref: entry.workload_ref.clone(),
            namespace: entry.namespace.clone(),
            applied_resources: entry.target_resources.clone(),
            replicas: entry.replicas,
            applied_at: epoch_secs(),
        });
        publish_with_retry(self.publisher.as_ref(), event, &self.retry).await?;
        self.pending.write().await.remove(&entry.recommendation_id);
        info!(
            recommendation = %entry.recommendation_id,
            workload = %entry.workload_ref,
            elapsed_secs = entry.started_at.elapsed().as_secs(),
            "change applied in cluster"
        );
        if let Some(store) = &self.store {
            record_outcome(&entry.recommendation_id, store.mark_applied(&entry.recommendation_id));
        }
        Ok(())
    }

    /// Fail the entry if its current deadline has passed. The deadline is
    /// read under the write lock, so a window restarted by a PR during the
    /// tick is honoured. Returns whether the entry was failed.
    async fn settle_expired(&self, id: &str) -> Result<bool, SyncError> {
        let entry = {
            let mut pending = self.pending.write().await;
            match pending.get(id) {
                Some(entry) if Instant::now() >= entry.deadline => pending.remove(id),
                _ => None,
            }
        };
        let Some(entry) = entry else {
            debug!(recommendation = %id, "verification window still open");
            return Ok(false);
        };

        let message = format!(
            "verification timed out after {}s",
            self.settings.verification_timeout.as_secs()
        );
        let event = Event::Failed(ChangeFailed {
            recommendation_id: entry.recommendation_id.clone(),
            error_message: message.clone(),
            failed_at: epoch_secs(),
        });
        if let Err(e) = publish_with_retry(self.publisher.as_ref(), event, &self.retry).await {
            self.pending
                .write()
                .await
                .entry(entry.recommendation_id.clone())
                .or_insert(entry);
            return Err(e.into());
        }
        warn!(
            recommendation = %entry.recommendation_id,
            workload = %entry.workload_ref,
            errors = entry.errors,
            "{message}"
        );
        if let Some(store) = &self.store {
            record_outcome(
                &entry.recommendation_id,
                store.mark_failed(&entry.recommendation_id, &message),
            );
        }
        Ok(true)
    }

    /// Tick every `interval` until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "sync reconciler starting");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let report = self.tick().await;
                    if report.applied + report.failed + report.errors > 0 {
                        info!(
                            applied = report.applied,
                            failed = report.failed,
                            errors = report.errors,
                            pending = report.pending,
                            "reconcile pass"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    debug!("sync reconciler shutting down");
                    break;
                }
            }
        }
    }
}

fn record_outcome(id: &str, result: Result<Recommendation, StateError>) {
    match result {
        Ok(rec) => debug!(recommendation = %id, status = ?rec.status, "record updated"),
        Err(e) => warn!(recommendation = %id, error = %e, "could not update stored record"),
    }
}

#[async_trait]
impl EventHandler for SyncReconciler {
    type Error = SyncError;

    async fn handle(&self, event: &Event) -> Result<(), SyncError> {
        match event {
            Event::Approved(approved) => match self.register_approved(approved).await? {
                Registration::AtCapacity => Err(SyncError::AtCapacity {
                    max: self.settings.max_pending,
                }),
                _ => Ok(()),
            },
            Event::PrCreated(pr) => match self.register_pr(pr).await? {
                Registration::AtCapacity => Err(SyncError::AtCapacity {
                    max: self.settings.max_pending,
                }),
                _ => Ok(()),
            },
            other => {
                debug!(topic = %other.topic(), "reconciler ignoring event");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use finops_bus::{InMemoryBus, Retryable, Subscription};
    use finops_core::Topic;
    use finops_core::event::RecommendationCreated;

    use crate::error::ClusterResult;

    /// Cluster whose answers are set per workload name.
    #[derive(Default)]
    struct FakeCluster {
        workloads: Mutex<HashMap<String, ClusterResult<Option<WorkloadState>>>>,
        delay: Option<Duration>,
    }

    impl FakeCluster {
        fn set(&self, name: &str, state: ClusterResult<Option<WorkloadState>>) {
            self.workloads.lock().unwrap().insert(name.to_string(), state);
        }
    }

    #[async_trait]
    impl ClusterClient for FakeCluster {
        async fn workload_state(
            &self,
            _namespace: &str,
            _kind: &str,
            name: &str,
        ) -> ClusterResult<Option<WorkloadState>> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match self.workloads.lock().unwrap().get(name) {
                Some(Ok(state)) => Ok(state.clone()),
                Some(Err(_)) => Err(ClusterError::Status {
                    status: 503,
                    url: name.to_string(),
                }),
                None => Ok(None),
            }
        }
    }

    fn resources(cpu: &str, memory: &str) -> ResourceSet {
        [
            ("cpu".to_string(), cpu.to_string()),
            ("memory".to_string(), memory.to_string()),
        ]
        .into()
    }

    fn running(replicas: u32, cpu: &str, memory: &str) -> ClusterResult<Option<WorkloadState>> {
        Ok(Some(WorkloadState {
            replicas: Some(replicas),
            requests: resources(cpu, memory),
        }))
    }

    fn approved(id: &str, workload: &str) -> RecommendationApproved {
        RecommendationApproved {
            recommendation_id: id.to_string(),
            workload_ref: WorkloadRef::deployment(workload),
            namespace: "dev".to_string(),
            approved_resources: resources("200m", "256Mi"),
            replicas: Some(2),
            estimated_monthly_savings: 15.0,
            currency: "USD".to_string(),
            approved_by: Some("policy-engine".to_string()),
            approved_at: 1,
        }
    }

    fn pr(id: &str) -> PrCreated {
        PrCreated {
            recommendation_id: id.to_string(),
            pr_url: "https://git.example.com/pull/new/x".to_string(),
            repository: "repo".to_string(),
            branch_name: "fix/rightsize-x".to_string(),
            created_at: 2,
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            publish_attempts: 1,
        }
    }

    async fn setup(
        cluster: Arc<FakeCluster>,
        settings: ReconcilerSettings,
    ) -> (SyncReconciler, Subscription, Subscription) {
        let bus = InMemoryBus::new();
        let applied = bus.subscribe(Topic::ChangeApplied, "test").await.unwrap();
        let failed = bus.subscribe(Topic::ChangeFailed, "test").await.unwrap();
        let reconciler = SyncReconciler::new(cluster, Arc::new(bus), fast_retry(), settings);
        (reconciler, applied, failed)
    }

    fn settings(timeout: Duration, max_pending: usize) -> ReconcilerSettings {
        ReconcilerSettings {
            verification_timeout: timeout,
            max_pending,
            query_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn matching_requires_every_tracked_field() {
        let entry = PendingVerification::from_approved(&approved("r", "nginx"), Duration::ZERO);
        let state = |replicas, cpu: &str, mem: &str| WorkloadState {
            replicas: Some(replicas),
            requests: resources(cpu, mem),
        };
        assert!(entry.is_synchronized(&state(2, "200m", "256Mi")));
        assert!(entry.is_synchronized(&state(2, "0.2", "268435456")));
        assert!(!entry.is_synchronized(&state(3, "200m", "256Mi")));
        assert!(!entry.is_synchronized(&state(2, "250m", "256Mi")));
        assert!(!entry.is_synchronized(&state(2, "200m", "512Mi")));
        assert!(!entry.is_synchronized(&WorkloadState {
            replicas: Some(2),
            requests: [("cpu".to_string(), "200m".to_string())].into(),
        }));
    }

    #[test]
    fn replicas_are_ignored_when_not_targeted() {
        let mut event = approved("r", "nginx");
        event.replicas = None;
        let entry = PendingVerification::from_approved(&event, Duration::ZERO);
        assert!(entry.is_synchronized(&WorkloadState {
            replicas: Some(7),
            requests: resources("200m", "256Mi"),
        }));
    }

    #[tokio::test]
    async fn match_emits_one_applied_and_removes_entry() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.set("nginx", running(2, "200m", "256Mi"));
        let (reconciler, mut applied, mut failed) =
            setup(cluster, settings(Duration::from_secs(60), 10)).await;

        assert_eq!(
            reconciler.register_approved(&approved("rec-1", "nginx")).await.unwrap(),
            Registration::Registered
        );
        let report = reconciler.tick().await;

        assert_eq!(report.applied, 1);
        assert_eq!(report.pending, 0);
        match applied.try_recv().unwrap().event {
            Event::Applied(e) => {
                assert_eq!(e.recommendation_id, "rec-1");
                assert_eq!(e.replicas, Some(2));
            }
            other => panic!("expected Applied, got {other:?}"),
        }
        assert!(applied.try_recv().is_none());
        assert!(failed.try_recv().is_none());

        // Nothing left to do on the next pass.
        assert_eq!(reconciler.tick().await, TickReport::default());
        assert!(applied.try_recv().is_none());
    }

    #[tokio::test]
    async fn persistent_mismatch_stays_pending() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.set("nginx", running(3, "500m", "512Mi"));
        let (reconciler, mut applied, mut failed) =
            setup(cluster, settings(Duration::from_secs(60), 10)).await;
        reconciler.register_approved(&approved("rec-1", "nginx")).await.unwrap();

        for _ in 0..5 {
            let report = reconciler.tick().await;
            assert_eq!(report.pending, 1);
            assert_eq!(report.applied + report.failed, 0);
        }
        assert!(applied.try_recv().is_none());
        assert!(failed.try_recv().is_none());
    }

    #[tokio::test]
    async fn expired_entry_fails_exactly_once() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.set("nginx", running(3, "500m", "512Mi"));
        let (reconciler, _applied, mut failed) =
            setup(cluster, settings(Duration::ZERO, 10)).await;
        reconciler.register_approved(&approved("rec-1", "nginx")).await.unwrap();

        let report = reconciler.tick().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.pending, 0);
        match failed.try_recv().unwrap().event {
            Event::Failed(e) => {
                assert_eq!(e.recommendation_id, "rec-1");
                assert_eq!(e.error_message, "verification timed out after 0s");
            }
            other => panic!("expected Failed, got {other:?}"),
        }

        reconciler.tick().await;
        assert!(failed.try_recv().is_none());
    }

    #[tokio::test]
    async fn error_on_one_entry_does_not_block_others() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.set(
            "broken",
            Err(ClusterError::Status {
                status: 503,
                url: String::new(),
            }),
        );
        cluster.set("nginx", running(2, "200m", "256Mi"));
        let (reconciler, mut applied, _failed) =
            setup(cluster, settings(Duration::from_secs(60), 10)).await;
        reconciler.register_approved(&approved("rec-bad", "broken")).await.unwrap();
        reconciler.register_approved(&approved("rec-ok", "nginx")).await.unwrap();

        let report = reconciler.tick().await;

        assert_eq!(report.applied, 1);
        assert_eq!(report.errors, 1);
        assert_eq!(report.pending, 1);
        assert_eq!(reconciler.pending("rec-bad").await.unwrap().errors, 1);
        assert_eq!(applied.try_recv().unwrap().event.recommendation_id(), "rec-ok");
    }

    #[tokio::test]
    async fn missing_workload_counts_as_error() {
        let cluster = Arc::new(FakeCluster::default());
        let (reconciler, _applied, _failed) =
            setup(cluster, settings(Duration::from_secs(60), 10)).await;
        reconciler.register_approved(&approved("rec-1", "ghost")).await.unwrap();

        let report = reconciler.tick().await;
        assert_eq!(report.errors, 1);
        assert_eq!(report.pending, 1);
    }

    #[tokio::test]
    async fn slow_query_times_out() {
        let cluster = Arc::new(FakeCluster {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        cluster.set("nginx", running(2, "200m", "256Mi"));
        let (reconciler, _applied, _failed) =
            setup(cluster, settings(Duration::from_secs(60), 10)).await;
        reconciler.register_approved(&approved("rec-1", "nginx")).await.unwrap();

        let report = reconciler.tick().await;
        assert_eq!(report.errors, 1);
        assert_eq!(report.applied, 0);
    }

    #[tokio::test]
    async fn registration_is_idempotent_and_bounded() {
        let cluster = Arc::new(FakeCluster::default());
        let (reconciler, _applied, _failed) =
            setup(cluster, settings(Duration::from_secs(60), 1)).await;

        assert_eq!(
            reconciler.register_approved(&approved("rec-1", "nginx")).await.unwrap(),
            Registration::Registered
        );
        assert_eq!(
            reconciler.register_approved(&approved("rec-1", "nginx")).await.unwrap(),
            Registration::AlreadyPending
        );
        assert_eq!(
            reconciler.register_approved(&approved("rec-2", "api")).await.unwrap(),
            Registration::AtCapacity
        );

        let err = reconciler
            .handle(&Event::Approved(approved("rec-2", "api")))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::AtCapacity { max: 1 }));
        assert!(err.is_retryable());
        assert_eq!(reconciler.pending_count().await, 1);
    }

    #[tokio::test]
    async fn pr_restarts_window_of_known_entry() {
        let cluster = Arc::new(FakeCluster::default());
        let (reconciler, _applied, _failed) =
            setup(cluster, settings(Duration::from_secs(60), 10)).await;
        reconciler.register_approved(&approved("rec-1", "nginx")).await.unwrap();
        let before = reconciler.pending("rec-1").await.unwrap().deadline;

        let registration = reconciler.register_pr(&pr("rec-1")).await.unwrap();

        assert_eq!(registration, Registration::Updated);
        let entry = reconciler.pending("rec-1").await.unwrap();
        assert!(entry.deadline >= before);
        assert_eq!(entry.branch_name.as_deref(), Some("fix/rightsize-x"));
    }

    #[tokio::test]
    async fn pr_without_store_or_entry_is_ignored() {
        let cluster = Arc::new(FakeCluster::default());
        let (reconciler, _applied, _failed) =
            setup(cluster, settings(Duration::from_secs(60), 10)).await;
        assert_eq!(
            reconciler.register_pr(&pr("rec-1")).await.unwrap(),
            Registration::Ignored
        );
        assert_eq!(reconciler.pending_count().await, 0);
    }

    fn stored_approved(store: &StateStore, id: &str) {
        let mut rec = Recommendation::from_created(&RecommendationCreated {
            id: id.to_string(),
            workload_ref: WorkloadRef::deployment("nginx"),
            namespace: "dev".to_string(),
            current_resources: resources("500m", "512Mi"),
            suggested_resources: resources("200m", "256Mi"),
            replicas: Some(2),
            confidence_score: 0.9,
            estimated_monthly_savings: 15.0,
            currency: "USD".to_string(),
            created_at: 1,
        });
        rec.approve().unwrap();
        store.put_recommendation(&rec).unwrap();
    }

    #[tokio::test]
    async fn pr_rebuilds_entry_from_store_and_records_outcome() {
        let store = StateStore::open_in_memory().unwrap();
        stored_approved(&store, "rec-1");
        let cluster = Arc::new(FakeCluster::default());
        cluster.set("nginx", running(2, "200m", "256Mi"));
        let (reconciler, mut applied, _failed) =
            setup(cluster, settings(Duration::from_secs(60), 10)).await;
        let reconciler = reconciler.with_store(store.clone());

        assert_eq!(
            reconciler.register_pr(&pr("rec-1")).await.unwrap(),
            Registration::Registered
        );
        assert_eq!(reconciler.tick().await.applied, 1);
        assert!(applied.try_recv().is_some());
        assert_eq!(
            store.get_recommendation("rec-1").unwrap().unwrap().status,
            RecommendationStatus::Applied
        );
    }

    #[tokio::test]
    async fn timeout_marks_stored_record_failed() {
        let store = StateStore::open_in_memory().unwrap();
        stored_approved(&store, "rec-1");
        let cluster = Arc::new(FakeCluster::default());
        let (reconciler, _applied, _failed) = setup(cluster, settings(Duration::ZERO, 10)).await;
        let reconciler = reconciler.with_store(store.clone());
        reconciler.register_approved(&approved("rec-1", "nginx")).await.unwrap();

        assert_eq!(reconciler.tick().await.failed, 1);
        let rec = store.get_recommendation("rec-1").unwrap().unwrap();
        assert_eq!(rec.status, RecommendationStatus::Failed);
        assert_eq!(
            rec.failure_message.as_deref(),
            Some("verification timed out after 0s")
        );
    }

    #[tokio::test]
    async fn redelivered_approval_after_apply_is_ignored() {
        let store = StateStore::open_in_memory().unwrap();
        stored_approved(&store, "rec-1");
        let cluster = Arc::new(FakeCluster::default());
        cluster.set("nginx", running(2, "200m", "256Mi"));
        let (reconciler, mut applied, _failed) =
            setup(cluster, settings(Duration::from_secs(60), 10)).await;
        let reconciler = reconciler.with_store(store.clone());

        reconciler.register_approved(&approved("rec-1", "nginx")).await.unwrap();
        assert_eq!(reconciler.tick().await.applied, 1);
        assert!(applied.try_recv().is_some());

        assert_eq!(
            reconciler.register_approved(&approved("rec-1", "nginx")).await.unwrap(),
            Registration::Ignored
        );
        assert_eq!(reconciler.tick().await, TickReport::default());
        assert!(applied.try_recv().is_none());
        assert_eq!(
            store.get_recommendation("rec-1").unwrap().unwrap().status,
            RecommendationStatus::Applied
        );
    }

    #[tokio::test]
    async fn redelivered_approval_after_failure_is_ignored() {
        let store = StateStore::open_in_memory().unwrap();
        stored_approved(&store, "rec-1");
        let cluster = Arc::new(FakeCluster::default());
        let (reconciler, mut applied, mut failed) =
            setup(cluster.clone(), settings(Duration::ZERO, 10)).await;
        let reconciler = reconciler.with_store(store.clone());

        reconciler.register_approved(&approved("rec-1", "nginx")).await.unwrap();
        assert_eq!(reconciler.tick().await.failed, 1);
        assert!(failed.try_recv().is_some());

        // The change lands late; a redelivered approval must not flip the
        // failed record to applied.
        cluster.set("nginx", running(2, "200m", "256Mi"));
        let registration = reconciler
            .handle(&Event::Approved(approved("rec-1", "nginx")))
            .await;
        assert!(registration.is_ok());
        assert_eq!(reconciler.pending_count().await, 0);
        assert_eq!(reconciler.tick().await, TickReport::default());
        assert!(applied.try_recv().is_none());
        assert_eq!(
            store.get_recommendation("rec-1").unwrap().unwrap().status,
            RecommendationStatus::Failed
        );
    }

    #[tokio::test]
    async fn window_restarted_during_tick_is_honoured() {
        let cluster = Arc::new(FakeCluster {
            delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        cluster.set("nginx", running(3, "500m", "512Mi"));
        let (reconciler, _applied, mut failed) =
            setup(cluster, settings(Duration::from_millis(300), 10)).await;
        reconciler.register_approved(&approved("rec-1", "nginx")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;

        // The PR arrives while the tick is waiting on the cluster.
        let (report, registration) = tokio::join!(reconciler.tick(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            reconciler.register_pr(&pr("rec-1")).await.unwrap()
        });

        assert_eq!(registration, Registration::Updated);
        assert_eq!(report.failed, 0);
        assert_eq!(report.pending, 1);
        assert!(failed.try_recv().is_none());
        assert!(reconciler.pending("rec-1").await.is_some());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.set("nginx", running(2, "200m", "256Mi"));
        let (reconciler, mut applied, _failed) =
            setup(cluster, settings(Duration::from_secs(60), 10)).await;
        let reconciler = Arc::new(reconciler);
        reconciler.register_approved(&approved("rec-1", "nginx")).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let task = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move { reconciler.run(Duration::from_millis(10), rx).await })
        };

        let delivery = tokio::time::timeout(Duration::from_secs(5), applied.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.event.recommendation_id(), "rec-1");

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
