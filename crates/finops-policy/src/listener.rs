//! Recommendation listener — turns created events into approved or
//! policy-violated events.
//!
//! The store record is written before the outbound event is published. If
//! the publish is lost, the created event is redelivered, the listener
//! finds the existing record and publishes its outcome again.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use finops_bus::{BusError, EventHandler, EventPublisher, RetryPolicy, Retryable, publish_with_retry};
use finops_core::event::{PolicyViolated, RecommendationApproved, RecommendationCreated};
use finops_core::{Event, Recommendation, RecommendationStatus, TransitionError};
use finops_metrics::{Decision, MetricsCollector};
use finops_state::{StateError, StateStore};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::engine::PolicyEngine;

/// Recorded as `approved_by` on approved events.
pub const APPROVER: &str = "policy-engine";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerOutcome {
    Approved,
    Rejected { policy_name: String, reason: String },
    /// A record with this id already existed; nothing was re-validated.
    Duplicate,
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("store error: {0}")]
    State(#[from] StateError),

    #[error("publish failed: {0}")]
    Publish(#[from] BusError),

    #[error(transparent)]
    Lifecycle(#[from] TransitionError),
}

impl Retryable for ListenerError {
    fn is_retryable(&self) -> bool {
        match self {
            ListenerError::State(StateError::InvalidTransition(_)) => false,
            ListenerError::State(_) => true,
            ListenerError::Publish(BusError::Closed) => false,
            ListenerError::Publish(_) => true,
            ListenerError::Lifecycle(_) => false,
        }
    }
}

/// Consumes created events and decides their fate.
pub struct RecommendationListener {
    store: StateStore,
    engine: PolicyEngine,
    publisher: Arc<dyn EventPublisher>,
    retry: RetryPolicy,
    metrics: Option<Arc<MetricsCollector>>,
    /// One lock per namespace with a delivery in flight; validate and
    /// persist run under it.
    namespace_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RecommendationListener {
    pub fn new(
        store: StateStore,
        engine: PolicyEngine,
        publisher: Arc<dyn EventPublisher>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            engine,
            publisher,
            retry,
            metrics: None,
            namespace_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Count approvals and rejections per namespace.
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn handle_created(
        &self,
        event: &RecommendationCreated,
    ) -> Result<ListenerOutcome, ListenerError> {
        if let Some(existing) = self.store.get_recommendation(&event.id)? {
            info!(
                recommendation = %event.id,
                status = %existing.status,
                "duplicate created event"
            );
            self.republish(&existing).await?;
            return Ok(ListenerOutcome::Duplicate);
        }

        let decided = {
            let lock = self.namespace_lock(&event.namespace).await;
            let decided = {
                let _guard = lock.lock().await;
                self.decide(event)
            };
            drop(lock);
            self.release_namespace_lock(&event.namespace).await;
            decided?
        };
        let Some(rec) = decided else {
            return Ok(ListenerOutcome::Duplicate);
        };

        let outcome = match rec.status {
            RecommendationStatus::Approved => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_decision(&rec.namespace, Decision::Approved).await;
                }
                info!(
                    recommendation = %rec.id,
                    namespace = %rec.namespace,
                    workload = %rec.workload_ref,
                    savings = rec.estimated_monthly_savings,
                    "recommendation approved"
                );
                ListenerOutcome::Approved
            }
            _ => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_decision(&rec.namespace, Decision::Rejected).await;
                }
                info!(
                    recommendation = %rec.id,
                    namespace = %rec.namespace,
                    policy = rec.rejected_by_policy.as_deref().unwrap_or_default(),
                    reason = rec.rejection_reason.as_deref().unwrap_or_default(),
                    "recommendation rejected"
                );
                ListenerOutcome::Rejected {
                    policy_name: rec.rejected_by_policy.clone().unwrap_or_default(),
                    reason: rec.rejection_reason.clone().unwrap_or_default(),
                }
            }
        };

        self.publish_outcome(&rec).await?;
        Ok(outcome)
    }

    /// Validate and persist under the namespace lock. `None` when a
    /// concurrent delivery of the same event stored its record first.
    fn decide(&self, event: &RecommendationCreated) -> Result<Option<Recommendation>, ListenerError> {
        let mut rec = Recommendation::from_created(event);
        let result = self.engine.validate(&rec)?;
        if result.valid {
            rec.approve()?;
        } else {
            rec.reject(
                result.reason.as_deref().unwrap_or_default(),
                result.policy_name.as_deref().unwrap_or_default(),
            )?;
        }

        if !self.store.insert_recommendation_if_absent(&rec)? {
            // That delivery publishes its own outcome.
            debug!(recommendation = %rec.id, "lost insert race, skipping publish");
            return Ok(None);
        }
        Ok(Some(rec))
    }

    /// Publish the outbound event again for a record that already decided.
    async fn republish(&self, rec: &Recommendation) -> Result<(), ListenerError> {
        match rec.status {
            RecommendationStatus::Approved | RecommendationStatus::Rejected => {
                self.publish_outcome(rec).await
            }
            _ => Ok(()),
        }
    }

    async fn publish_outcome(&self, rec: &Recommendation) -> Result<(), ListenerError> {
        let event = match rec.status {
            RecommendationStatus::Approved => approved_event(rec),
            RecommendationStatus::Rejected => violated_event(rec),
            _ => return Ok(()),
        };
        if let Err(e) = publish_with_retry(self.publisher.as_ref(), event, &self.retry).await {
            warn!(recommendation = %rec.id, error = %e, "outcome publish failed");
            return Err(e.into());
        }
        Ok(())
    }

    async fn namespace_lock(&self, namespace: &str) -> Arc<Mutex<()>> {
        let mut locks = self.namespace_locks.lock().await;
        locks
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the namespace's lock once no delivery holds or waits on it.
    /// Clones are only handed out under the map lock, so a count of one
    /// means the map holds the last reference.
    async fn release_namespace_lock(&self, namespace: &str) {
        let mut locks = self.namespace_locks.lock().await;
        if locks
            .get(namespace)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(namespace);
        }
    }
}

#[async_trait]
impl EventHandler for RecommendationListener {
    type Error = ListenerError;

    async fn handle(&self, event: &Event) -> Result<(), ListenerError> {
        match event {
            Event::Created(created) => self.handle_created(created).await.map(|_| ()),
            other => {
                debug!(topic = %other.topic(), "listener ignoring event");
                Ok(())
            }
        }
    }
}

fn approved_event(rec: &Recommendation) -> Event {
    Event::Approved(RecommendationApproved {
        recommendation_id: rec.id.clone(),
        workload_ref: rec.workload_ref.clone(),
        namespace: rec.namespace.clone(),
        approved_resources: rec.suggested_resources.clone(),
        replicas: rec.replicas,
        estimated_monthly_savings: rec.estimated_monthly_savings,
        currency: rec.currency.clone(),
        approved_by: Some(APPROVER.to_string()),
        approved_at: rec.updated_at,
    })
}

fn violated_event(rec: &Recommendation) -> Event {
    Event::Violated(PolicyViolated {
        recommendation_id: rec.id.clone(),
        policy_name: rec.rejected_by_policy.clone().unwrap_or_default(),
        reason: rec.rejection_reason.clone().unwrap_or_default(),
        violated_at: rec.updated_at,
    })
}
