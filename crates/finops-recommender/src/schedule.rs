//! Replica schedule: fixed-time scale changes such as a nightly sleep
//! and morning wake for non-production workloads.
//!
//! Each firing publishes a created event that carries only a replica
//! count, so it goes through policy, apply and sync like any other
//! recommendation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Local, NaiveDateTime, NaiveTime, Weekday};
use finops_bus::{EventPublisher, RetryPolicy, publish_with_retry};
use finops_core::config::ScheduleConfig;
use finops_core::event::RecommendationCreated;
use finops_core::{Event, ResourceSet, WorkloadRef, epoch_secs};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{RecommendError, ScheduleError};

/// One parsed schedule entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledScaling {
    pub name: String,
    pub namespace: String,
    pub workload: WorkloadRef,
    pub replicas: u32,
    pub at: NaiveTime,
    /// Empty means every day.
    pub days: Vec<Weekday>,
    pub estimated_monthly_savings: f64,
}

impl ScheduledScaling {
    pub fn from_config(config: &ScheduleConfig) -> Result<Self, ScheduleError> {
        let at = NaiveTime::parse_from_str(config.at.trim(), "%H:%M").map_err(|_| {
            ScheduleError::Time {
                name: config.name.clone(),
                value: config.at.clone(),
            }
        })?;
        let days = config
            .days
            .iter()
            .map(|day| {
                day.trim().parse::<Weekday>().map_err(|_| ScheduleError::Weekday {
                    name: config.name.clone(),
                    value: day.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let workload = config
            .workload
            .parse()
            .map_err(|source| ScheduleError::Workload {
                name: config.name.clone(),
                source,
            })?;
        Ok(Self {
            name: config.name.clone(),
            namespace: config.namespace.clone(),
            workload,
            replicas: config.replicas,
            at,
            days,
            estimated_monthly_savings: config.estimated_monthly_savings,
        })
    }

    /// Whether the entry fires at some instant in `(after, until]`.
    pub fn fires_between(&self, after: NaiveDateTime, until: NaiveDateTime) -> bool {
        let mut date = after.date();
        while date <= until.date() {
            let at = date.and_time(self.at);
            if at > after
                && at <= until
                && (self.days.is_empty() || self.days.contains(&date.weekday()))
            {
                return true;
            }
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }
        false
    }
}

/// Publishes scheduled replica changes as they come due.
pub struct ReplicaScheduler {
    publisher: Arc<dyn EventPublisher>,
    retry: RetryPolicy,
    currency: String,
    entries: Vec<ScheduledScaling>,
}

impl ReplicaScheduler {
    pub fn new(
        publisher: Arc<dyn EventPublisher>,
        retry: RetryPolicy,
        currency: &str,
        entries: Vec<ScheduledScaling>,
    ) -> Self {
        Self {
            publisher,
            retry,
            currency: currency.to_string(),
            entries,
        }
    }

    pub fn entries(&self) -> &[ScheduledScaling] {
        &self.entries
    }

    /// A replica-only recommendation for `entry`.
    pub fn event_for(&self, entry: &ScheduledScaling) -> RecommendationCreated {
        RecommendationCreated {
            id: uuid::Uuid::new_v4().to_string(),
            workload_ref: entry.workload.clone(),
            namespace: entry.namespace.clone(),
            current_resources: ResourceSet::new(),
            suggested_resources: ResourceSet::new(),
            replicas: Some(entry.replicas),
            confidence_score: 1.0,
            estimated_monthly_savings: entry.estimated_monthly_savings,
            currency: self.currency.clone(),
            created_at: epoch_secs(),
        }
    }

    /// Publish every entry that fires in `(after, until]`. Returns the
    /// events published.
    pub async fn fire_due(
        &self,
        after: NaiveDateTime,
        until: NaiveDateTime,
    ) -> Vec<RecommendationCreated> {
        let mut published = Vec::new();
        for entry in self.entries.iter().filter(|e| e.fires_between(after, until)) {
            match self.publish(entry).await {
                Ok(created) => published.push(created),
                Err(e) => warn!(schedule = %entry.name, error = %e, "scheduled scaling not sent"),
            }
        }
        published
    }

    async fn publish(&self, entry: &ScheduledScaling) -> Result<RecommendationCreated, RecommendError> {
        let created = self.event_for(entry);
        info!(
            schedule = %entry.name,
            recommendation = %created.id,
            workload = %entry.workload,
            namespace = %entry.namespace,
            replicas = entry.replicas,
            "triggering scheduled scaling"
        );
        publish_with_retry(
            self.publisher.as_ref(),
            Event::Created(created.clone()),
            &self.retry,
        )
        .await?;
        Ok(created)
    }

    /// Check local time every `interval` until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(entries = self.entries.len(), "replica scheduler starting");
        let mut last = Local::now().naive_local();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let now = Local::now().naive_local();
                    // Clock set backwards: start over from the new time.
                    if now > last {
                        self.fire_due(last, now).await;
                    }
                    last = now;
                }
                _ = shutdown.changed() => {
                    debug!("replica scheduler shutting down");
                    break;
                }
            }
        }
    }
}
