//! Domain types shared by every pipeline stage.
//!
//! All types are serializable to/from JSON: they are persisted in the
//! state store and carried inside transport events.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::RecommendationCreated;

/// Opaque recommendation identifier, assigned upstream. Doubles as the
/// idempotency key and the transport partition key.
pub type RecommendationId = String;

/// Resource name → quantity string, e.g. `cpu → "500m"`.
///
/// Ordered so that iteration and serialized output are deterministic.
pub type ResourceSet = BTreeMap<String, String>;

// ── Workload reference ────────────────────────────────────────────

/// Identifies a deployable unit as `kind/name`, e.g. `deployment/nginx`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkloadRef {
    pub kind: String,
    pub name: String,
}

impl WorkloadRef {
    pub fn new(kind: &str, name: &str) -> Self {
        Self {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    /// Shorthand for `deployment/<name>`.
    pub fn deployment(name: &str) -> Self {
        Self::new("deployment", name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid workload reference {0:?}")]
pub struct WorkloadRefError(pub String);

impl FromStr for WorkloadRef {
    type Err = WorkloadRefError;

    /// Parses `kind/name`; a bare `name` is taken to be a deployment.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (kind, name) = match s.split_once('/') {
            Some((kind, name)) => (kind, name),
            None => ("deployment", s),
        };
        if kind.is_empty() || name.is_empty() || name.contains('/') {
            return Err(WorkloadRefError(s.to_string()));
        }
        Ok(Self::new(&kind.to_ascii_lowercase(), name))
    }
}

impl TryFrom<String> for WorkloadRef {
    type Error = WorkloadRefError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WorkloadRef> for String {
    fn from(value: WorkloadRef) -> Self {
        value.to_string()
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

// ── Recommendation ────────────────────────────────────────────────

/// Lifecycle status of a recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendationStatus {
    Pending,
    Approved,
    Rejected,
    Applied,
    Failed,
}

impl RecommendationStatus {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// PENDING → {APPROVED, REJECTED}; APPROVED → {APPLIED, FAILED}.
    pub fn can_transition_to(self, next: Self) -> bool {
        use RecommendationStatus::*;
        matches!(
            (self, next),
            (Pending, Approved) | (Pending, Rejected) | (Approved, Applied) | (Approved, Failed)
        )
    }

    /// No transition leaves a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Applied | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Applied => "APPLIED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RecommendationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecommendationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "APPROVED" => Ok(Self::Approved),
            "REJECTED" => Ok(Self::Rejected),
            "APPLIED" => Ok(Self::Applied),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown recommendation status: {other}")),
        }
    }
}

/// Attempted a status change the lifecycle does not allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition {from} -> {to} for recommendation {id}")]
pub struct TransitionError {
    pub id: RecommendationId,
    pub from: RecommendationStatus,
    pub to: RecommendationStatus,
}

/// A rightsizing recommendation and its lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recommendation {
    pub id: RecommendationId,
    pub workload_ref: WorkloadRef,
    pub namespace: String,
    pub current_resources: ResourceSet,
    pub suggested_resources: ResourceSet,
    pub replicas: Option<u32>,
    /// Confidence in the suggestion, 0.0–1.0.
    pub confidence_score: f64,
    pub estimated_monthly_savings: f64,
    pub currency: String,
    pub status: RecommendationStatus,
    /// Set iff status is REJECTED.
    pub rejection_reason: Option<String>,
    /// Name of the policy that rejected it. Set iff status is REJECTED.
    pub rejected_by_policy: Option<String>,
    /// Set iff status is FAILED.
    pub failure_message: Option<String>,
    /// Unix timestamp (seconds) from the created event.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last status change.
    pub updated_at: u64,
}

impl Recommendation {
    /// Build a PENDING recommendation from its created event.
    pub fn from_created(event: &RecommendationCreated) -> Self {
        Self {
            id: event.id.clone(),
            workload_ref: event.workload_ref.clone(),
            namespace: event.namespace.clone(),
            current_resources: event.current_resources.clone(),
            suggested_resources: event.suggested_resources.clone(),
            replicas: event.replicas,
            confidence_score: event.confidence_score,
            estimated_monthly_savings: event.estimated_monthly_savings,
            currency: event.currency.clone(),
            status: RecommendationStatus::Pending,
            rejection_reason: None,
            rejected_by_policy: None,
            failure_message: None,
            created_at: event.created_at,
            updated_at: event.created_at,
        }
    }

    /// Move to `next`, enforcing the lifecycle.
    pub fn transition(&mut self, next: RecommendationStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = epoch_secs();
        Ok(())
    }

    pub fn approve(&mut self) -> Result<(), TransitionError> {
        self.transition(RecommendationStatus::Approved)
    }

    pub fn reject(&mut self, reason: &str, policy_name: &str) -> Result<(), TransitionError> {
        self.transition(RecommendationStatus::Rejected)?;
        self.rejection_reason = Some(reason.to_string());
        self.rejected_by_policy = Some(policy_name.to_string());
        Ok(())
    }

    pub fn mark_applied(&mut self) -> Result<(), TransitionError> {
        self.transition(RecommendationStatus::Applied)
    }

    pub fn mark_failed(&mut self, message: &str) -> Result<(), TransitionError> {
        self.transition(RecommendationStatus::Failed)?;
        self.failure_message = Some(message.to_string());
        Ok(())
    }
}

// ── Policy ────────────────────────────────────────────────────────

/// An organizational constraint on recommendations.
///
/// Every limit is optional; an unset limit is not checked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Policy {
    pub name: String,
    /// Namespace scope. `None` applies to every namespace.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Ceiling for suggested CPU, e.g. `"1000m"`.
    #[serde(default)]
    pub max_cpu: Option<String>,
    /// Ceiling for suggested memory, e.g. `"2Gi"`.
    #[serde(default)]
    pub max_memory: Option<String>,
    /// Recommendations saving less than this are rejected.
    #[serde(default)]
    pub min_monthly_savings: Option<f64>,
    /// Budget for the summed monthly cost of all approved recommendations
    /// in the namespace.
    #[serde(default)]
    pub max_monthly_cost: Option<f64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Policy {
    /// An enabled policy with no limits set.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: None,
            max_cpu: None,
            max_memory: None,
            min_monthly_savings: None,
            max_monthly_cost: None,
            enabled: true,
        }
    }

    /// Whether this policy is in scope for `namespace`.
    pub fn applies_to(&self, namespace: &str) -> bool {
        match &self.namespace {
            Some(ns) => ns == namespace,
            None => true,
        }
    }

    /// Composite key for the policies table: `{namespace or *}/{name}`.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.namespace.as_deref().unwrap_or("*"), self.name)
    }

    /// Policies installed into an empty store by `policies seed`.
    pub fn defaults() -> Vec<Policy> {
        vec![
            Policy {
                max_cpu: Some("1000m".to_string()),
                max_memory: Some("2Gi".to_string()),
                min_monthly_savings: Some(5.0),
                ..Policy::named("Global Resource Limit")
            },
            Policy {
                namespace: Some("prod".to_string()),
                max_cpu: Some("2000m".to_string()),
                max_memory: Some("4Gi".to_string()),
                max_monthly_cost: Some(100.0),
                ..Policy::named("Production Namespace Limit")
            },
        ]
    }
}

/// Outcome of validating one recommendation against its policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub valid: bool,
    /// Present iff invalid.
    pub reason: Option<String>,
    /// Present iff invalid.
    pub policy_name: Option<String>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            valid: true,
            reason: None,
            policy_name: None,
        }
    }

    pub fn invalid(reason: impl Into<String>, policy_name: &str) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
            policy_name: Some(policy_name.to_string()),
        }
    }
}

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
