//! Lifecycle events exchanged between pipeline stages.
//!
//! Every payload kind is one variant of [`Event`], serialized as JSON with a
//! `type` tag. Each variant is published on its own [`Topic`] and partitioned
//! by recommendation id.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{RecommendationId, ResourceSet, WorkloadRef};

/// A new recommendation from the recommender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecommendationCreated {
    pub id: RecommendationId,
    pub workload_ref: WorkloadRef,
    pub namespace: String,
    pub current_resources: ResourceSet,
    pub suggested_resources: ResourceSet,
    #[serde(default)]
    pub replicas: Option<u32>,
    pub confidence_score: f64,
    pub estimated_monthly_savings: f64,
    pub currency: String,
    pub created_at: u64,
}

/// A recommendation passed policy validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecommendationApproved {
    pub recommendation_id: RecommendationId,
    pub workload_ref: WorkloadRef,
    pub namespace: String,
    pub approved_resources: ResourceSet,
    #[serde(default)]
    pub replicas: Option<u32>,
    pub estimated_monthly_savings: f64,
    pub currency: String,
    #[serde(default)]
    pub approved_by: Option<String>,
    pub approved_at: u64,
}

/// A recommendation was rejected by a policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyViolated {
    pub recommendation_id: RecommendationId,
    pub policy_name: String,
    pub reason: String,
    pub violated_at: u64,
}

/// The apply coordinator pushed a branch and opened a pull request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrCreated {
    pub recommendation_id: RecommendationId,
    pub pr_url: String,
    pub repository: String,
    pub branch_name: String,
    pub created_at: u64,
}

/// The cluster now runs the approved target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeApplied {
    pub recommendation_id: RecommendationId,
    pub workload_ref: WorkloadRef,
    pub namespace: String,
    pub applied_resources: ResourceSet,
    #[serde(default)]
    pub replicas: Option<u32>,
    pub applied_at: u64,
}

/// The change never landed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeFailed {
    pub recommendation_id: RecommendationId,
    pub error_message: String,
    pub failed_at: u64,
}

/// Every event that crosses the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Created(RecommendationCreated),
    Approved(RecommendationApproved),
    Violated(PolicyViolated),
    PrCreated(PrCreated),
    Applied(ChangeApplied),
    Failed(ChangeFailed),
}

impl Event {
    /// The recommendation this event belongs to; used as partition key.
    pub fn recommendation_id(&self) -> &str {
        match self {
            Event::Created(e) => &e.id,
            Event::Approved(e) => &e.recommendation_id,
            Event::Violated(e) => &e.recommendation_id,
            Event::PrCreated(e) => &e.recommendation_id,
            Event::Applied(e) => &e.recommendation_id,
            Event::Failed(e) => &e.recommendation_id,
        }
    }

    /// The topic this event is published on.
    pub fn topic(&self) -> Topic {
        match self {
            Event::Created(_) => Topic::RecommendationCreated,
            Event::Approved(_) => Topic::RecommendationApproved,
            Event::Violated(_) => Topic::PolicyViolated,
            Event::PrCreated(_) => Topic::PrCreated,
            Event::Applied(_) => Topic::ChangeApplied,
            Event::Failed(_) => Topic::ChangeFailed,
        }
    }
}

/// Named channels on the transport, one per event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    RecommendationCreated,
    RecommendationApproved,
    PolicyViolated,
    PrCreated,
    ChangeApplied,
    ChangeFailed,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::RecommendationCreated,
        Topic::RecommendationApproved,
        Topic::PolicyViolated,
        Topic::PrCreated,
        Topic::ChangeApplied,
        Topic::ChangeFailed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::RecommendationCreated => "recommendation-created",
            Topic::RecommendationApproved => "recommendation-approved",
            Topic::PolicyViolated => "policy-violated",
            Topic::PrCreated => "pr-created",
            Topic::ChangeApplied => "change-applied",
            Topic::ChangeFailed => "change-failed",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
