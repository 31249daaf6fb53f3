//! finops-core — shared vocabulary for the rightsizing pipeline.
//!
//! Every stage (policy listener, apply coordinator, sync reconciler,
//! recommender) depends on this crate for:
//!
//! - **`types`** — Recommendation, Policy, ValidationResult, WorkloadRef
//! - **`event`** — the tagged event union exchanged over the transport
//! - **`quantity`** — Kubernetes quantity strings → canonical units
//! - **`cost`** — monthly cost and savings estimates
//! - **`config`** — the `finops.toml` configuration file

pub mod config;
pub mod cost;
pub mod event;
pub mod quantity;
pub mod types;

pub use config::FinopsConfig;
pub use cost::CostModel;
pub use event::{Event, Topic};
pub use quantity::{ParseError, ResourceKind};
pub use types::*;
