//! finops-policy — validates recommendations against organizational policy.
//!
//! The [`PolicyEngine`] checks one recommendation against every applicable
//! enabled policy:
//!
//! ```text
//! for policy in (global policies by name) ++ (namespace policies by name):
//!     suggested cpu    > policy.max_cpu             → violation
//!     suggested memory > policy.max_memory          → violation
//!     savings          < policy.min_monthly_savings → violation
//!     Σ cost(approved in namespace, other ids)
//!       + cost(this)   > policy.max_monthly_cost    → violation
//! ```
//!
//! The first violation wins. The [`RecommendationListener`] consumes
//! created events, runs the engine, persists the outcome and publishes
//! either an approved or a policy-violated event.

pub mod engine;
pub mod listener;

pub use engine::PolicyEngine;
pub use listener::{ListenerError, ListenerOutcome, RecommendationListener};
