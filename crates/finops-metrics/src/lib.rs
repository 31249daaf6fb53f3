//! finops-metrics — counters for the rightsizing pipeline.
//!
//! Tracks per-namespace decision counts from the policy listener and
//! created-recommendation counts and savings from the recommender, and
//! renders them in the Prometheus text exposition format.
//!
//! # Architecture
//!
//! ```text
//! MetricsCollector
//!   ├── record_decision() ← policy listener, once per fresh decision
//!   ├── record_created()  ← recommender, once per published suggestion
//!   └── snapshot() → Vec<NamespaceMetrics>
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for the /metrics endpoint
//! ```

pub mod collector;
pub mod prometheus;

pub use collector::{Decision, MetricsCollector, NamespaceMetrics};
pub use prometheus::render_prometheus;
