//! finops-recommender — turns observed usage into rightsizing suggestions.
//!
//! Every cycle the recommender asks a [`UsageSource`] for the p95 CPU and
//! memory of each configured workload, adds 20% headroom, prices the
//! difference with the cost model and publishes a created event. A JSON
//! report of each suggestion is archived through a [`ReportStore`].
//!
//! The [`ReplicaScheduler`] publishes fixed-time replica changes (for
//! example scaling a dev workload to zero overnight) on the same topic.

pub mod error;
pub mod recommender;
pub mod report;
pub mod schedule;
pub mod usage;

pub use error::{RecommendError, ReportError, ScheduleError, UsageError};
pub use recommender::{CycleReport, Recommender, Target, suggest_cpu, suggest_memory};
pub use report::{FsReportStore, RecommendationReport, ReportStore};
pub use schedule::{ReplicaScheduler, ScheduledScaling};
pub use usage::{PrometheusClient, UsageSource};
