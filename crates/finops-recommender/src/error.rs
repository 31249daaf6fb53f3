use finops_bus::BusError;
use finops_core::{ParseError, WorkloadRefError};
use thiserror::Error;

/// Errors from the usage source.
#[derive(Debug, Error)]
pub enum UsageError {
    #[error("usage query failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("usage source returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("usage query rejected: {0}")]
    Query(String),

    #[error("no samples for query {0}")]
    NoData(String),

    #[error("malformed sample {0:?}")]
    BadSample(String),
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("report serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Why a target produced no recommendation this cycle.
#[derive(Debug, Error)]
pub enum RecommendError {
    #[error(transparent)]
    Usage(#[from] UsageError),

    #[error("cannot price resources: {0}")]
    Cost(#[from] ParseError),

    #[error(transparent)]
    Publish(#[from] BusError),
}

/// Invalid replica schedule entry.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("schedule {name}: invalid time of day {value:?}, expected HH:MM")]
    Time { name: String, value: String },

    #[error("schedule {name}: unknown weekday {value:?}")]
    Weekday { name: String, value: String },

    #[error("schedule {name}: {source}")]
    Workload {
        name: String,
        source: WorkloadRefError,
    },
}
