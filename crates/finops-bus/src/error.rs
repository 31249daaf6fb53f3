//! Error types for the event transport.

use finops_core::Topic;
use thiserror::Error;

pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("transport is closed")]
    Closed,

    #[error("group {group} already subscribed to {topic}")]
    AlreadySubscribed { topic: Topic, group: String },

    #[error("publish of {topic} for {recommendation} failed after {attempts} attempts: {reason}")]
    PublishFailed {
        topic: Topic,
        recommendation: String,
        attempts: u32,
        reason: String,
    },
}
