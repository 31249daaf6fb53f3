//! finops-bus — message transport between pipeline stages.
//!
//! Stages publish [`Event`](finops_core::Event)s through the
//! [`EventPublisher`] trait and consume them through a [`Subscription`]
//! bound to a topic and a consumer group. Delivery is at-least-once: a
//! handler that fails with a retryable error gets the same event again
//! after exponential backoff, up to a bounded number of attempts.
//!
//! [`InMemoryBus`] is the in-process implementation used by `finopsd` and
//! the tests.

pub mod consumer;
pub mod error;
pub mod memory;
pub mod retry;

pub use consumer::{EventHandler, Retryable, run_consumer};
pub use error::{BusError, BusResult};
pub use memory::{Delivery, InMemoryBus, Subscription};
pub use retry::{RetryPolicy, publish_with_retry};

use async_trait::async_trait;
use finops_core::Event;

/// Anything events can be published to.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish `event` on its topic.
    async fn publish(&self, event: Event) -> BusResult<()>;
}
