//! Exponential backoff for redelivery and publishing.

use std::time::Duration;

use finops_core::Event;
use finops_core::config::BusConfig;
use tracing::warn;

use crate::EventPublisher;
use crate::error::{BusError, BusResult};

/// Bounded exponential backoff.
///
/// Attempt 1 waits `base_delay`; every further attempt doubles the wait up
/// to `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Deliveries per event before it is dead-lettered.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Attempts for one publish call.
    pub publish_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&BusConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &BusConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
            publish_attempts: config.publish_attempts.max(1),
        }
    }

    /// Wait before retrying after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let mut delay = self.base_delay;
        for _ in 1..attempt {
            delay = (delay * 2).min(self.max_delay);
            if delay == self.max_delay {
                break;
            }
        }
        delay.min(self.max_delay)
    }

    /// Whether a delivery that just failed on `attempt` gets another try.
    pub fn should_redeliver(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Publish `event`, retrying failures with backoff.
pub async fn publish_with_retry(
    publisher: &dyn EventPublisher,
    event: Event,
    policy: &RetryPolicy,
) -> BusResult<()> {
    let topic = event.topic();
    let mut attempt = 1;
    loop {
        match publisher.publish(event.clone()).await {
            Ok(()) => return Ok(()),
            Err(BusError::Closed) => return Err(BusError::Closed),
            Err(e) if attempt >= policy.publish_attempts => {
                return Err(BusError::PublishFailed {
                    topic,
                    recommendation: event.recommendation_id().to_string(),
                    attempts: attempt,
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                let delay = policy.backoff(attempt);
                warn!(
                    %topic,
                    recommendation = %event.recommendation_id(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "publish failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use finops_core::Topic;
    use finops_core::event::ChangeFailed;

    fn fast_policy(publish_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            publish_attempts,
        }
    }

    fn event() -> Event {
        Event::Failed(ChangeFailed {
            recommendation_id: "rec-1".to_string(),
            error_message: "boom".to_string(),
            failed_at: 1,
        })
    }

    /// Fails the first `failures` publishes.
    struct FlakyPublisher {
        failures: u32,
        calls: AtomicU32,
        published: Mutex<Vec<Event>>,
    }

    #[async_trait]
    impl EventPublisher for FlakyPublisher {
        async fn publish(&self, event: Event) -> BusResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(BusError::PublishFailed {
                    topic: event.topic(),
                    recommendation: event.recommendation_id().to_string(),
                    attempts: 1,
                    reason: "broker unavailable".to_string(),
                });
            }
            self.published.lock().unwrap().push(event);
            Ok(())
        }
    }

    #[test]
    fn backoff_doubles_from_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
    }

    #[test]
    fn backoff_caps_at_max() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(7), Duration::from_secs(60));
        assert_eq!(policy.backoff(40), Duration::from_secs(60));
    }

    #[test]
    fn redelivery_is_bounded() {
        let policy = RetryPolicy::default();
        assert!(policy.should_redeliver(1));
        assert!(policy.should_redeliver(4));
        assert!(!policy.should_redeliver(5));
    }

    #[tokio::test]
    async fn publish_succeeds_after_transient_failures() {
        let publisher = FlakyPublisher {
            failures: 2,
            calls: AtomicU32::new(0),
            published: Mutex::new(Vec::new()),
        };
        publish_with_retry(&publisher, event(), &fast_policy(3))
            .await
            .unwrap();
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 3);
        assert_eq!(publisher.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn publish_gives_up_after_attempts() {
        let publisher = FlakyPublisher {
            failures: 10,
            calls: AtomicU32::new(0),
            published: Mutex::new(Vec::new()),
        };
        let err = publish_with_retry(&publisher, event(), &fast_policy(3))
            .await
            .unwrap_err();
        match err {
            BusError::PublishFailed { topic, attempts, .. } => {
                assert_eq!(topic, Topic::ChangeFailed);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 3);
    }
}
