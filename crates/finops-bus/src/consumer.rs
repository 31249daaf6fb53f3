//! Consumer loop: hand each delivery to a handler and redeliver retryable
//! failures with backoff.

use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use finops_core::Event;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::memory::{Delivery, Subscription};
use crate::retry::RetryPolicy;

/// Classifies a handler failure for the transport.
pub trait Retryable {
    /// `true` to redeliver the event, `false` to acknowledge it.
    fn is_retryable(&self) -> bool;
}

impl Retryable for std::convert::Infallible {
    fn is_retryable(&self) -> bool {
        match *self {}
    }
}

/// A stage that reacts to events from one subscription.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    type Error: Retryable + Display + Send;

    async fn handle(&self, event: &Event) -> Result<(), Self::Error>;
}

/// Drive `subscription` until shutdown is signalled or the channel closes.
pub async fn run_consumer<H: EventHandler>(
    mut subscription: Subscription,
    handler: Arc<H>,
    policy: RetryPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    let topic = subscription.topic();
    let group = subscription.group().to_string();
    info!(%topic, %group, "consumer started");

    loop {
        tokio::select! {
            delivery = subscription.recv() => {
                let Some(delivery) = delivery else {
                    break;
                };
                dispatch(&subscription, handler.as_ref(), &policy, delivery).await;
            }
            _ = shutdown.changed() => {
                info!(%topic, %group, "consumer shutting down");
                break;
            }
        }
    }
}

async fn dispatch<H: EventHandler>(
    subscription: &Subscription,
    handler: &H,
    policy: &RetryPolicy,
    delivery: Delivery,
) {
    let topic = subscription.topic();
    let recommendation = delivery.event.recommendation_id().to_string();

    match handler.handle(&delivery.event).await {
        Ok(()) => {
            debug!(%topic, %recommendation, attempt = delivery.attempt, "delivery handled");
        }
        Err(e) if e.is_retryable() && policy.should_redeliver(delivery.attempt) => {
            let delay = policy.backoff(delivery.attempt);
            warn!(
                %topic,
                %recommendation,
                attempt = delivery.attempt,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "handler failed, redelivering"
            );
            subscription.redeliver(delivery, delay);
        }
        Err(e) if e.is_retryable() => {
            error!(
                %topic,
                %recommendation,
                attempt = delivery.attempt,
                error = %e,
                "redelivery attempts exhausted, dropping event"
            );
        }
        Err(e) => {
            error!(%topic, %recommendation, error = %e, "handler failed permanently");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use finops_core::Topic;
    use finops_core::event::ChangeFailed;

    use crate::{EventPublisher, InMemoryBus};

    #[derive(Debug)]
    struct TestError {
        retryable: bool,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error (retryable: {})", self.retryable)
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            self.retryable
        }
    }

    /// Fails `failures` times, then succeeds; records every call.
    struct ScriptedHandler {
        failures: u32,
        retryable: bool,
        seen: Mutex<Vec<String>>,
        done: tokio::sync::Notify,
    }

    impl ScriptedHandler {
        fn new(failures: u32, retryable: bool) -> Self {
            Self {
                failures,
                retryable,
                seen: Mutex::new(Vec::new()),
                done: tokio::sync::Notify::new(),
            }
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl EventHandler for ScriptedHandler {
        type Error = TestError;

        async fn handle(&self, event: &Event) -> Result<(), TestError> {
            let call = {
                let mut seen = self.seen.lock().unwrap();
                seen.push(event.recommendation_id().to_string());
                seen.len() as u32
            };
            self.done.notify_one();
            if call <= self.failures {
                return Err(TestError {
                    retryable: self.retryable,
                });
            }
            Ok(())
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            publish_attempts: 1,
        }
    }

    fn event() -> Event {
        Event::Failed(ChangeFailed {
            recommendation_id: "rec-1".to_string(),
            error_message: "boom".to_string(),
            failed_at: 1,
        })
    }

    async fn run_until_calls(
        handler: Arc<ScriptedHandler>,
        policy: RetryPolicy,
        expected_calls: usize,
    ) {
        let bus = InMemoryBus::new();
        let sub = bus.subscribe(Topic::ChangeFailed, "test").await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_consumer(sub, handler.clone(), policy, shutdown_rx));

        bus.publish(event()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while handler.calls() < expected_calls {
                handler.done.notified().await;
            }
        })
        .await
        .unwrap();
        // Give a stray redelivery the chance to show up.
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn retryable_error_is_redelivered() {
        let handler = Arc::new(ScriptedHandler::new(2, true));
        run_until_calls(handler.clone(), fast_policy(5), 3).await;
        assert_eq!(handler.calls(), 3);
    }

    #[tokio::test]
    async fn redelivery_stops_after_max_attempts() {
        let handler = Arc::new(ScriptedHandler::new(100, true));
        run_until_calls(handler.clone(), fast_policy(3), 3).await;
        assert_eq!(handler.calls(), 3);
    }

    #[tokio::test]
    async fn terminal_error_is_acknowledged() {
        let handler = Arc::new(ScriptedHandler::new(100, false));
        run_until_calls(handler.clone(), fast_policy(5), 1).await;
        assert_eq!(handler.calls(), 1);
    }
}
