//! In-process transport.
//!
//! Each (topic, group) pair owns one unbounded channel. Publishing fans an
//! event out to every group subscribed to its topic; within a group, events
//! arrive in publish order. Redelivered events are re-enqueued on the same
//! channel after their backoff, so they may overtake later events.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use finops_core::{Event, Topic};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

use crate::EventPublisher;
use crate::error::{BusError, BusResult};

/// One event handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub event: Event,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
}

type Groups = HashMap<String, mpsc::UnboundedSender<Delivery>>;

/// Transport that lives inside one process.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    topics: Arc<RwLock<HashMap<Topic, Groups>>>,
    closed: Arc<AtomicBool>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join `group` on `topic`. Each group has a single member here.
    pub async fn subscribe(&self, topic: Topic, group: &str) -> BusResult<Subscription> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let mut topics = self.topics.write().await;
        let groups = topics.entry(topic).or_default();
        if let Some(existing) = groups.get(group)
            && !existing.is_closed()
        {
            return Err(BusError::AlreadySubscribed {
                topic,
                group: group.to_string(),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        groups.insert(group.to_string(), tx.clone());
        debug!(%topic, group, "subscribed");
        Ok(Subscription {
            topic,
            group: group.to_string(),
            rx,
            requeue: tx,
        })
    }

    /// Refuse further publishes and subscriptions.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventPublisher for InMemoryBus {
    async fn publish(&self, event: Event) -> BusResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let topic = event.topic();
        let mut topics = self.topics.write().await;
        let Some(groups) = topics.get_mut(&topic) else {
            debug!(%topic, recommendation = %event.recommendation_id(), "no subscribers");
            return Ok(());
        };
        groups.retain(|group, tx| {
            let delivery = Delivery {
                event: event.clone(),
                attempt: 1,
            };
            if tx.send(delivery).is_err() {
                warn!(%topic, group = %group, "dropping closed subscription");
                return false;
            }
            true
        });
        debug!(
            %topic,
            recommendation = %event.recommendation_id(),
            groups = groups.len(),
            "published"
        );
        Ok(())
    }
}

/// A consumer group's view of one topic.
pub struct Subscription {
    topic: Topic,
    group: String,
    rx: mpsc::UnboundedReceiver<Delivery>,
    requeue: mpsc::UnboundedSender<Delivery>,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Next delivery, waiting if none is queued.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Next delivery if one is already queued.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }

    /// Put `delivery` back on this subscription after `delay`, with its
    /// attempt counter incremented.
    pub fn redeliver(&self, delivery: Delivery, delay: Duration) {
        let tx = self.requeue.clone();
        let next = Delivery {
            event: delivery.event,
            attempt: delivery.attempt + 1,
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The subscription may be gone by now; nothing to do then.
            let _ = tx.send(next);
        });
    }
}
