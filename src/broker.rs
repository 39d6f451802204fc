// ===============================
// src/broker.rs
// ===============================
//
// Broker seam. A binding only needs two things from the message-consumption
// side: the next delivery, and a place to settle it.
//
//   Acknowledge -> ack
//   RequeueOnce -> nack + requeue (comes back with redelivered = true)
//   DropAndLog  -> ack without requeue (consumed and discarded)
//
// MemoryBroker is the in-process implementation used by the mock/replay feeds
// and by tests: one mpsc channel per queue, requeued deliveries go out again
// before fresh ones.
//
use async_trait::async_trait;
use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use crate::domain::{Delivery, DeliveryOutcome};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("unknown delivery tag {0}")]
    UnknownTag(u64),
    #[error("queue {0} closed")]
    Closed(String),
}

#[async_trait]
pub trait DeliverySource: Send {
    /// Next delivery, `None` once the queue is closed and drained.
    async fn next(&mut self) -> Option<Delivery>;

    /// Report the binding's decision for `tag`. Exactly once per delivery.
    async fn settle(&mut self, tag: u64, outcome: DeliveryOutcome) -> Result<(), BrokerError>;
}

/// Publishing half of a memory queue.
#[derive(Clone)]
pub struct Publisher {
    queue: String,
    tx: mpsc::Sender<Vec<u8>>,
}

impl Publisher {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub async fn publish(&self, body: Vec<u8>) -> Result<(), BrokerError> {
        self.tx
            .send(body)
            .await
            .map_err(|_| BrokerError::Closed(self.queue.clone()))
    }
}

/// In-process queue factory.
#[derive(Debug, Clone, Copy)]
pub struct MemoryBroker {
    capacity: usize,
    /// Redeliveries allowed per message; `None` = unlimited.
    delivery_limit: Option<u32>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self { capacity: 1024, delivery_limit: Some(5) }
    }
}

impl MemoryBroker {
    pub fn new(capacity: usize, delivery_limit: Option<u32>) -> Self {
        Self { capacity: capacity.max(1), delivery_limit }
    }

    pub fn declare(&self, queue: &str) -> (Publisher, MemoryConsumer) {
        let (tx, rx) = mpsc::channel(self.capacity);
        (
            Publisher { queue: queue.to_string(), tx },
            MemoryConsumer {
                queue: queue.to_string(),
                rx,
                requeued: VecDeque::new(),
                in_flight: None,
                next_tag: 1,
                delivery_limit: self.delivery_limit,
                dropped: 0,
            },
        )
    }
}

struct InFlight {
    delivery: Delivery,
    redeliveries: u32,
}

/// Consuming half of a memory queue. Prefetch of one: a new delivery is only
/// handed out after the previous one was settled.
pub struct MemoryConsumer {
    queue: String,
    rx: mpsc::Receiver<Vec<u8>>,
    requeued: VecDeque<(Vec<u8>, u32)>,
    in_flight: Option<InFlight>,
    next_tag: u64,
    delivery_limit: Option<u32>,
    dropped: u64,
}

impl MemoryConsumer {
    /// Messages discarded by the delivery limit.
    #[cfg(test)]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn hand_out(&mut self, body: Vec<u8>, redeliveries: u32) -> Delivery {
        let delivery = Delivery {
            tag: self.next_tag,
            queue: self.queue.clone(),
            body,
            redelivered: redeliveries > 0,
        };
        self.next_tag += 1;
        self.in_flight = Some(InFlight { delivery: delivery.clone(), redeliveries });
        delivery
    }
}

#[async_trait]
impl DeliverySource for MemoryConsumer {
    async fn next(&mut self) -> Option<Delivery> {
        // unsettled delivery goes out again, flagged as redelivered
        if let Some(prev) = self.in_flight.take() {
            self.requeued.push_front((prev.delivery.body, prev.redeliveries + 1));
        }
        if let Some((body, redeliveries)) = self.requeued.pop_front() {
            return Some(self.hand_out(body, redeliveries));
        }
        let body = self.rx.recv().await?;
        Some(self.hand_out(body, 0))
    }

    async fn settle(&mut self, tag: u64, outcome: DeliveryOutcome) -> Result<(), BrokerError> {
        let current = match self.in_flight.take() {
            Some(f) if f.delivery.tag == tag => f,
            other => {
                self.in_flight = other;
                return Err(BrokerError::UnknownTag(tag));
            }
        };
        match outcome {
            DeliveryOutcome::Acknowledge | DeliveryOutcome::DropAndLog => {}
            DeliveryOutcome::RequeueOnce => {
                let redeliveries = current.redeliveries + 1;
                if self.delivery_limit.is_some_and(|limit| redeliveries > limit) {
                    self.dropped += 1;
                    warn!(
                        queue = %self.queue,
                        tag,
                        redeliveries,
                        dropped_total = self.dropped,
                        "delivery limit reached, discarding message"
                    );
                } else {
                    self.requeued.push_back((current.delivery.body, redeliveries));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ack_consumes() {
        let (publisher, mut consumer) = MemoryBroker::default().declare("q");
        publisher.publish(b"a".to_vec()).await.unwrap();
        publisher.publish(b"b".to_vec()).await.unwrap();

        let d = consumer.next().await.unwrap();
        assert_eq!(d.body, b"a");
        assert!(!d.redelivered);
        assert_eq!(d.queue, "q");
        consumer.settle(d.tag, DeliveryOutcome::Acknowledge).await.unwrap();

        let d = consumer.next().await.unwrap();
        assert_eq!(d.body, b"b");
        consumer.settle(d.tag, DeliveryOutcome::DropAndLog).await.unwrap();
        assert!(consumer.requeued.is_empty());
        assert!(consumer.in_flight.is_none());
    }

    #[tokio::test]
    async fn requeue_redelivers_before_fresh_messages() {
        let (publisher, mut consumer) = MemoryBroker::default().declare("q");
        publisher.publish(b"first".to_vec()).await.unwrap();
        publisher.publish(b"second".to_vec()).await.unwrap();

        let d = consumer.next().await.unwrap();
        consumer.settle(d.tag, DeliveryOutcome::RequeueOnce).await.unwrap();

        let again = consumer.next().await.unwrap();
        assert_eq!(again.body, b"first");
        assert!(again.redelivered);
        assert_ne!(again.tag, d.tag);
        consumer.settle(again.tag, DeliveryOutcome::Acknowledge).await.unwrap();

        let fresh = consumer.next().await.unwrap();
        assert_eq!(fresh.body, b"second");
        assert!(!fresh.redelivered);
    }

    #[tokio::test]
    async fn delivery_limit_discards() {
        let (publisher, mut consumer) = MemoryBroker::new(8, Some(2)).declare("q");
        publisher.publish(b"poison".to_vec()).await.unwrap();
        drop(publisher);

        let mut seen = 0;
        while let Some(d) = consumer.next().await {
            seen += 1;
            consumer.settle(d.tag, DeliveryOutcome::RequeueOnce).await.unwrap();
        }
        assert_eq!(seen, 3);
        assert_eq!(consumer.dropped(), 1);
    }

    #[tokio::test]
    async fn unsettled_delivery_is_redelivered() {
        let (publisher, mut consumer) = MemoryBroker::default().declare("q");
        publisher.publish(b"x".to_vec()).await.unwrap();
        let d = consumer.next().await.unwrap();
        let again = consumer.next().await.unwrap();
        assert_eq!(again.body, d.body);
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn unknown_tag_is_rejected() {
        let (publisher, mut consumer) = MemoryBroker::default().declare("q");
        publisher.publish(b"x".to_vec()).await.unwrap();
        let d = consumer.next().await.unwrap();
        assert!(matches!(
            consumer.settle(d.tag + 7, DeliveryOutcome::Acknowledge).await,
            Err(BrokerError::UnknownTag(_))
        ));
        consumer.settle(d.tag, DeliveryOutcome::Acknowledge).await.unwrap();
    }

    #[tokio::test]
    async fn closed_queue_rejects_publish() {
        let (publisher, consumer) = MemoryBroker::default().declare("q");
        drop(consumer);
        assert!(matches!(
            publisher.publish(b"x".to_vec()).await,
            Err(BrokerError::Closed(_))
        ));
    }
}
