//! The outbox relay, shared by all three services.
//!
//! Drains PENDING outbox rows in insertion order, publishes their payloads
//! to the service's single outbound topic, and marks the whole batch DONE
//! only after the broker acknowledged every payload. A crash or publish
//! failure in between leaves rows PENDING; the next tick republishes them
//! and the consumers' idempotency ledgers absorb the duplicates.

use std::sync::Arc;
use std::time::Duration;

use kafka_producer::EventPublisher;
use repository::OutboxQueue;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::{SagaMetrics, ServiceError};

pub struct OutboxRelay<Q> {
    queue: Q,
    publisher: EventPublisher,
    batch_size: i64,
    metrics: Arc<SagaMetrics>,
}

impl<Q: OutboxQueue> OutboxRelay<Q> {
    pub fn new(
        queue: Q,
        publisher: EventPublisher,
        batch_size: i64,
        metrics: Arc<SagaMetrics>,
    ) -> Self {
        Self {
            queue,
            publisher,
            batch_size,
            metrics,
        }
    }

    /// Relays one batch; returns how many rows were published and marked.
    pub async fn relay_once(&self) -> Result<usize, ServiceError> {
        let batch = self.queue.pending_outboxes(self.batch_size).await?;
        if batch.is_empty() {
            return Ok(0);
        }

        let payloads: Vec<Vec<u8>> = batch.iter().map(|row| row.content.clone()).collect();
        self.publisher.publish_all(&payloads).await?;

        let ids: Vec<i64> = batch.iter().map(|row| row.id).collect();
        self.queue.mark_outboxes_done(&ids).await?;

        self.metrics
            .events_relayed_total
            .with_label_values(&[self.publisher.topic()])
            .inc_by(batch.len() as u64);
        debug!(
            topic = %self.publisher.topic(),
            count = batch.len(),
            "outbox batch relayed"
        );
        Ok(batch.len())
    }

    /// Runs the periodic relay tick until the shutdown signal fires.
    /// A failed tick is logged and retried on the next one.
    pub async fn run(&self, interval: Duration, shutdown: Arc<Notify>) {
        let notified = shutdown.notified();
        tokio::pin!(notified);
        loop {
            tokio::select! {
                _ = notified.as_mut() => {
                    info!(topic = %self.publisher.topic(), "relay received shutdown signal");
                    return;
                }
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.relay_once().await {
                        error!(topic = %self.publisher.topic(), "relay tick failed: {e}");
                    }
                }
            }
        }
    }
}
