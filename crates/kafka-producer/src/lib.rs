//! Publisher side of the broker contract.
//!
//! The outbox relay hands over opaque payload batches; publishing requires
//! acknowledgment from all in-sync replicas before a batch is reported as
//! delivered. A `MemoryTopic` variant provides an in-process append-only log
//! for the integration tests.

use std::sync::Arc;
use std::time::Duration;

use rdkafka::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Error publishing a payload batch. The relay leaves the corresponding
/// outbox rows PENDING and retries on its next tick.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
}

/// Kafka-backed publisher for a single outbound topic.
pub struct KafkaPublisher {
    producer: FutureProducer,
    topic: String,
}

impl KafkaPublisher {
    /// Create a producer requiring acks from all in-sync replicas.
    pub fn new(brokers: &str, topic: &str) -> Result<Self, KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("acks", "all")
            .set("message.timeout.ms", "5000")
            .create()?;

        Ok(Self {
            producer,
            topic: topic.to_string(),
        })
    }

    async fn push(&self, payloads: &[Vec<u8>]) -> Result<(), PublishError> {
        for payload in payloads {
            let record = FutureRecord::<(), _>::to(&self.topic).payload(payload);
            self.producer
                .send(record, Duration::from_secs(5))
                .await
                .map_err(|(e, _)| PublishError::Kafka(e))?;
        }
        debug!(topic = %self.topic, count = payloads.len(), "published batch");
        Ok(())
    }
}

/// An in-process append-only topic: the memory counterpart of a single
/// Kafka partition. Cloning shares the underlying log.
#[derive(Debug, Clone, Default)]
pub struct MemoryTopic {
    name: String,
    log: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MemoryTopic {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends the batch to the log.
    pub async fn append_all(&self, payloads: &[Vec<u8>]) {
        let mut log = self.log.lock().await;
        log.extend(payloads.iter().cloned());
    }

    /// Returns the payload at `offset`, if one has been appended yet.
    pub async fn read_at(&self, offset: usize) -> Option<Vec<u8>> {
        let log = self.log.lock().await;
        log.get(offset).cloned()
    }

    /// Number of messages appended so far.
    pub async fn len(&self) -> usize {
        self.log.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Publisher for a service's single outbound topic.
pub enum EventPublisher {
    Kafka(KafkaPublisher),
    Memory(MemoryTopic),
}

impl EventPublisher {
    pub fn kafka(brokers: &str, topic: &str) -> Result<Self, KafkaError> {
        Ok(EventPublisher::Kafka(KafkaPublisher::new(brokers, topic)?))
    }

    pub fn memory(topic: MemoryTopic) -> Self {
        EventPublisher::Memory(topic)
    }

    /// Name of the outbound topic.
    pub fn topic(&self) -> &str {
        match self {
            EventPublisher::Kafka(publisher) => &publisher.topic,
            EventPublisher::Memory(topic) => topic.name(),
        }
    }

    /// Publishes every payload of the batch, in order. Any failure aborts
    /// the batch; payloads already sent may reach the broker anyway, which
    /// consumers absorb as duplicates.
    pub async fn publish_all(&self, payloads: &[Vec<u8>]) -> Result<(), PublishError> {
        match self {
            EventPublisher::Kafka(publisher) => publisher.push(payloads).await,
            EventPublisher::Memory(topic) => {
                topic.append_all(payloads).await;
                Ok(())
            }
        }
    }
}
