//! Shared consumer runtime for the saga services.
//!
//! Each subscription reads a single-partition topic from the earliest
//! uncommitted offset and dispatches payloads to an [`EventHandler`].
//! Offsets are committed manually and only after the handler succeeds; a
//! failed handler leaves the message uncommitted and the partition is sought
//! back so the next poll re-reads it. Malformed payloads are poison: the
//! loop stops with a diagnosable error instead of skipping them.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kafka_producer::MemoryTopic;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How long a single poll waits for a message before yielding.
const POLL_WAIT: Duration = Duration::from_millis(200);
/// Pause before re-reading a message whose handler failed.
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Outcome a handler reports for one message.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The payload could not be decoded. The message is poison and the
    /// consumer stops rather than silently skipping it.
    #[error("malformed event payload: {0}")]
    Decode(#[from] serde_json::Error),
    /// The handler failed transiently; the message stays uncommitted and is
    /// redelivered on the next poll.
    #[error(transparent)]
    Retry(anyhow::Error),
}

impl HandlerError {
    /// Wraps a transient failure so the message gets redelivered.
    pub fn retry(err: impl Into<anyhow::Error>) -> Self {
        HandlerError::Retry(err.into())
    }
}

/// A saga step bound to one topic subscription.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> Result<(), HandlerError>;
}

/// Terminal failure of a consumer loop.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("poison message at offset {offset}: {source}")]
    Poison {
        offset: i64,
        #[source]
        source: serde_json::Error,
    },
}

/// One message pulled off a subscription.
#[derive(Debug, Clone)]
pub struct ConsumedMessage {
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

enum Dispatch {
    Committed,
    Requeued,
}

/// Kafka-backed subscription to a single topic.
pub struct KafkaTopicConsumer {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaTopicConsumer {
    /// Create a consumer for the given brokers/topic/group.
    ///
    /// Auto-commit is disabled: the runtime commits offsets itself, after
    /// the handler has succeeded.
    pub fn new(brokers: &str, topic: &str, group_id: &str) -> Result<Self, KafkaError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "false")
            .create()?;

        consumer.subscribe(&[topic])?;
        Ok(Self {
            consumer,
            topic: topic.to_string(),
        })
    }
}

/// In-process subscription over a [`MemoryTopic`]. Separate subscriptions
/// to the same topic model separate consumer groups: each owns its offset.
pub struct MemorySubscription {
    topic: MemoryTopic,
    next_offset: AtomicUsize,
}

impl MemorySubscription {
    pub fn new(topic: MemoryTopic) -> Self {
        Self {
            topic,
            next_offset: AtomicUsize::new(0),
        }
    }
}

/// A single-topic subscription feeding an [`EventHandler`].
pub enum TopicConsumer {
    Kafka(KafkaTopicConsumer),
    Memory(MemorySubscription),
}

impl TopicConsumer {
    pub fn kafka(brokers: &str, topic: &str, group_id: &str) -> Result<Self, KafkaError> {
        Ok(TopicConsumer::Kafka(KafkaTopicConsumer::new(
            brokers, topic, group_id,
        )?))
    }

    pub fn memory(topic: MemoryTopic) -> Self {
        TopicConsumer::Memory(MemorySubscription::new(topic))
    }

    fn topic(&self) -> &str {
        match self {
            TopicConsumer::Kafka(kc) => &kc.topic,
            TopicConsumer::Memory(sub) => sub.topic.name(),
        }
    }

    /// Runs the consumption loop until the shutdown signal fires or a
    /// poison message is encountered.
    pub async fn run<H: EventHandler>(
        &self,
        handler: &H,
        shutdown: Arc<Notify>,
    ) -> Result<(), ConsumerError> {
        let notified = shutdown.notified();
        tokio::pin!(notified);
        loop {
            tokio::select! {
                _ = notified.as_mut() => {
                    info!(topic = %self.topic(), "consumer received shutdown signal");
                    return Ok(());
                }
                polled = self.next(POLL_WAIT) => {
                    if let Some(msg) = polled? {
                        self.dispatch(handler, msg).await?;
                    }
                }
            }
        }
    }

    /// Drains the subscription for tests and one-shot runs: keeps consuming
    /// while messages are available, and exits once none is available and
    /// `stop_after` has elapsed.
    pub async fn drain<H: EventHandler>(
        &self,
        handler: &H,
        stop_after: Duration,
    ) -> Result<(), ConsumerError> {
        let deadline = Instant::now() + stop_after;
        loop {
            match self.next(POLL_WAIT).await? {
                Some(msg) => {
                    if let Dispatch::Requeued = self.dispatch(handler, msg).await? {
                        // The failed message stays unprocessed for a later
                        // drain once the deadline has passed.
                        if Instant::now() >= deadline {
                            return Ok(());
                        }
                    }
                }
                None => {
                    if Instant::now() >= deadline {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn dispatch<H: EventHandler>(
        &self,
        handler: &H,
        msg: ConsumedMessage,
    ) -> Result<Dispatch, ConsumerError> {
        match handler.handle(&msg.payload).await {
            Ok(()) => {
                self.commit(&msg).await;
                Ok(Dispatch::Committed)
            }
            Err(HandlerError::Decode(source)) => {
                error!(
                    topic = %self.topic(),
                    offset = msg.offset,
                    "poison message: {source}"
                );
                Err(ConsumerError::Poison {
                    offset: msg.offset,
                    source,
                })
            }
            Err(HandlerError::Retry(e)) => {
                warn!(
                    topic = %self.topic(),
                    offset = msg.offset,
                    "handler failed, message will be redelivered: {e:#}"
                );
                self.rewind(&msg)?;
                tokio::time::sleep(RETRY_BACKOFF).await;
                Ok(Dispatch::Requeued)
            }
        }
    }

    /// Waits up to `wait` for the next message. Transport errors are logged
    /// and surfaced as an empty poll; they do not terminate the loop.
    async fn next(&self, wait: Duration) -> Result<Option<ConsumedMessage>, ConsumerError> {
        match self {
            TopicConsumer::Kafka(kc) => match tokio::time::timeout(wait, kc.consumer.recv()).await
            {
                Err(_) => Ok(None),
                Ok(Err(e)) => {
                    error!(topic = %kc.topic, "failed to consume message: {e}");
                    Ok(None)
                }
                Ok(Ok(msg)) => {
                    let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();
                    Ok(Some(ConsumedMessage {
                        partition: msg.partition(),
                        offset: msg.offset(),
                        payload,
                    }))
                }
            },
            TopicConsumer::Memory(sub) => {
                let offset = sub.next_offset.load(Ordering::SeqCst);
                match sub.topic.read_at(offset).await {
                    Some(payload) => Ok(Some(ConsumedMessage {
                        partition: 0,
                        offset: offset as i64,
                        payload,
                    })),
                    None => {
                        tokio::time::sleep(wait.min(Duration::from_millis(5))).await;
                        Ok(None)
                    }
                }
            }
        }
    }

    /// Advances the committed offset past `msg`. Commit failures are logged
    /// only: the message is redelivered later and the handlers absorb the
    /// duplicate.
    async fn commit(&self, msg: &ConsumedMessage) {
        match self {
            TopicConsumer::Kafka(kc) => {
                let mut tpl = TopicPartitionList::new();
                if let Err(e) = tpl
                    .add_partition_offset(&kc.topic, msg.partition, Offset::Offset(msg.offset + 1))
                {
                    warn!(topic = %kc.topic, "failed to build commit list: {e}");
                    return;
                }
                if let Err(e) = kc.consumer.commit(&tpl, CommitMode::Async) {
                    warn!(topic = %kc.topic, offset = msg.offset, "offset commit failed: {e}");
                }
            }
            TopicConsumer::Memory(sub) => {
                sub.next_offset.store(msg.offset as usize + 1, Ordering::SeqCst);
            }
        }
        debug!(topic = %self.topic(), offset = msg.offset, "message committed");
    }

    /// Moves the read position back to `msg` so the next poll re-reads it.
    fn rewind(&self, msg: &ConsumedMessage) -> Result<(), ConsumerError> {
        match self {
            TopicConsumer::Kafka(kc) => {
                kc.consumer.seek(
                    &kc.topic,
                    msg.partition,
                    Offset::Offset(msg.offset),
                    Duration::from_secs(5),
                )?;
                Ok(())
            }
            // The memory offset only advances on commit.
            TopicConsumer::Memory(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording {
        fail_first: usize,
        attempts: AtomicUsize,
        seen: Mutex<Vec<Vec<u8>>>,
    }

    impl Recording {
        fn new(fail_first: usize) -> Self {
            Self {
                fail_first,
                attempts: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EventHandler for Recording {
        async fn handle(&self, payload: &[u8]) -> Result<(), HandlerError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first {
                return Err(HandlerError::retry(anyhow::anyhow!("transient failure")));
            }
            self.seen.lock().unwrap().push(payload.to_vec());
            Ok(())
        }
    }

    struct Poisonous;

    #[async_trait]
    impl EventHandler for Poisonous {
        async fn handle(&self, payload: &[u8]) -> Result<(), HandlerError> {
            let _: serde_json::Value = serde_json::from_slice(payload)?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_drain_consumes_backlog_and_exits() {
        let topic = MemoryTopic::new("TEST");
        topic.append_all(&[b"a".to_vec(), b"b".to_vec()]).await;

        let consumer = TopicConsumer::memory(topic.clone());
        let handler = Recording::new(0);
        consumer
            .drain(&handler, Duration::from_millis(20))
            .await
            .unwrap();

        assert_eq!(*handler.seen.lock().unwrap(), vec![b"a".to_vec(), b"b".to_vec()]);

        // A later message is picked up from the committed offset.
        topic.append_all(&[b"c".to_vec()]).await;
        consumer
            .drain(&handler, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(handler.seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_handler_gets_message_redelivered() {
        let topic = MemoryTopic::new("TEST");
        topic.append_all(&[b"retry-me".to_vec()]).await;

        let consumer = TopicConsumer::memory(topic);
        let handler = Recording::new(1);
        consumer
            .drain(&handler, Duration::from_millis(500))
            .await
            .unwrap();

        // First delivery failed, second succeeded; the payload was seen once.
        assert_eq!(handler.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(handler.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_poison_message_stops_consumer() {
        let topic = MemoryTopic::new("TEST");
        topic.append_all(&[b"not json".to_vec()]).await;

        let consumer = TopicConsumer::memory(topic);
        let err = consumer
            .drain(&Poisonous, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumerError::Poison { offset: 0, .. }));
    }
}
