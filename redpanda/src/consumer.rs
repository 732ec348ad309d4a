//! Consumer-group member feeding the claim workers.
//!
//! # Offsets
//!
//! Auto-commit is off. Each claim worker commits `offset + 1` explicitly
//! after the applier succeeded, after a malformed message was skipped, or
//! after retries were exhausted. A message interrupted by shutdown is never
//! committed and is redelivered to the next group member.
//!
//! # Backpressure and rebalances
//!
//! A partition whose claim buffer is full is paused at the broker while the
//! loop keeps polling the rest, and resumed once its held messages fit.
//! Revoked partitions are stopped from the rebalance callback; their
//! unprocessed messages stay uncommitted for the next owner.

use crate::claim::{Admission, ClaimRegistry, ClaimSet, DEFAULT_CLAIM_BUFFER};
use crate::processor::MessageProcessor;
use flight_ingest_core::broker::{BrokerError, InboundMessage, OffsetCommitter};
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{
    CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::KafkaResult;
use rdkafka::message::Message;
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Pause after a broker receive error before polling again.
pub const DEFAULT_RECEIVE_BACKOFF: Duration = Duration::from_secs(5);

/// How often held messages are offered to their workers again.
pub const HELD_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Client context stopping revoked claims and logging commit results.
pub struct IngestContext {
    registry: ClaimRegistry,
}

impl IngestContext {
    /// Create a context revoking claims through `registry`.
    #[must_use]
    pub const fn new(registry: ClaimRegistry) -> Self {
        Self { registry }
    }

    /// Stop the claims for `partitions`, returning those that had one.
    fn release(&self, partitions: &TopicPartitionList) -> Vec<i32> {
        self.registry.revoke(&partition_numbers(partitions))
    }
}

impl ClientContext for IngestContext {}

impl ConsumerContext for IngestContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                tracing::info!(partitions = ?partition_numbers(partitions), "Claiming partitions");
            }
            Rebalance::Revoke(partitions) => {
                let stopped = self.release(partitions);
                tracing::info!(
                    partitions = ?partition_numbers(partitions),
                    stopped = ?stopped,
                    "Releasing partitions"
                );
            }
            Rebalance::Error(e) => tracing::error!(error = %e, "Rebalance failed"),
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(partitions) = rebalance {
            tracing::debug!(partitions = ?partition_numbers(partitions), "Partitions assigned");
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => tracing::trace!(partitions = ?partition_numbers(offsets), "Commit acknowledged"),
            Err(e) => tracing::warn!(error = %e, "Commit rejected by broker"),
        }
    }
}

fn partition_numbers(list: &TopicPartitionList) -> Vec<i32> {
    list.elements().iter().map(|elem| elem.partition()).collect()
}

type IngestStreamConsumer = StreamConsumer<IngestContext>;

/// [`OffsetCommitter`] over the group's consumer handle.
#[derive(Clone)]
pub struct KafkaCommitter {
    consumer: Arc<IngestStreamConsumer>,
}

impl OffsetCommitter for KafkaCommitter {
    fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> Result<(), BrokerError> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(topic, partition, Offset::Offset(next_offset))
            .and_then(|()| self.consumer.commit(&offsets, CommitMode::Async))
            .map_err(|e| BrokerError::CommitFailed {
                topic: topic.to_string(),
                partition,
                offset: next_offset,
                reason: e.to_string(),
            })
    }
}

/// Consumer-group member for the flights topic.
///
/// # Example
///
/// ```no_run
/// use flight_ingest_redpanda::{MessageProcessor, PartitionedConsumer};
/// use std::sync::Arc;
///
/// # async fn example(processor: Arc<MessageProcessor>) -> Result<(), Box<dyn std::error::Error>> {
/// let consumer = PartitionedConsumer::builder()
///     .brokers("localhost:9092")
///     .group_id("flight-ingest")
///     .topic("flights")
///     .processor(processor)
///     .build()?;
///
/// consumer.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct PartitionedConsumer {
    consumer: Arc<IngestStreamConsumer>,
    topic: String,
    group_id: String,
    processor: Arc<MessageProcessor>,
    registry: ClaimRegistry,
    claim_buffer: usize,
    receive_backoff: Duration,
}

impl PartitionedConsumer {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> PartitionedConsumerBuilder {
        PartitionedConsumerBuilder::default()
    }

    /// Consume until the processor's cancellation token fires.
    ///
    /// On shutdown, waits for the claim workers to stop and leaves the group.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SubscriptionFailed`] if the topic subscription
    /// is rejected. Receive errors are logged and retried.
    pub async fn run(self) -> Result<(), BrokerError> {
        self.consumer
            .subscribe(&[self.topic.as_str()])
            .map_err(|e| BrokerError::SubscriptionFailed {
                topic: self.topic.clone(),
                reason: e.to_string(),
            })?;

        tracing::info!(topic = %self.topic, group_id = %self.group_id, "Joined consumer group");

        let cancel = self.processor.cancellation_token().clone();
        let committer = KafkaCommitter {
            consumer: self.consumer.clone(),
        };
        let mut claims = ClaimSet::new(
            self.processor.clone(),
            Arc::new(committer),
            self.claim_buffer,
            self.registry.clone(),
        );
        let mut paused: HashSet<i32> = HashSet::new();
        let mut held_retry = tokio::time::interval(HELD_RETRY_INTERVAL);
        held_retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let released = claims.reap_revoked();
            if !released.is_empty() {
                // Pause state does not survive reassignment.
                for partition in &released {
                    paused.remove(partition);
                }
                claims.join_retired().await;
            }

            let received = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = held_retry.tick(), if claims.has_held() => {
                    for partition in claims.release_held() {
                        if paused.remove(&partition) {
                            self.resume_partition(partition);
                        }
                    }
                    continue;
                }
                received = self.consumer.recv() => received.map(|message| inbound(&message)),
            };

            match received {
                Ok(message) => {
                    let partition = message.partition;
                    match claims.dispatch(message) {
                        Admission::Queued => {}
                        Admission::Held => {
                            if paused.insert(partition) {
                                self.pause_partition(partition);
                            }
                        }
                        Admission::Rejected if cancel.is_cancelled() => break,
                        Admission::Rejected => {}
                    }
                }
                Err(e) => {
                    tracing::error!(
                        topic = %self.topic,
                        error = %e,
                        backoff_ms = self.receive_backoff.as_millis(),
                        "Consumer receive failed"
                    );
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(self.receive_backoff) => {}
                    }
                }
            }
        }

        tracing::info!(partitions = ?claims.partitions(), "Stopping claim workers");
        claims.shutdown().await;
        self.consumer.unsubscribe();
        tracing::info!(topic = %self.topic, group_id = %self.group_id, "Left consumer group");
        Ok(())
    }

    fn pause_partition(&self, partition: i32) {
        let mut list = TopicPartitionList::new();
        list.add_partition(&self.topic, partition);
        match self.consumer.pause(&list) {
            Ok(()) => tracing::debug!(partition, "Paused partition, claim buffer full"),
            Err(e) => tracing::warn!(partition, error = %e, "Failed to pause partition"),
        }
    }

    fn resume_partition(&self, partition: i32) {
        let mut list = TopicPartitionList::new();
        list.add_partition(&self.topic, partition);
        match self.consumer.resume(&list) {
            Ok(()) => tracing::debug!(partition, "Resumed partition"),
            Err(e) => tracing::warn!(partition, error = %e, "Failed to resume partition"),
        }
    }
}

/// Copy a broker message out of the client's buffer.
fn inbound<M: Message>(message: &M) -> InboundMessage {
    InboundMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec),
    }
}

/// Builder for a [`PartitionedConsumer`].
#[derive(Default)]
pub struct PartitionedConsumerBuilder {
    brokers: Option<String>,
    group_id: Option<String>,
    topic: Option<String>,
    session_timeout: Option<Duration>,
    claim_buffer: Option<usize>,
    receive_backoff: Option<Duration>,
    processor: Option<Arc<MessageProcessor>>,
}

impl PartitionedConsumerBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the consumer group id.
    #[must_use]
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Set the topic to consume.
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Set the group session timeout.
    ///
    /// Default: 10 seconds
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Set how many messages each partition buffers ahead of its worker.
    ///
    /// Default: 32
    #[must_use]
    pub const fn claim_buffer(mut self, size: usize) -> Self {
        self.claim_buffer = Some(size);
        self
    }

    /// Set the pause after a receive error.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn receive_backoff(mut self, backoff: Duration) -> Self {
        self.receive_backoff = Some(backoff);
        self
    }

    /// Set the processor every claim worker uses. Its cancellation token
    /// stops the consumer.
    #[must_use]
    pub fn processor(mut self, processor: Arc<MessageProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Build the [`PartitionedConsumer`].
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if a required setting is
    /// missing or the client cannot be created.
    pub fn build(self) -> Result<PartitionedConsumer, BrokerError> {
        let missing = |what: &str| BrokerError::ConnectionFailed(format!("{what} not configured"));
        let brokers = self.brokers.ok_or_else(|| missing("Brokers"))?;
        let group_id = self.group_id.ok_or_else(|| missing("Consumer group"))?;
        let topic = self.topic.ok_or_else(|| missing("Topic"))?;
        let processor = self.processor.ok_or_else(|| missing("Message processor"))?;
        let session_timeout = self.session_timeout.unwrap_or(Duration::from_secs(10));
        let registry = ClaimRegistry::new();

        let consumer: IngestStreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("group.id", &group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("partition.assignment.strategy", "roundrobin")
            .set("session.timeout.ms", session_timeout.as_millis().to_string())
            .set("enable.partition.eof", "false")
            .create_with_context(IngestContext::new(registry.clone()))
            .map_err(|e| {
                BrokerError::ConnectionFailed(format!("Failed to create consumer: {e}"))
            })?;

        tracing::info!(
            brokers = %brokers,
            group_id = %group_id,
            topic = %topic,
            "Kafka consumer created"
        );

        Ok(PartitionedConsumer {
            consumer: Arc::new(consumer),
            topic,
            group_id,
            processor,
            registry,
            claim_buffer: self.claim_buffer.unwrap_or(DEFAULT_CLAIM_BUFFER),
            receive_backoff: self.receive_backoff.unwrap_or(DEFAULT_RECEIVE_BACKOFF),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use flight_ingest_core::metrics::NoopMetrics;
    use flight_ingest_runtime::retry::RetryPolicy;
    use flight_ingest_testing::{InMemoryFlightStore, RecordingCommitter};
    use rdkafka::message::{OwnedMessage, Timestamp};
    use tokio_util::sync::CancellationToken;

    fn processor() -> Arc<MessageProcessor> {
        Arc::new(MessageProcessor::new(
            Arc::new(InMemoryFlightStore::new()),
            RetryPolicy::default(),
            Arc::new(NoopMetrics),
            CancellationToken::new(),
        ))
    }

    #[test]
    fn partitioned_consumer_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<PartitionedConsumer>();
        assert_send::<KafkaCommitter>();
    }

    #[test]
    fn build_requires_processor() {
        let result = PartitionedConsumer::builder()
            .brokers("localhost:9092")
            .group_id("flight-ingest")
            .topic("flights")
            .build();
        assert!(matches!(result, Err(BrokerError::ConnectionFailed(reason)) if reason.contains("processor")));
    }

    #[test]
    fn build_requires_brokers() {
        let result = PartitionedConsumer::builder()
            .group_id("flight-ingest")
            .topic("flights")
            .processor(processor())
            .build();
        assert!(matches!(result, Err(BrokerError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn revoke_stops_only_claims_for_revoked_partitions() {
        let registry = ClaimRegistry::new();
        let committer = RecordingCommitter::new();
        let mut claims = ClaimSet::new(processor(), Arc::new(committer), 4, registry.clone());
        for partition in [0, 1] {
            let message = InboundMessage {
                topic: "flights".to_string(),
                partition,
                offset: 0,
                key: None,
                payload: None,
            };
            assert_eq!(claims.dispatch(message), Admission::Queued);
        }

        let context = IngestContext::new(registry);
        let mut revoked = TopicPartitionList::new();
        revoked.add_partition("flights", 1);
        revoked.add_partition("flights", 5);

        assert_eq!(context.release(&revoked), vec![1]);
        assert_eq!(claims.reap_revoked(), vec![1]);
        claims.shutdown().await;
    }

    #[test]
    fn inbound_copies_key_payload_and_position() {
        let owned = OwnedMessage::new(
            Some(b"{}".to_vec()),
            Some(b"42".to_vec()),
            "flights".to_string(),
            Timestamp::NotAvailable,
            3,
            17,
            None,
        );

        let message = inbound(&owned);

        assert_eq!(message.topic, "flights");
        assert_eq!(message.partition, 3);
        assert_eq!(message.offset, 17);
        assert_eq!(message.key.as_deref(), Some(&b"42"[..]));
        assert_eq!(message.payload.as_deref(), Some(&b"{}"[..]));
    }

    #[test]
    fn inbound_keeps_missing_key() {
        let owned = OwnedMessage::new(
            None,
            None,
            "flights".to_string(),
            Timestamp::NotAvailable,
            0,
            0,
            None,
        );

        let message = inbound(&owned);

        assert!(message.key.is_none());
        assert!(message.payload.is_none());
    }
}
