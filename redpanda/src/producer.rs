//! rdkafka-backed [`BrokerProducer`].

use flight_ingest_core::broker::{BrokerError, BrokerProducer, Delivery};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Kafka producer publishing keyed records.
///
/// Records are keyed by the envelope's correlation id and partitioned with
/// `murmur2_random`, so every message for one ledger entry lands on one
/// partition and [`partition_for`] predicts where.
///
/// # Example
///
/// ```no_run
/// use flight_ingest_redpanda::KafkaProducer;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let producer = KafkaProducer::builder()
///     .brokers("localhost:9092")
///     .acks("all")
///     .compression("lz4")
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
///
/// [`partition_for`]: flight_ingest_core::envelope::partition_for
pub struct KafkaProducer {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaProducer {
    /// Create a producer with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the client cannot be created.
    pub fn new(brokers: &str) -> Result<Self, BrokerError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the producer.
    #[must_use]
    pub fn builder() -> KafkaProducerBuilder {
        KafkaProducerBuilder::default()
    }
}

/// Builder for a [`KafkaProducer`].
#[derive(Default)]
pub struct KafkaProducerBuilder {
    brokers: Option<String>,
    acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    retries: Option<u32>,
}

impl KafkaProducerBuilder {
    /// Set the broker addresses.
    ///
    /// # Parameters
    ///
    /// - `brokers`: Comma-separated list of broker addresses (e.g., "localhost:9092")
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode: "0", "1" or "all".
    ///
    /// Default: "all"
    #[must_use]
    pub fn acks(mut self, acks: impl Into<String>) -> Self {
        self.acks = Some(acks.into());
        self
    }

    /// Set the compression codec: "none", "gzip", "snappy", "lz4" or "zstd".
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the delivery timeout for one record, client retries included.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set how many times the client resends a record before reporting failure.
    ///
    /// Default: 3
    #[must_use]
    pub const fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Build the [`KafkaProducer`].
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if brokers are not set or the
    /// client cannot be created.
    pub fn build(self) -> Result<KafkaProducer, BrokerError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BrokerError::ConnectionFailed("Brokers not configured".to_string()))?;
        let acks = self.acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));
        let retries = self.retries.unwrap_or(3);

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .set("retries", retries.to_string())
            .set("partitioner", "murmur2_random")
            .create()
            .map_err(|e| {
                BrokerError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;

        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            retries,
            timeout_ms = timeout.as_millis(),
            "Kafka producer created"
        );

        Ok(KafkaProducer { producer, timeout })
    }
}

impl BrokerProducer for KafkaProducer {
    fn send<'a>(
        &'a self,
        topic: &'a str,
        key: &'a str,
        payload: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<Delivery, BrokerError>> + Send + 'a>> {
        Box::pin(async move {
            let record = FutureRecord::to(topic).key(key).payload(payload);

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => Ok(Delivery { partition, offset }),
                Err((kafka_error, _)) => Err(BrokerError::PublishFailed {
                    topic: topic.to_string(),
                    reason: kafka_error.to_string(),
                }),
            }
        })
    }

    fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|e| BrokerError::TransportError(format!("Flush failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kafka_producer_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<KafkaProducer>();
        assert_sync::<KafkaProducer>();
    }

    #[test]
    fn build_without_brokers_fails() {
        let result = KafkaProducer::builder().acks("1").build();
        assert!(matches!(result, Err(BrokerError::ConnectionFailed(_))));
    }
}
