//! Broker seams used by the publisher and the consumer.
//!
//! The traits here keep the pipeline logic independent of rdkafka so it can be
//! driven by in-memory doubles in tests.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while talking to the broker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Failed to connect to the broker or build a client
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a record
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to a topic
    #[error("Subscription failed for topic '{topic}': {reason}")]
    SubscriptionFailed {
        /// The topic that failed to subscribe
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to commit consumer progress
    #[error("Commit failed for {topic}[{partition}]@{offset}: {reason}")]
    CommitFailed {
        /// Topic of the record
        topic: String,
        /// Partition of the record
        partition: i32,
        /// Offset that was being committed
        offset: i64,
        /// The reason for failure
        reason: String,
    },

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Where a published record landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Partition the broker assigned
    pub partition: i32,
    /// Offset within that partition
    pub offset: i64,
}

/// A record received from a claimed partition, detached from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic the record came from
    pub topic: String,
    /// Partition the record came from
    pub partition: i32,
    /// Offset of the record
    pub offset: i64,
    /// Record key, if any
    pub key: Option<Vec<u8>>,
    /// Record value, if any
    pub payload: Option<Vec<u8>>,
}

/// Producer side of the broker.
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so it can be held as
/// `Arc<dyn BrokerProducer>`.
pub trait BrokerProducer: Send + Sync {
    /// Publish one record and wait for the broker acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PublishFailed`] if the record is not acknowledged.
    fn send<'a>(
        &'a self,
        topic: &'a str,
        key: &'a str,
        payload: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<Delivery, BrokerError>> + Send + 'a>>;

    /// Wait for in-flight records to be delivered.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::TransportError`] if records are still queued
    /// when `timeout` elapses.
    fn flush(&self, timeout: Duration) -> Result<(), BrokerError>;
}

/// Consumer-group progress tracker.
pub trait OffsetCommitter: Send + Sync {
    /// Mark every record of `topic[partition]` before `next_offset` as processed.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::CommitFailed`] if the commit is rejected, e.g.
    /// after the partition was revoked.
    fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> Result<(), BrokerError>;
}
