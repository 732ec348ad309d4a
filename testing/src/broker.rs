//! Broker doubles: a recording producer and a recording offset committer.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use flight_ingest_core::broker::{BrokerError, BrokerProducer, Delivery, OffsetCommitter};
use flight_ingest_core::envelope::partition_for;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

/// A record accepted by [`RecordingProducer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedRecord {
    /// Destination topic
    pub topic: String,
    /// Record key
    pub key: String,
    /// Record value
    pub payload: Vec<u8>,
    /// Partition chosen by the key hash
    pub partition: i32,
    /// Offset within that partition
    pub offset: i64,
}

#[derive(Debug, Default)]
struct ProducerState {
    records: Vec<PublishedRecord>,
    next_offsets: HashMap<i32, i64>,
    failures: u32,
    send_attempts: u32,
    flushed: bool,
}

/// Holds a gated [`RecordingProducer`] back until opened.
#[derive(Debug, Clone)]
pub struct ProducerGate {
    tx: Arc<watch::Sender<bool>>,
}

impl ProducerGate {
    /// Let every pending and future `send` through.
    pub fn open(&self) {
        self.tx.send_replace(true);
    }
}

/// Producer that keeps every record in memory.
///
/// Partitions are assigned with the same murmur2 hash the real producer is
/// configured with, over a fixed partition count.
#[derive(Debug, Clone)]
pub struct RecordingProducer {
    state: Arc<Mutex<ProducerState>>,
    partitions: i32,
    gate: Option<watch::Receiver<bool>>,
}

impl Default for RecordingProducer {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RecordingProducer {
    /// Producer for a topic with `partitions` partitions.
    #[must_use]
    pub fn new(partitions: i32) -> Self {
        Self {
            state: Arc::new(Mutex::new(ProducerState::default())),
            partitions,
            gate: None,
        }
    }

    /// Producer whose `send` blocks until the returned gate is opened.
    #[must_use]
    pub fn gated(partitions: i32) -> (Self, ProducerGate) {
        let (tx, rx) = watch::channel(false);
        let mut producer = Self::new(partitions);
        producer.gate = Some(rx);
        (producer, ProducerGate { tx: Arc::new(tx) })
    }

    /// Make the next `count` sends fail.
    pub fn fail_next(&self, count: u32) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).failures = count;
    }

    /// Records accepted so far, in publish order.
    #[must_use]
    pub fn records(&self) -> Vec<PublishedRecord> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).records.clone()
    }

    /// Number of `send` calls that reached the producer, failed or not.
    #[must_use]
    pub fn send_attempts(&self) -> u32 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).send_attempts
    }

    /// Whether `flush` has been called.
    #[must_use]
    pub fn flushed(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).flushed
    }
}

impl BrokerProducer for RecordingProducer {
    fn send<'a>(
        &'a self,
        topic: &'a str,
        key: &'a str,
        payload: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<Delivery, BrokerError>> + Send + 'a>> {
        Box::pin(async move {
            if let Some(mut gate) = self.gate.clone() {
                // A dropped gate counts as open.
                let _ = gate.wait_for(|open| *open).await;
            }

            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.send_attempts += 1;
            if state.failures > 0 {
                state.failures -= 1;
                return Err(BrokerError::PublishFailed {
                    topic: topic.to_string(),
                    reason: "injected failure".to_string(),
                });
            }

            let partition = partition_for(key.as_bytes(), self.partitions);
            let offset = {
                let next = state.next_offsets.entry(partition).or_insert(0);
                let offset = *next;
                *next += 1;
                offset
            };
            state.records.push(PublishedRecord {
                topic: topic.to_string(),
                key: key.to_string(),
                payload: payload.to_vec(),
                partition,
                offset,
            });
            Ok(Delivery { partition, offset })
        })
    }

    fn flush(&self, _timeout: Duration) -> Result<(), BrokerError> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).flushed = true;
        Ok(())
    }
}

/// A commit accepted by [`RecordingCommitter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedOffset {
    /// Topic
    pub topic: String,
    /// Partition
    pub partition: i32,
    /// Next offset to read
    pub next_offset: i64,
}

/// Offset committer that records every commit.
#[derive(Debug, Clone, Default)]
pub struct RecordingCommitter {
    commits: Arc<Mutex<Vec<CommittedOffset>>>,
    reject: Arc<Mutex<bool>>,
}

impl RecordingCommitter {
    /// Create an empty committer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every later commit, as after a partition revoke.
    pub fn reject_commits(&self) {
        *self.reject.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    /// Commits accepted so far.
    #[must_use]
    pub fn commits(&self) -> Vec<CommittedOffset> {
        self.commits.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Committed next-offsets for one partition, in commit order.
    #[must_use]
    pub fn offsets_for(&self, partition: i32) -> Vec<i64> {
        self.commits()
            .into_iter()
            .filter(|c| c.partition == partition)
            .map(|c| c.next_offset)
            .collect()
    }
}

impl OffsetCommitter for RecordingCommitter {
    fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> Result<(), BrokerError> {
        if *self.reject.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(BrokerError::CommitFailed {
                topic: topic.to_string(),
                partition,
                offset: next_offset,
                reason: "partition not assigned".to_string(),
            });
        }
        self.commits.lock().unwrap_or_else(PoisonError::into_inner).push(CommittedOffset {
            topic: topic.to_string(),
            partition,
            next_offset,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_key_same_partition_with_increasing_offsets() {
        let producer = RecordingProducer::new(6);

        let a = producer.send("flights", "42", b"one").await.unwrap();
        let b = producer.send("flights", "42", b"two").await.unwrap();

        assert_eq!(a.partition, b.partition);
        assert_eq!(b.offset, a.offset + 1);
        assert_eq!(producer.records().len(), 2);
    }

    #[tokio::test]
    async fn injected_failures_are_not_recorded() {
        let producer = RecordingProducer::new(1);
        producer.fail_next(1);

        assert!(producer.send("flights", "1", b"x").await.is_err());
        assert!(producer.send("flights", "2", b"y").await.is_ok());
        assert_eq!(producer.send_attempts(), 2);
        assert_eq!(producer.records().len(), 1);
    }

    #[test]
    fn rejected_commits_are_errors() {
        let committer = RecordingCommitter::new();
        committer.commit("flights", 0, 1).unwrap();
        committer.reject_commits();

        assert!(committer.commit("flights", 0, 2).is_err());
        assert_eq!(committer.offsets_for(0), vec![1]);
    }
}
