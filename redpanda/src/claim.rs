//! Per-partition claim workers.
//!
//! Each claimed partition gets one task that processes its messages strictly
//! in offset order and commits `offset + 1` after every committable outcome.
//!
//! Dispatch never waits. When a partition's buffer is full the message is
//! held in that claim's backlog and [`Admission::Held`] tells the caller to
//! pause the partition; other partitions keep flowing. A revoked claim stops
//! at once and its buffered and held messages are discarded uncommitted.

use crate::processor::MessageProcessor;
use flight_ingest_core::broker::{InboundMessage, OffsetCommitter};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default number of messages buffered per partition.
pub const DEFAULT_CLAIM_BUFFER: usize = 32;

/// What [`ClaimSet::dispatch`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Buffered for the partition's worker.
    Queued,
    /// The worker's buffer is full; kept in the claim's backlog until
    /// [`ClaimSet::release_held`] can hand it over.
    Held,
    /// Not accepted: shutdown was signalled or the worker has stopped.
    Rejected,
}

/// Revocation handles for live claims, shared with the rebalance callback.
///
/// Cancelling a claim's token from librdkafka's thread stops its worker
/// before the revoke returns, so nothing further is committed for that
/// partition.
#[derive(Debug, Clone, Default)]
pub struct ClaimRegistry {
    tokens: Arc<Mutex<HashMap<i32, CancellationToken>>>,
}

impl ClaimRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the claims for `partitions`.
    ///
    /// Returns the partitions that had a live claim, sorted.
    pub fn revoke(&self, partitions: &[i32]) -> Vec<i32> {
        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        let mut revoked: Vec<i32> = partitions
            .iter()
            .filter_map(|partition| {
                tokens.remove(partition).map(|token| {
                    token.cancel();
                    *partition
                })
            })
            .collect();
        revoked.sort_unstable();
        revoked
    }

    fn register(&self, partition: i32, token: CancellationToken) {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(partition, token);
    }

    fn forget(&self, partition: i32) {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&partition);
    }
}

/// Worker for one claimed partition.
pub struct ClaimWorker {
    partition: i32,
    rx: mpsc::Receiver<InboundMessage>,
    processor: Arc<MessageProcessor>,
    committer: Arc<dyn OffsetCommitter>,
    revoked: CancellationToken,
}

impl ClaimWorker {
    /// Create a worker reading from `rx`.
    ///
    /// `revoked` should be a child of the processor's shutdown token.
    #[must_use]
    pub fn new(
        partition: i32,
        rx: mpsc::Receiver<InboundMessage>,
        processor: Arc<MessageProcessor>,
        committer: Arc<dyn OffsetCommitter>,
        revoked: CancellationToken,
    ) -> Self {
        Self {
            partition,
            rx,
            processor,
            committer,
            revoked,
        }
    }

    /// Process messages until the channel closes, shutdown is signalled or
    /// the partition is revoked.
    ///
    /// Messages still buffered when the worker stops are left uncommitted.
    pub async fn run(mut self) {
        tracing::debug!(partition = self.partition, "Claim worker started");

        loop {
            let message = tokio::select! {
                biased;
                () = self.revoked.cancelled() => break,
                message = self.rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let outcome = self.processor.process_until(&message, &self.revoked).await;
            if !outcome.should_commit() || self.revoked.is_cancelled() {
                break;
            }

            let next_offset = message.offset + 1;
            match self
                .committer
                .commit(&message.topic, message.partition, next_offset)
            {
                Ok(()) => tracing::trace!(
                    partition = message.partition,
                    offset = next_offset,
                    "Offset committed"
                ),
                Err(e) => tracing::warn!(
                    partition = message.partition,
                    offset = next_offset,
                    error = %e,
                    "Offset commit failed"
                ),
            }
        }

        tracing::debug!(partition = self.partition, "Claim worker stopped");
    }
}

struct Claim {
    tx: mpsc::Sender<InboundMessage>,
    held: VecDeque<InboundMessage>,
    revoked: CancellationToken,
    task: JoinHandle<()>,
}

/// Routes messages to their partition's [`ClaimWorker`], spawning on demand.
pub struct ClaimSet {
    processor: Arc<MessageProcessor>,
    committer: Arc<dyn OffsetCommitter>,
    buffer: usize,
    registry: ClaimRegistry,
    claims: HashMap<i32, Claim>,
    retired: Vec<(i32, JoinHandle<()>)>,
}

impl ClaimSet {
    /// Create an empty set. `buffer` is the per-partition channel capacity.
    #[must_use]
    pub fn new(
        processor: Arc<MessageProcessor>,
        committer: Arc<dyn OffsetCommitter>,
        buffer: usize,
        registry: ClaimRegistry,
    ) -> Self {
        Self {
            processor,
            committer,
            buffer: buffer.max(1),
            registry,
            claims: HashMap::new(),
            retired: Vec::new(),
        }
    }

    /// Hand `message` to its partition's worker without waiting.
    ///
    /// A partition whose previous claim was revoked gets a fresh worker.
    pub fn dispatch(&mut self, message: InboundMessage) -> Admission {
        if self.processor.cancellation_token().is_cancelled() {
            return Admission::Rejected;
        }

        let partition = message.partition;
        if self
            .claims
            .get(&partition)
            .is_some_and(|claim| claim.revoked.is_cancelled())
        {
            self.retire(partition);
        }

        let claim = self.claim_for(partition);
        if !claim.held.is_empty() {
            claim.held.push_back(message);
            return Admission::Held;
        }

        match claim.tx.try_send(message) {
            Ok(()) => Admission::Queued,
            Err(TrySendError::Full(message)) => {
                tracing::debug!(
                    partition,
                    offset = message.offset,
                    "Claim buffer full, holding message"
                );
                claim.held.push_back(message);
                Admission::Held
            }
            Err(TrySendError::Closed(message)) => {
                tracing::warn!(
                    partition,
                    offset = message.offset,
                    "Claim worker stopped, message left uncommitted"
                );
                Admission::Rejected
            }
        }
    }

    /// Move held messages into their workers' buffers as space frees up.
    ///
    /// Returns the partitions whose backlog is now empty, sorted.
    pub fn release_held(&mut self) -> Vec<i32> {
        let mut released = Vec::new();

        for (partition, claim) in &mut self.claims {
            if claim.held.is_empty() {
                continue;
            }

            while let Some(message) = claim.held.pop_front() {
                match claim.tx.try_send(message) {
                    Ok(()) => {}
                    Err(TrySendError::Full(message)) => {
                        claim.held.push_front(message);
                        break;
                    }
                    Err(TrySendError::Closed(_)) => {
                        tracing::warn!(
                            partition = *partition,
                            discarded = claim.held.len() + 1,
                            "Claim worker stopped, held messages left uncommitted"
                        );
                        claim.held.clear();
                    }
                }
            }

            if claim.held.is_empty() {
                released.push(*partition);
            }
        }

        released.sort_unstable();
        released
    }

    /// Whether any claim has messages waiting for buffer space.
    #[must_use]
    pub fn has_held(&self) -> bool {
        self.claims.values().any(|claim| !claim.held.is_empty())
    }

    /// Drop claims revoked through the [`ClaimRegistry`].
    ///
    /// Returns the released partitions, sorted. Their tasks are awaited by
    /// [`join_retired`](Self::join_retired).
    pub fn reap_revoked(&mut self) -> Vec<i32> {
        let mut revoked: Vec<i32> = self
            .claims
            .iter()
            .filter(|(_, claim)| claim.revoked.is_cancelled())
            .map(|(partition, _)| *partition)
            .collect();
        revoked.sort_unstable();

        for partition in &revoked {
            self.retire(*partition);
        }
        revoked
    }

    /// Wait for every released worker to stop.
    pub async fn join_retired(&mut self) {
        for (partition, task) in self.retired.drain(..) {
            if let Err(e) = task.await {
                tracing::error!(partition, error = %e, "Claim worker panicked");
            }
        }
    }

    /// Stop `partition`'s worker and discard its unprocessed messages.
    ///
    /// Returns once the worker has stopped; nothing more is committed for
    /// the partition after that.
    pub async fn revoke(&mut self, partition: i32) {
        self.registry.revoke(&[partition]);
        if self.claims.contains_key(&partition) {
            self.retire(partition);
        }
        self.join_retired().await;
    }

    /// Partitions with a live worker, sorted.
    #[must_use]
    pub fn partitions(&self) -> Vec<i32> {
        let mut partitions: Vec<i32> = self.claims.keys().copied().collect();
        partitions.sort_unstable();
        partitions
    }

    /// Close every worker's channel and wait for them to stop.
    ///
    /// Without cancellation the workers drain what is buffered first. Held
    /// messages are left uncommitted.
    pub async fn shutdown(mut self) {
        self.join_retired().await;
        for (partition, claim) in self.claims.drain() {
            if !claim.held.is_empty() {
                tracing::debug!(
                    partition,
                    held = claim.held.len(),
                    "Held messages left uncommitted"
                );
            }
            drop(claim.tx);
            if let Err(e) = claim.task.await {
                tracing::error!(partition, error = %e, "Claim worker panicked");
            }
            self.registry.forget(partition);
        }
    }

    fn claim_for(&mut self, partition: i32) -> &mut Claim {
        self.claims.entry(partition).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(self.buffer);
            let revoked = self.processor.cancellation_token().child_token();
            self.registry.register(partition, revoked.clone());
            let worker = ClaimWorker::new(
                partition,
                rx,
                self.processor.clone(),
                self.committer.clone(),
                revoked.clone(),
            );
            tracing::info!(partition, "Claimed partition");
            Claim {
                tx,
                held: VecDeque::new(),
                revoked,
                task: tokio::spawn(worker.run()),
            }
        })
    }

    fn retire(&mut self, partition: i32) {
        if let Some(claim) = self.claims.remove(&partition) {
            claim.revoked.cancel();
            tracing::info!(
                partition,
                discarded_held = claim.held.len(),
                "Released partition"
            );
            self.retired.push((partition, claim.task));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use flight_ingest_core::envelope::Envelope;
    use flight_ingest_core::ledger::{LedgerId, LedgerStatus};
    use flight_ingest_core::store::SubmissionLedger;
    use flight_ingest_runtime::retry::RetryPolicy;
    use flight_ingest_testing::fixtures::{submission, test_departure};
    use flight_ingest_testing::{InMemoryFlightStore, RecordingCommitter, RecordingMetrics};
    use std::time::Duration;

    fn message(partition: i32, offset: i64, id: LedgerId) -> InboundMessage {
        let envelope = Envelope::new(id, submission("AB123"));
        InboundMessage {
            topic: "flights".to_string(),
            partition,
            offset,
            key: Some(envelope.routing_key().into_bytes()),
            payload: Some(envelope.encode_value().unwrap()),
        }
    }

    fn claim_set_with(
        store: &InMemoryFlightStore,
        committer: &RecordingCommitter,
        cancel: &CancellationToken,
        buffer: usize,
        registry: ClaimRegistry,
    ) -> ClaimSet {
        let processor = MessageProcessor::new(
            Arc::new(store.clone()),
            RetryPolicy::default(),
            Arc::new(RecordingMetrics::new()),
            cancel.clone(),
        );
        ClaimSet::new(Arc::new(processor), Arc::new(committer.clone()), buffer, registry)
    }

    fn claim_set(
        store: &InMemoryFlightStore,
        committer: &RecordingCommitter,
        cancel: &CancellationToken,
    ) -> ClaimSet {
        claim_set_with(store, committer, cancel, 4, ClaimRegistry::new())
    }

    #[tokio::test]
    async fn commits_next_offset_in_partition_order() {
        let store = InMemoryFlightStore::new();
        let committer = RecordingCommitter::new();
        let cancel = CancellationToken::new();
        let mut claims = claim_set(&store, &committer, &cancel);

        for offset in 0..3 {
            let id = store.create_pending("AB123", test_departure()).await.unwrap();
            assert_eq!(claims.dispatch(message(2, offset, id)), Admission::Queued);
        }
        assert_eq!(claims.partitions(), vec![2]);
        claims.shutdown().await;

        assert_eq!(committer.offsets_for(2), vec![1, 2, 3]);
        assert!(committer.commits().iter().all(|c| c.topic == "flights"));
    }

    #[tokio::test]
    async fn malformed_message_is_committed() {
        let store = InMemoryFlightStore::new();
        let committer = RecordingCommitter::new();
        let cancel = CancellationToken::new();
        let mut claims = claim_set(&store, &committer, &cancel);

        let poison = InboundMessage {
            topic: "flights".to_string(),
            partition: 0,
            offset: 11,
            key: Some(b"1".to_vec()),
            payload: Some(b"garbage".to_vec()),
        };
        let id = store.create_pending("AB123", test_departure()).await.unwrap();
        assert_eq!(claims.dispatch(poison), Admission::Queued);
        assert_eq!(claims.dispatch(message(0, 12, id)), Admission::Queued);
        claims.shutdown().await;

        assert_eq!(committer.offsets_for(0), vec![12, 13]);
        assert_eq!(store.apply_calls(), 1);
        assert_eq!(store.entry(id).unwrap().status, LedgerStatus::Processed);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_partition_does_not_block_others() {
        let store = InMemoryFlightStore::new();
        let committer = RecordingCommitter::new();
        let cancel = CancellationToken::new();
        let mut claims = claim_set(&store, &committer, &cancel);

        // No ledger entry: retried for 10s, then abandoned.
        assert_eq!(claims.dispatch(message(0, 0, LedgerId::new(404))), Admission::Queued);
        let id = store.create_pending("AB123", test_departure()).await.unwrap();
        assert_eq!(claims.dispatch(message(1, 0, id)), Admission::Queued);
        claims.shutdown().await;

        let commits = committer.commits();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].partition, 1);
        assert_eq!(commits[1].partition, 0);
        assert_eq!(store.entry(id).unwrap().status, LedgerStatus::Processed);
    }

    #[tokio::test(start_paused = true)]
    async fn full_partition_is_held_without_blocking_others() {
        let store = InMemoryFlightStore::new();
        let committer = RecordingCommitter::new();
        let cancel = CancellationToken::new();
        let mut claims = claim_set_with(&store, &committer, &cancel, 1, ClaimRegistry::new());

        assert_eq!(claims.dispatch(message(0, 0, LedgerId::new(404))), Admission::Queued);
        tokio::time::sleep(Duration::from_millis(1)).await;

        let a = store.create_pending("AB123", test_departure()).await.unwrap();
        let b = store.create_pending("AB123", test_departure()).await.unwrap();
        assert_eq!(claims.dispatch(message(0, 1, a)), Admission::Queued);
        assert_eq!(claims.dispatch(message(0, 2, b)), Admission::Held);
        assert!(claims.has_held());

        let other = store.create_pending("AB123", test_departure()).await.unwrap();
        assert_eq!(claims.dispatch(message(1, 0, other)), Admission::Queued);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(committer.offsets_for(1), vec![1]);
        assert!(committer.offsets_for(0).is_empty());
        assert_eq!(store.entry(other).unwrap().status, LedgerStatus::Processed);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(claims.release_held(), vec![0]);
        assert!(!claims.has_held());
        claims.shutdown().await;

        assert_eq!(committer.offsets_for(0), vec![1, 2, 3]);
        assert_eq!(store.entry(b).unwrap().status, LedgerStatus::Processed);
    }

    #[tokio::test(start_paused = true)]
    async fn revoked_claim_discards_buffered_messages() {
        let store = InMemoryFlightStore::new();
        let committer = RecordingCommitter::new();
        let cancel = CancellationToken::new();
        let mut claims = claim_set(&store, &committer, &cancel);

        let ids = [
            store.create_pending("AB123", test_departure()).await.unwrap(),
            store.create_pending("AB123", test_departure()).await.unwrap(),
            store.create_pending("AB123", test_departure()).await.unwrap(),
        ];
        store.fail_next_applies(10);
        assert_eq!(claims.dispatch(message(3, 0, ids[0])), Admission::Queued);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(claims.dispatch(message(3, 1, ids[1])), Admission::Queued);
        assert_eq!(claims.dispatch(message(3, 2, ids[2])), Admission::Queued);

        claims.revoke(3).await;
        assert!(claims.partitions().is_empty());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(committer.commits().is_empty());
        assert_eq!(store.apply_calls(), 1);
        for id in ids {
            assert_eq!(store.entry(id).unwrap().status, LedgerStatus::Pending);
        }
        claims.shutdown().await;
    }

    #[tokio::test]
    async fn registry_revocation_releases_only_that_partition() {
        let store = InMemoryFlightStore::new();
        let committer = RecordingCommitter::new();
        let cancel = CancellationToken::new();
        let registry = ClaimRegistry::new();
        let mut claims = claim_set_with(&store, &committer, &cancel, 4, registry.clone());

        let first = store.create_pending("AB123", test_departure()).await.unwrap();
        let second = store.create_pending("AB123", test_departure()).await.unwrap();
        assert_eq!(claims.dispatch(message(3, 0, first)), Admission::Queued);
        assert_eq!(claims.dispatch(message(4, 0, second)), Admission::Queued);

        assert_eq!(registry.revoke(&[3, 9]), vec![3]);
        assert_eq!(claims.reap_revoked(), vec![3]);
        claims.join_retired().await;
        assert_eq!(claims.partitions(), vec![4]);

        // Reassigned later: a fresh worker picks up from the redelivered offset.
        let again = store.create_pending("AB123", test_departure()).await.unwrap();
        assert_eq!(claims.dispatch(message(3, 7, again)), Admission::Queued);
        assert_eq!(claims.partitions(), vec![3, 4]);
        claims.shutdown().await;

        assert_eq!(committer.offsets_for(3).last(), Some(&8));
        assert_eq!(committer.offsets_for(4), vec![1]);
        assert_eq!(store.entry(again).unwrap().status, LedgerStatus::Processed);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_message_is_not_committed() {
        let store = InMemoryFlightStore::new();
        let committer = RecordingCommitter::new();
        let cancel = CancellationToken::new();
        let mut claims = claim_set(&store, &committer, &cancel);

        let id = store.create_pending("AB123", test_departure()).await.unwrap();
        store.fail_next_applies(10);
        assert_eq!(claims.dispatch(message(0, 5, id)), Admission::Queued);

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        assert_eq!(claims.dispatch(message(0, 6, id)), Admission::Rejected);
        claims.shutdown().await;

        assert!(committer.commits().is_empty());
        assert_eq!(store.entry(id).unwrap().status, LedgerStatus::Pending);
    }

    #[tokio::test]
    async fn commit_failure_does_not_stop_the_worker() {
        let store = InMemoryFlightStore::new();
        let committer = RecordingCommitter::new();
        committer.reject_commits();
        let cancel = CancellationToken::new();
        let mut claims = claim_set(&store, &committer, &cancel);

        let first = store.create_pending("AB123", test_departure()).await.unwrap();
        let second = store.create_pending("AB123", test_departure()).await.unwrap();
        assert_eq!(claims.dispatch(message(0, 0, first)), Admission::Queued);
        assert_eq!(claims.dispatch(message(0, 1, second)), Admission::Queued);
        claims.shutdown().await;

        assert!(committer.commits().is_empty());
        assert_eq!(store.entry(first).unwrap().status, LedgerStatus::Processed);
        assert_eq!(store.entry(second).unwrap().status, LedgerStatus::Processed);
    }
}
