//! Metrics sink that counts calls for assertions.

use flight_ingest_core::ledger::{LedgerStatus, StatusCounts};
use flight_ingest_core::metrics::MetricsSink;
use std::sync::{Mutex, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counts every [`MetricsSink`] call.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    published: AtomicU64,
    publish_errors: AtomicU64,
    processed: AtomicU64,
    processing_errors: AtomicU64,
    accepted: AtomicU64,
    queue_depths: Mutex<Vec<usize>>,
    transitions: Mutex<Vec<(LedgerStatus, LedgerStatus)>>,
    last_counts: Mutex<Option<StatusCounts>>,
}

impl RecordingMetrics {
    /// Create a sink with every count at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records acknowledged by the broker.
    #[must_use]
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    /// Records dropped after a failed publish.
    #[must_use]
    pub fn publish_errors(&self) -> u64 {
        self.publish_errors.load(Ordering::SeqCst)
    }

    /// Messages applied.
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    /// Messages skipped or abandoned.
    #[must_use]
    pub fn processing_errors(&self) -> u64 {
        self.processing_errors.load(Ordering::SeqCst)
    }

    /// Submissions accepted.
    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Every queue depth sample, in order.
    #[must_use]
    pub fn queue_depths(&self) -> Vec<usize> {
        self.queue_depths.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Every ledger transition, in order.
    #[must_use]
    pub fn transitions(&self) -> Vec<(LedgerStatus, LedgerStatus)> {
        self.transitions.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// The last status counts reported.
    #[must_use]
    pub fn last_counts(&self) -> Option<StatusCounts> {
        self.last_counts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl MetricsSink for RecordingMetrics {
    fn message_published(&self) {
        self.published.fetch_add(1, Ordering::SeqCst);
    }

    fn publish_failed(&self) {
        self.publish_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn message_processed(&self, _passengers_count: i32, _aircraft_type: &str) {
        self.processed.fetch_add(1, Ordering::SeqCst);
    }

    fn processing_error(&self) {
        self.processing_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn outbound_queue_depth(&self, depth: usize) {
        self.queue_depths.lock().unwrap_or_else(PoisonError::into_inner).push(depth);
    }

    fn submission_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::SeqCst);
    }

    fn ledger_transition(&self, from: LedgerStatus, to: LedgerStatus) {
        self.transitions.lock().unwrap_or_else(PoisonError::into_inner).push((from, to));
    }

    fn ledger_status_counts(&self, counts: &StatusCounts) {
        *self.last_counts.lock().unwrap_or_else(PoisonError::into_inner) = Some(counts.clone());
    }
}
