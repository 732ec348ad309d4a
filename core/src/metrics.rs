//! Metrics sink injected into every pipeline component.
//!
//! Components never touch a global registry. They receive an
//! `Arc<dyn MetricsSink>` at construction; the Prometheus-backed sink lives in
//! `flight-ingest-runtime`.

use crate::ledger::{LedgerStatus, StatusCounts};

/// Receiver of pipeline measurements.
pub trait MetricsSink: Send + Sync {
    /// A record was acknowledged by the broker.
    fn message_published(&self);

    /// A record was dropped after a failed publish.
    fn publish_failed(&self);

    /// A message was applied.
    fn message_processed(&self, passengers_count: i32, aircraft_type: &str);

    /// A message was skipped as malformed or gave up after retries.
    fn processing_error(&self);

    /// Current number of envelopes waiting in the outbound queue.
    fn outbound_queue_depth(&self, depth: usize);

    /// A submission was accepted and its ledger entry created.
    fn submission_accepted(&self);

    /// A ledger entry changed status.
    fn ledger_transition(&self, from: LedgerStatus, to: LedgerStatus);

    /// Authoritative per-status counts read from storage.
    fn ledger_status_counts(&self, counts: &StatusCounts);
}

/// Sink that drops every measurement.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn message_published(&self) {}

    fn publish_failed(&self) {}

    fn message_processed(&self, _passengers_count: i32, _aircraft_type: &str) {}

    fn processing_error(&self) {}

    fn outbound_queue_depth(&self, _depth: usize) {}

    fn submission_accepted(&self) {}

    fn ledger_transition(&self, _from: LedgerStatus, _to: LedgerStatus) {}

    fn ledger_status_counts(&self, _counts: &StatusCounts) {}
}
