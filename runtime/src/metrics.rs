//! Prometheus metrics for the ingest pipeline.
//!
//! [`install_recorder`] installs the global `metrics` recorder and returns the
//! handle the HTTP layer renders on `/metrics`. [`PrometheusMetrics`] is the
//! [`MetricsSink`] handed to the publisher, the consumer and the service.
//!
//! # Example
//!
//! ```rust,no_run
//! use flight_ingest_runtime::metrics::{PrometheusMetrics, install_recorder};
//! use std::sync::Arc;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let handle = install_recorder()?;
//! let sink = Arc::new(PrometheusMetrics);
//! println!("{}", handle.render());
//! # Ok(())
//! # }
//! ```

use flight_ingest_core::ledger::{LedgerStatus, StatusCounts};
use flight_ingest_core::metrics::MetricsSink;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

/// Records acknowledged by the broker.
pub const MESSAGES_PUBLISHED: &str = "flight_ingest_messages_published_total";
/// Records dropped after a failed publish.
pub const PUBLISH_ERRORS: &str = "flight_ingest_publish_errors_total";
/// Messages applied by the consumer.
pub const MESSAGES_PROCESSED: &str = "flight_ingest_messages_processed_total";
/// Messages skipped as malformed or abandoned after retries.
pub const PROCESSING_ERRORS: &str = "flight_ingest_processing_errors_total";
/// Envelopes waiting in the outbound queue.
pub const OUTBOUND_QUEUE_DEPTH: &str = "flight_ingest_outbound_queue_depth";
/// Passenger counts of applied flights.
pub const PASSENGERS: &str = "flight_ingest_passengers";
/// Applied flights per aircraft type.
pub const AIRCRAFT_TYPE: &str = "flight_ingest_aircraft_type_total";
/// Ledger entries per status.
pub const LEDGER_ENTRIES: &str = "flight_ingest_ledger_entries";
/// Submissions accepted by the request path.
pub const SUBMISSIONS_ACCEPTED: &str = "flight_ingest_submissions_accepted_total";
/// Ledger status changes.
pub const LEDGER_TRANSITIONS: &str = "flight_ingest_ledger_transitions_total";
/// HTTP requests by method, route and status.
pub const HTTP_REQUESTS: &str = "flight_ingest_http_requests_total";
/// HTTP request latency by method and route.
pub const HTTP_REQUEST_DURATION: &str = "flight_ingest_http_request_duration_seconds";

const PASSENGER_BUCKETS: &[f64] = &[
    0.0, 25.0, 50.0, 100.0, 150.0, 200.0, 250.0, 300.0, 400.0, 500.0, 850.0,
];

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

fn builder() -> Result<PrometheusBuilder, MetricsError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(PASSENGERS.to_string()), PASSENGER_BUCKETS)
        .map_err(|e| MetricsError::Build(e.to_string()))
}

/// Register metric descriptions and install the global Prometheus recorder.
///
/// # Errors
///
/// Returns [`MetricsError::Install`] if a recorder is already installed. Call
/// this once per process.
pub fn install_recorder() -> Result<PrometheusHandle, MetricsError> {
    let handle = builder()?
        .install_recorder()
        .map_err(|e| MetricsError::Install(e.to_string()))?;
    register_metrics();
    tracing::info!("Prometheus recorder installed");
    Ok(handle)
}

/// Register all metric descriptions.
pub fn register_metrics() {
    // Publisher
    describe_counter!(MESSAGES_PUBLISHED, "Total number of records acknowledged by the broker");
    describe_counter!(PUBLISH_ERRORS, "Total number of records dropped after a failed publish");
    describe_gauge!(OUTBOUND_QUEUE_DEPTH, "Envelopes waiting in the outbound queue");

    // Consumer
    describe_counter!(MESSAGES_PROCESSED, "Total number of messages applied");
    describe_counter!(
        PROCESSING_ERRORS,
        "Total number of messages skipped as malformed or abandoned after retries"
    );
    describe_histogram!(PASSENGERS, "Passenger counts of applied flights");
    describe_counter!(AIRCRAFT_TYPE, "Applied flights per aircraft type");

    // Ledger
    describe_counter!(SUBMISSIONS_ACCEPTED, "Total number of accepted submissions");
    describe_gauge!(LEDGER_ENTRIES, "Ledger entries per status");
    describe_counter!(LEDGER_TRANSITIONS, "Ledger status changes");

    // HTTP
    describe_counter!(HTTP_REQUESTS, "Total number of HTTP requests");
    describe_histogram!(HTTP_REQUEST_DURATION, "HTTP request latency in seconds");
}

/// Record one served HTTP request.
///
/// `route` is the matched route template, not the raw path, to keep label
/// cardinality bounded.
pub fn record_http_request(method: &str, route: &str, status: u16, elapsed: Duration) {
    counter!(
        HTTP_REQUESTS,
        "method" => method.to_string(),
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        HTTP_REQUEST_DURATION,
        "method" => method.to_string(),
        "route" => route.to_string()
    )
    .record(elapsed.as_secs_f64());
}

/// [`MetricsSink`] that writes to the installed `metrics` recorder.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusMetrics;

impl MetricsSink for PrometheusMetrics {
    fn message_published(&self) {
        counter!(MESSAGES_PUBLISHED).increment(1);
    }

    fn publish_failed(&self) {
        counter!(PUBLISH_ERRORS).increment(1);
    }

    fn message_processed(&self, passengers_count: i32, aircraft_type: &str) {
        counter!(MESSAGES_PROCESSED).increment(1);
        histogram!(PASSENGERS).record(f64::from(passengers_count));
        counter!(AIRCRAFT_TYPE, "aircraft_type" => aircraft_type.to_string()).increment(1);
    }

    fn processing_error(&self) {
        counter!(PROCESSING_ERRORS).increment(1);
    }

    #[allow(clippy::cast_precision_loss)] // queue capacities are small
    fn outbound_queue_depth(&self, depth: usize) {
        gauge!(OUTBOUND_QUEUE_DEPTH).set(depth as f64);
    }

    fn submission_accepted(&self) {
        counter!(SUBMISSIONS_ACCEPTED).increment(1);
        gauge!(LEDGER_ENTRIES, "status" => LedgerStatus::Pending.as_str()).increment(1.0);
    }

    fn ledger_transition(&self, from: LedgerStatus, to: LedgerStatus) {
        counter!(LEDGER_TRANSITIONS, "from" => from.as_str(), "to" => to.as_str()).increment(1);
        gauge!(LEDGER_ENTRIES, "status" => from.as_str()).decrement(1.0);
        gauge!(LEDGER_ENTRIES, "status" => to.as_str()).increment(1.0);
    }

    #[allow(clippy::cast_precision_loss)]
    fn ledger_status_counts(&self, counts: &StatusCounts) {
        for status in LedgerStatus::ALL {
            let count = counts.get(&status).copied().unwrap_or(0);
            gauge!(LEDGER_ENTRIES, "status" => status.as_str()).set(count as f64);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn render_with<F: FnOnce()>(record: F) -> String {
        let recorder = builder().unwrap().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            register_metrics();
            record();
        });
        handle.render()
    }

    #[test]
    fn processed_message_records_counter_histogram_and_aircraft() {
        let rendered = render_with(|| {
            PrometheusMetrics.message_processed(150, "A320");
            PrometheusMetrics.message_processed(180, "A320");
        });

        assert!(rendered.contains("flight_ingest_messages_processed_total 2"));
        assert!(rendered.contains("flight_ingest_aircraft_type_total{aircraft_type=\"A320\"} 2"));
        assert!(rendered.contains("flight_ingest_passengers_bucket"));
        assert!(rendered.contains("flight_ingest_passengers_count 2"));
    }

    #[test]
    fn publisher_counters_are_separate() {
        let rendered = render_with(|| {
            PrometheusMetrics.message_published();
            PrometheusMetrics.publish_failed();
            PrometheusMetrics.outbound_queue_depth(4);
        });

        assert!(rendered.contains("flight_ingest_messages_published_total 1"));
        assert!(rendered.contains("flight_ingest_publish_errors_total 1"));
        assert!(rendered.contains("flight_ingest_outbound_queue_depth 4"));
    }

    #[test]
    fn status_counts_set_every_status() {
        let rendered = render_with(|| {
            let mut counts = StatusCounts::new();
            counts.insert(LedgerStatus::Processed, 3);
            PrometheusMetrics.ledger_status_counts(&counts);
        });

        assert!(rendered.contains("flight_ingest_ledger_entries{status=\"pending\"} 0"));
        assert!(rendered.contains("flight_ingest_ledger_entries{status=\"processed\"} 3"));
        assert!(rendered.contains("flight_ingest_ledger_entries{status=\"error\"} 0"));
    }

    #[test]
    fn transition_is_counted_with_labels() {
        let rendered = render_with(|| {
            PrometheusMetrics.submission_accepted();
            PrometheusMetrics.ledger_transition(LedgerStatus::Pending, LedgerStatus::Error);
        });

        assert!(rendered.contains("flight_ingest_submissions_accepted_total 1"));
        assert!(rendered.contains("flight_ingest_ledger_transitions_total{from=\"pending\",to=\"error\"} 1"));
    }

    #[test]
    fn http_request_is_labelled_by_route() {
        let rendered = render_with(|| {
            record_http_request("POST", "/api/flights", 202, Duration::from_millis(12));
        });

        let line = rendered
            .lines()
            .find(|line| line.starts_with("flight_ingest_http_requests_total{"))
            .expect("request counter should be rendered");
        assert!(line.contains("route=\"/api/flights\""));
        assert!(line.contains("status=\"202\""));
        assert!(line.ends_with(" 1"));
        assert!(rendered.contains("flight_ingest_http_request_duration_seconds"));
    }
}
