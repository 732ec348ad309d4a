//! # Flight Ingest Testing
//!
//! In-memory doubles for every collaborator seam of the pipeline, so the
//! publisher, the consumer and the service can be exercised without a broker
//! or a database:
//!
//! - [`InMemoryFlightStore`]: ledger, flight records and applier in one map
//! - [`RecordingProducer`]: captures published records, can be gated or failed
//! - [`RecordingCommitter`]: captures committed offsets
//! - [`RecordingMetrics`]: counts every [`MetricsSink`] call
//!
//! [`MetricsSink`]: flight_ingest_core::metrics::MetricsSink

pub mod broker;
pub mod metrics;
pub mod store;

pub use broker::{
    CommittedOffset, ProducerGate, PublishedRecord, RecordingCommitter, RecordingProducer,
};
pub use metrics::RecordingMetrics;
pub use store::InMemoryFlightStore;

/// Fixtures shared across test suites.
pub mod fixtures {
    use chrono::{DateTime, TimeZone, Utc};
    use flight_ingest_core::flight::FlightSubmission;

    /// 2025-06-01T10:00:00Z, the departure used throughout the suites.
    ///
    /// # Panics
    ///
    /// Never in practice; the timestamp is hardcoded and valid.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_departure() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0)
            .single()
            .expect("hardcoded timestamp should always be valid")
    }

    /// A valid submission for `flight_number` departing at [`test_departure`].
    #[must_use]
    pub fn submission(flight_number: &str) -> FlightSubmission {
        let departure_date = test_departure();
        FlightSubmission {
            aircraft_type: "A320".to_string(),
            flight_number: flight_number.to_string(),
            departure_date,
            arrival_date: departure_date + chrono::Duration::minutes(150),
            passengers_count: 150,
        }
    }

    /// Install a `tracing` subscriber that writes through the test harness.
    ///
    /// Safe to call from every test; only the first call installs.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;

    #[test]
    fn fixture_submission_is_valid() {
        let submission = submission("AB123");
        assert_eq!(submission.validate(), Ok(()));
        assert_eq!(submission.departure_date, test_departure());
        assert!(submission.arrival_date > submission.departure_date);
    }
}
