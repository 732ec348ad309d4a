//! Submission service: the synchronous half of the pipeline.
//!
//! Accepting a submission creates its ledger entry first and only then hands
//! the envelope to the outbound publisher, so no message ever names an entry
//! that does not exist yet.

use chrono::{DateTime, Utc};
use flight_ingest_core::envelope::Envelope;
use flight_ingest_core::flight::{FlightRecord, FlightSubmission, SubmissionError};
use flight_ingest_core::ledger::{LedgerId, LedgerPage, LedgerQuery, StatusCounts};
use flight_ingest_core::metrics::MetricsSink;
use flight_ingest_core::store::{FlightLookup, StoreError, SubmissionLedger};
use flight_ingest_redpanda::OutboundPublisher;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced to the request layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The submission failed validation
    #[error(transparent)]
    Invalid(#[from] SubmissionError),

    /// No flight record exists for the key
    #[error("flight {flight_number} departing {departure_date} not found")]
    NotFound {
        /// Flight identifier
        flight_number: String,
        /// Scheduled departure
        departure_date: DateTime<Utc>,
    },

    /// Storage failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Creates submissions and answers read queries.
pub struct SubmissionService {
    ledger: Arc<dyn SubmissionLedger>,
    flights: Arc<dyn FlightLookup>,
    publisher: Arc<OutboundPublisher>,
    metrics: Arc<dyn MetricsSink>,
}

impl SubmissionService {
    /// Create a service.
    #[must_use]
    pub fn new(
        ledger: Arc<dyn SubmissionLedger>,
        flights: Arc<dyn FlightLookup>,
        publisher: Arc<OutboundPublisher>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            ledger,
            flights,
            publisher,
            metrics,
        }
    }

    /// Accept a submission and return its ledger id.
    ///
    /// Waits only while the outbound queue is full. If the publisher is
    /// already closed the entry stays `pending` and the id is still returned.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Invalid`] before anything is written, or
    /// [`ServiceError::Store`] if the ledger entry cannot be created.
    pub async fn create_submission(
        &self,
        submission: FlightSubmission,
    ) -> Result<LedgerId, ServiceError> {
        submission.validate()?;

        let id = self
            .ledger
            .create_pending(&submission.flight_number, submission.departure_date)
            .await?;
        self.metrics.submission_accepted();

        tracing::info!(
            correlation_id = %id,
            flight_number = %submission.flight_number,
            departure_date = %submission.departure_date,
            "Submission accepted"
        );

        if let Err(e) = self.publisher.enqueue(Envelope::new(id, submission)).await {
            tracing::warn!(correlation_id = %id, error = %e, "Submission not queued for publishing");
        }

        Ok(id)
    }

    /// Read the flight record for `(flight_number, departure_date)`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`] if no record exists yet.
    pub async fn get_flight(
        &self,
        flight_number: &str,
        departure_date: DateTime<Utc>,
    ) -> Result<FlightRecord, ServiceError> {
        self.flights
            .get_flight(flight_number, departure_date)
            .await?
            .ok_or_else(|| ServiceError::NotFound {
                flight_number: flight_number.to_string(),
                departure_date,
            })
    }

    /// List ledger entries of one flight, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] if the listing fails.
    pub async fn list_submissions(&self, query: &LedgerQuery) -> Result<LedgerPage, ServiceError> {
        Ok(self.ledger.list_by_flight_number(query).await?)
    }

    /// Reset the per-status gauges from storage.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] if the counts cannot be read.
    pub async fn refresh_status_gauges(&self) -> Result<StatusCounts, ServiceError> {
        let counts = self.ledger.status_counts().await?;
        self.metrics.ledger_status_counts(&counts);
        tracing::debug!(?counts, "Ledger status gauges refreshed");
        Ok(counts)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use flight_ingest_core::envelope::decode_key;
    use flight_ingest_core::ledger::LedgerStatus;
    use flight_ingest_core::store::StoreFuture;
    use flight_ingest_testing::fixtures::{submission, test_departure};
    use flight_ingest_testing::{InMemoryFlightStore, RecordingMetrics, RecordingProducer};

    struct Harness {
        store: InMemoryFlightStore,
        producer: RecordingProducer,
        publisher: Arc<OutboundPublisher>,
        metrics: Arc<RecordingMetrics>,
        service: SubmissionService,
    }

    fn harness() -> Harness {
        let store = InMemoryFlightStore::new();
        let producer = RecordingProducer::new(3);
        let metrics = Arc::new(RecordingMetrics::new());
        let publisher = Arc::new(OutboundPublisher::new(
            Arc::new(producer.clone()),
            "flights",
            10,
            metrics.clone(),
        ));
        publisher.start().unwrap();
        let service = SubmissionService::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            publisher.clone(),
            metrics.clone(),
        );
        Harness {
            store,
            producer,
            publisher,
            metrics,
            service,
        }
    }

    struct FailingLedger;

    impl SubmissionLedger for FailingLedger {
        fn create_pending<'a>(
            &'a self,
            _flight_number: &'a str,
            _departure_date: DateTime<Utc>,
        ) -> StoreFuture<'a, LedgerId> {
            Box::pin(async { Err(StoreError::DatabaseError("connection refused".to_string())) })
        }

        fn list_by_flight_number<'a>(&'a self, _query: &'a LedgerQuery) -> StoreFuture<'a, LedgerPage> {
            Box::pin(async { Err(StoreError::DatabaseError("connection refused".to_string())) })
        }

        fn status_counts(&self) -> StoreFuture<'_, StatusCounts> {
            Box::pin(async { Err(StoreError::DatabaseError("connection refused".to_string())) })
        }
    }

    #[tokio::test]
    async fn accepted_submission_is_pending_and_published_with_its_id() {
        let h = harness();

        let id = h.service.create_submission(submission("AB123")).await.unwrap();
        h.publisher.close().await;

        assert_eq!(h.store.entry(id).unwrap().status, LedgerStatus::Pending);
        let records = h.producer.records();
        assert_eq!(records.len(), 1);
        assert_eq!(decode_key(Some(records[0].key.as_bytes())), Ok(id));
        assert_eq!(h.metrics.accepted(), 1);
    }

    #[tokio::test]
    async fn nothing_is_published_when_ledger_create_fails() {
        let h = harness();
        let service = SubmissionService::new(
            Arc::new(FailingLedger),
            Arc::new(h.store.clone()),
            h.publisher.clone(),
            h.metrics.clone(),
        );

        let result = service.create_submission(submission("AB123")).await;
        h.publisher.close().await;

        assert!(matches!(result, Err(ServiceError::Store(_))));
        assert!(h.producer.records().is_empty());
        assert_eq!(h.metrics.accepted(), 0);
    }

    #[tokio::test]
    async fn invalid_submission_writes_nothing() {
        let h = harness();
        let result = h.service.create_submission(submission("  ")).await;

        assert_eq!(
            result,
            Err(ServiceError::Invalid(SubmissionError::MissingFlightNumber))
        );
        let page = h
            .service
            .list_submissions(&LedgerQuery::new("  ", None, None))
            .await
            .unwrap();
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn closed_publisher_still_returns_id() {
        let h = harness();
        h.publisher.close().await;

        let id = h.service.create_submission(submission("AB123")).await.unwrap();

        assert_eq!(h.store.entry(id).unwrap().status, LedgerStatus::Pending);
        assert!(h.producer.records().is_empty());
    }

    #[tokio::test]
    async fn missing_flight_is_not_found() {
        let h = harness();

        let result = h.service.get_flight("AB123", test_departure()).await;

        assert!(matches!(result, Err(ServiceError::NotFound { .. })));
    }

    #[tokio::test]
    async fn applied_flight_is_returned() {
        use flight_ingest_core::store::Applier;

        let h = harness();
        let id = h.service.create_submission(submission("AB123")).await.unwrap();
        h.store.apply(id, &submission("AB123")).await.unwrap();

        let flight = h.service.get_flight("AB123", test_departure()).await.unwrap();

        assert_eq!(flight.aircraft_type, "A320");
        assert_eq!(flight.passengers_count, 150);
    }

    #[tokio::test]
    async fn status_gauges_follow_ledger_counts() {
        let h = harness();
        h.service.create_submission(submission("AB123")).await.unwrap();
        h.service.create_submission(submission("CD456")).await.unwrap();

        let counts = h.service.refresh_status_gauges().await.unwrap();

        assert_eq!(counts.get(&LedgerStatus::Pending), Some(&2));
        assert_eq!(h.metrics.last_counts(), Some(counts));
    }
}
