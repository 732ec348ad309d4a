//! In-memory ledger, flight records and applier.
//!
//! Mirrors the Postgres semantics closely enough for pipeline tests: ids are
//! assigned sequentially, listings are newest first, a negative passenger
//! count trips the same constraint the table enforces, and `apply` is
//! all-or-nothing.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use chrono::{DateTime, Utc};
use flight_ingest_core::flight::{FlightRecord, FlightSubmission};
use flight_ingest_core::ledger::{
    LedgerEntry, LedgerId, LedgerPage, LedgerQuery, LedgerStatus, StatusCounts,
};
use flight_ingest_core::metrics::{MetricsSink, NoopMetrics};
use flight_ingest_core::store::{
    ApplyError, ApplyFuture, Applier, FlightLookup, StoreError, StoreFuture, SubmissionLedger,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

type FlightKey = (String, DateTime<Utc>);

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    entries: BTreeMap<LedgerId, LedgerEntry>,
    flights: HashMap<FlightKey, FlightRecord>,
    transient_failures: u32,
    apply_calls: u32,
    failure_reasons: Vec<(LedgerId, String)>,
}

/// Ledger, flight table and applier backed by shared maps.
///
/// Clones share state, so one handle can be given to the code under test and
/// another kept for assertions.
#[derive(Clone)]
pub struct InMemoryFlightStore {
    state: Arc<RwLock<State>>,
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for InMemoryFlightStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryFlightStore")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryFlightStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryFlightStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Report applied messages and ledger transitions to `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Make the next `count` calls to `apply` fail with a database error.
    pub fn fail_next_applies(&self, count: u32) {
        self.state.write().unwrap_or_else(PoisonError::into_inner).transient_failures = count;
    }

    /// Number of times `apply` was called, successful or not.
    #[must_use]
    pub fn apply_calls(&self) -> u32 {
        self.state.read().unwrap_or_else(PoisonError::into_inner).apply_calls
    }

    /// Ledger entry by id.
    #[must_use]
    pub fn entry(&self, id: LedgerId) -> Option<LedgerEntry> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).entries.get(&id).cloned()
    }

    /// Flight record by identity key.
    #[must_use]
    pub fn flight(&self, flight_number: &str, departure_date: DateTime<Utc>) -> Option<FlightRecord> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .flights
            .get(&(flight_number.to_string(), departure_date))
            .cloned()
    }

    /// Number of flight records.
    #[must_use]
    pub fn flight_count(&self) -> usize {
        self.state.read().unwrap_or_else(PoisonError::into_inner).flights.len()
    }

    /// Reasons passed to `record_failure`, in call order.
    #[must_use]
    pub fn failure_reasons(&self) -> Vec<(LedgerId, String)> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).failure_reasons.clone()
    }
}

impl SubmissionLedger for InMemoryFlightStore {
    fn create_pending<'a>(
        &'a self,
        flight_number: &'a str,
        departure_date: DateTime<Utc>,
    ) -> StoreFuture<'a, LedgerId> {
        Box::pin(async move {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state.next_id += 1;
            let id = LedgerId::new(state.next_id);
            state.entries.insert(
                id,
                LedgerEntry {
                    id,
                    flight_number: flight_number.to_string(),
                    departure_date,
                    status: LedgerStatus::Pending,
                    created_at: Utc::now(),
                    processed_at: None,
                },
            );
            Ok(id)
        })
    }

    fn list_by_flight_number<'a>(&'a self, query: &'a LedgerQuery) -> StoreFuture<'a, LedgerPage> {
        Box::pin(async move {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            let limit = LedgerQuery::clamp_limit(Some(query.limit));

            // Ids grow with creation time, so reverse id order is newest first.
            let matching: Vec<&LedgerEntry> = state
                .entries
                .values()
                .rev()
                .filter(|e| e.flight_number == query.flight_number)
                .filter(|e| query.status.is_none_or(|s| e.status == s))
                .collect();

            let total = i64::try_from(matching.len())
                .map_err(|e| StoreError::Decode(e.to_string()))?;
            let take = usize::try_from(limit).unwrap_or(usize::MAX);

            Ok(LedgerPage {
                flight_number: query.flight_number.clone(),
                entries: matching.into_iter().take(take).cloned().collect(),
                total,
                limit,
            })
        })
    }

    fn status_counts(&self) -> StoreFuture<'_, StatusCounts> {
        Box::pin(async move {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            let mut counts = StatusCounts::new();
            for entry in state.entries.values() {
                *counts.entry(entry.status).or_insert(0) += 1;
            }
            Ok(counts)
        })
    }
}

impl FlightLookup for InMemoryFlightStore {
    fn get_flight<'a>(
        &'a self,
        flight_number: &'a str,
        departure_date: DateTime<Utc>,
    ) -> StoreFuture<'a, Option<FlightRecord>> {
        Box::pin(async move { Ok(self.flight(flight_number, departure_date)) })
    }
}

impl Applier for InMemoryFlightStore {
    fn apply<'a>(
        &'a self,
        correlation_id: LedgerId,
        submission: &'a FlightSubmission,
    ) -> ApplyFuture<'a> {
        Box::pin(async move {
            let transitioned = {
                let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
                state.apply_calls += 1;

                if state.transient_failures > 0 {
                    state.transient_failures -= 1;
                    return Err(ApplyError::DatabaseError("connection reset".to_string()));
                }

                let status = state
                    .entries
                    .get(&correlation_id)
                    .map(|e| e.status)
                    .ok_or(ApplyError::NotFound(correlation_id))?;

                if status == LedgerStatus::Error {
                    return Err(ApplyError::InvalidTransition {
                        id: correlation_id,
                        from: status,
                        to: LedgerStatus::Processed,
                    });
                }

                // Checked before any write so a violation leaves nothing behind.
                if submission.passengers_count < 0 {
                    return Err(ApplyError::ConstraintViolation(
                        "flights_passengers_count_check".to_string(),
                    ));
                }

                let now = Utc::now();
                if status == LedgerStatus::Pending {
                    if let Some(entry) = state.entries.get_mut(&correlation_id) {
                        entry.status = LedgerStatus::Processed;
                        entry.processed_at = Some(now);
                    }
                }

                let record = FlightRecord::from_submission(submission, now);
                state.flights.insert(
                    (record.flight_number.clone(), record.departure_date),
                    record,
                );
                status == LedgerStatus::Pending
            };

            if transitioned {
                self.metrics
                    .ledger_transition(LedgerStatus::Pending, LedgerStatus::Processed);
            }
            self.metrics
                .message_processed(submission.passengers_count, &submission.aircraft_type);
            Ok(())
        })
    }

    fn record_failure<'a>(&'a self, correlation_id: LedgerId, reason: &'a str) -> ApplyFuture<'a> {
        Box::pin(async move {
            {
                let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
                let entry = state
                    .entries
                    .get_mut(&correlation_id)
                    .ok_or(ApplyError::NotFound(correlation_id))?;

                if !entry.status.can_transition_to(LedgerStatus::Error) {
                    return Err(ApplyError::InvalidTransition {
                        id: correlation_id,
                        from: entry.status,
                        to: LedgerStatus::Error,
                    });
                }
                entry.status = LedgerStatus::Error;
                entry.processed_at = Some(Utc::now());
                state
                    .failure_reasons
                    .push((correlation_id, reason.to_string()));
            }

            self.metrics
                .ledger_transition(LedgerStatus::Pending, LedgerStatus::Error);
            Ok(())
        })
    }
}
