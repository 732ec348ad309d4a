//! Persistence contracts for the ledger, the flight records and the applier.
//!
//! # Dyn Compatibility
//!
//! These traits use explicit `Pin<Box<dyn Future>>` returns instead of
//! `async fn` so they can be shared as `Arc<dyn Applier>` between the request
//! path and the consumer's claim workers.

use crate::flight::{FlightRecord, FlightSubmission};
use crate::ledger::{LedgerId, LedgerPage, LedgerQuery, LedgerStatus, StatusCounts};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors from ledger and flight repositories.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Database round-trip or connection failure
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// A uniqueness or check constraint rejected the write
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// A stored value could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),
}

/// Errors from the transactional apply step.
///
/// Every variant means the transaction was rolled back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// No ledger entry with this id
    #[error("Ledger entry {0} not found")]
    NotFound(LedgerId),

    /// The entry is not in a state that allows the requested move
    #[error("Ledger entry {id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Ledger entry
        id: LedgerId,
        /// Current status
        from: LedgerStatus,
        /// Requested status
        to: LedgerStatus,
    },

    /// A constraint rejected the flight upsert
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Transaction begin, statement or commit failure
    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl From<StoreError> for ApplyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConstraintViolation(reason) => Self::ConstraintViolation(reason),
            StoreError::DatabaseError(reason) | StoreError::Decode(reason) => {
                Self::DatabaseError(reason)
            }
        }
    }
}

/// Boxed future returned by repository operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Boxed future returned by the applier.
pub type ApplyFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ApplyError>> + Send + 'a>>;

/// Ledger operations used by the synchronous request path.
pub trait SubmissionLedger: Send + Sync {
    /// Insert a `pending` entry and return its id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the insert fails.
    fn create_pending<'a>(
        &'a self,
        flight_number: &'a str,
        departure_date: DateTime<Utc>,
    ) -> StoreFuture<'a, LedgerId>;

    /// List entries for one flight, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    fn list_by_flight_number<'a>(&'a self, query: &'a LedgerQuery) -> StoreFuture<'a, LedgerPage>;

    /// Count entries per status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    fn status_counts(&self) -> StoreFuture<'_, StatusCounts>;
}

/// Read access to flight records.
pub trait FlightLookup: Send + Sync {
    /// Fetch the record for an identity key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails. A missing record is `Ok(None)`.
    fn get_flight<'a>(
        &'a self,
        flight_number: &'a str,
        departure_date: DateTime<Utc>,
    ) -> StoreFuture<'a, Option<FlightRecord>>;
}

/// Turns a consumed envelope into durable state.
pub trait Applier: Send + Sync {
    /// Atomically mark the entry processed and upsert the flight record.
    ///
    /// Re-applying to an entry that is already `processed` leaves the entry
    /// untouched and re-runs the upsert.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError`]; nothing is written in that case.
    fn apply<'a>(&'a self, correlation_id: LedgerId, submission: &'a FlightSubmission)
    -> ApplyFuture<'a>;

    /// Move a `pending` entry to `error` after delivery was given up on.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::NotFound`] or [`ApplyError::InvalidTransition`]
    /// if the entry is missing or not pending.
    fn record_failure<'a>(&'a self, correlation_id: LedgerId, reason: &'a str) -> ApplyFuture<'a>;
}
