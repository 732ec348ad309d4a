//! `PostgreSQL` persistence for the flight ingest pipeline.
//!
//! - [`ledger`] and [`flights`]: repositories over any `PgExecutor`
//! - [`TransactionalApplier`]: ledger transition plus flight upsert in one
//!   transaction
//! - [`PostgresFlightStore`]: pool owner implementing the read and create
//!   paths used by the request layer
//!
//! # Example
//!
//! ```no_run
//! use flight_ingest_postgres::PostgresFlightStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PostgresFlightStore::connect("postgres://localhost/flights", 10).await?;
//! store.migrate().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod applier;
mod error;
pub mod flights;
pub mod ledger;

pub use applier::TransactionalApplier;

use chrono::{DateTime, Utc};
use flight_ingest_core::flight::FlightRecord;
use flight_ingest_core::ledger::{LedgerId, LedgerPage, LedgerQuery, StatusCounts};
use flight_ingest_core::store::{FlightLookup, StoreError, StoreFuture, SubmissionLedger};
use sqlx::postgres::{PgPool, PgPoolOptions};

/// Ledger and flight reads over a shared connection pool.
#[derive(Debug, Clone)]
pub struct PostgresFlightStore {
    pool: PgPool,
}

impl PostgresFlightStore {
    /// Connect a new pool.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] if the connection fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::DatabaseError(format!("Failed to connect: {e}")))?;

        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the embedded migrations (`flight_submissions`, `flights`).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::DatabaseError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl SubmissionLedger for PostgresFlightStore {
    fn create_pending<'a>(
        &'a self,
        flight_number: &'a str,
        departure_date: DateTime<Utc>,
    ) -> StoreFuture<'a, LedgerId> {
        Box::pin(async move {
            let id = ledger::insert_pending(&self.pool, flight_number, departure_date).await?;
            tracing::debug!(correlation_id = %id, flight_number, "Ledger entry created");
            Ok(id)
        })
    }

    fn list_by_flight_number<'a>(&'a self, query: &'a LedgerQuery) -> StoreFuture<'a, LedgerPage> {
        Box::pin(ledger::list_by_flight_number(&self.pool, query))
    }

    fn status_counts(&self) -> StoreFuture<'_, StatusCounts> {
        Box::pin(ledger::status_counts(&self.pool))
    }
}

impl FlightLookup for PostgresFlightStore {
    fn get_flight<'a>(
        &'a self,
        flight_number: &'a str,
        departure_date: DateTime<Utc>,
    ) -> StoreFuture<'a, Option<FlightRecord>> {
        Box::pin(flights::get(&self.pool, flight_number, departure_date))
    }
}
