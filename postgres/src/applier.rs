//! Transactional applier: ledger transition and flight upsert in one unit.

use crate::error::map_sqlx_error;
use crate::{flights, ledger};
use chrono::Utc;
use flight_ingest_core::flight::{FlightRecord, FlightSubmission};
use flight_ingest_core::ledger::{LedgerId, LedgerStatus};
use flight_ingest_core::metrics::MetricsSink;
use flight_ingest_core::store::{ApplyError, ApplyFuture, Applier};
use sqlx::PgPool;
use std::sync::Arc;

/// [`Applier`] backed by a Postgres transaction.
///
/// The ledger row is locked with `SELECT ... FOR UPDATE` first, so two
/// deliveries of the same correlation id serialize on the row. Any early
/// return drops the transaction, which rolls it back.
#[derive(Clone)]
pub struct TransactionalApplier {
    pool: PgPool,
    metrics: Arc<dyn MetricsSink>,
}

impl TransactionalApplier {
    /// Create an applier over `pool`.
    #[must_use]
    pub fn new(pool: PgPool, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { pool, metrics }
    }

    async fn apply_in_transaction(
        &self,
        correlation_id: LedgerId,
        submission: &FlightSubmission,
    ) -> Result<bool, ApplyError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin transaction", e))?;

        let status = ledger::lock_status(&mut *tx, correlation_id)
            .await?
            .ok_or(ApplyError::NotFound(correlation_id))?;

        let transitioned = match status {
            LedgerStatus::Pending => {
                ledger::update_status(&mut *tx, correlation_id, LedgerStatus::Processed).await?
            }
            LedgerStatus::Processed => false,
            LedgerStatus::Error => {
                return Err(ApplyError::InvalidTransition {
                    id: correlation_id,
                    from: status,
                    to: LedgerStatus::Processed,
                });
            }
        };

        let record = FlightRecord::from_submission(submission, Utc::now());
        flights::upsert(&mut *tx, &record).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit transaction", e))?;

        Ok(transitioned)
    }

    async fn fail_in_transaction(&self, correlation_id: LedgerId) -> Result<(), ApplyError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin transaction", e))?;

        let status = ledger::lock_status(&mut *tx, correlation_id)
            .await?
            .ok_or(ApplyError::NotFound(correlation_id))?;

        if !status.can_transition_to(LedgerStatus::Error) {
            return Err(ApplyError::InvalidTransition {
                id: correlation_id,
                from: status,
                to: LedgerStatus::Error,
            });
        }

        ledger::update_status(&mut *tx, correlation_id, LedgerStatus::Error).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit transaction", e))?;

        Ok(())
    }
}

impl Applier for TransactionalApplier {
    fn apply<'a>(
        &'a self,
        correlation_id: LedgerId,
        submission: &'a FlightSubmission,
    ) -> ApplyFuture<'a> {
        Box::pin(async move {
            let transitioned = self.apply_in_transaction(correlation_id, submission).await?;

            if transitioned {
                self.metrics
                    .ledger_transition(LedgerStatus::Pending, LedgerStatus::Processed);
            } else {
                tracing::debug!(
                    correlation_id = %correlation_id,
                    "Ledger entry already processed, flight record refreshed"
                );
            }
            self.metrics
                .message_processed(submission.passengers_count, &submission.aircraft_type);

            tracing::info!(
                correlation_id = %correlation_id,
                flight_number = %submission.flight_number,
                departure_date = %submission.departure_date,
                "Flight applied"
            );
            Ok(())
        })
    }

    fn record_failure<'a>(&'a self, correlation_id: LedgerId, reason: &'a str) -> ApplyFuture<'a> {
        Box::pin(async move {
            self.fail_in_transaction(correlation_id).await?;
            self.metrics
                .ledger_transition(LedgerStatus::Pending, LedgerStatus::Error);

            tracing::warn!(
                correlation_id = %correlation_id,
                reason,
                "Ledger entry marked as error"
            );
            Ok(())
        })
    }
}
