//! Flight record repository (`flights`).

use crate::error::map_sqlx_error;
use chrono::{DateTime, Utc};
use flight_ingest_core::flight::FlightRecord;
use flight_ingest_core::store::StoreError;
use sqlx::{PgExecutor, Row};

/// Insert the record, or overwrite every non-key field of the existing row
/// with the same `(flight_number, departure_date)`.
///
/// # Errors
///
/// Returns [`StoreError::ConstraintViolation`] if a table constraint rejects
/// the row, [`StoreError::DatabaseError`] otherwise.
pub async fn upsert<'e, E>(executor: E, record: &FlightRecord) -> Result<(), StoreError>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r"
        INSERT INTO flights (
            flight_number, departure_date, aircraft_type,
            arrival_date, passengers_count, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (flight_number, departure_date) DO UPDATE
        SET aircraft_type = EXCLUDED.aircraft_type,
            arrival_date = EXCLUDED.arrival_date,
            passengers_count = EXCLUDED.passengers_count,
            updated_at = EXCLUDED.updated_at
        ",
    )
    .bind(&record.flight_number)
    .bind(record.departure_date)
    .bind(&record.aircraft_type)
    .bind(record.arrival_date)
    .bind(record.passengers_count)
    .bind(record.updated_at)
    .execute(executor)
    .await
    .map_err(|e| map_sqlx_error("upsert flight", e))?;

    Ok(())
}

/// Fetch the record for an identity key.
///
/// # Errors
///
/// Returns [`StoreError`] if the query fails or the row cannot be decoded.
pub async fn get<'e, E>(
    executor: E,
    flight_number: &str,
    departure_date: DateTime<Utc>,
) -> Result<Option<FlightRecord>, StoreError>
where
    E: PgExecutor<'e>,
{
    let row = sqlx::query(
        r"
        SELECT flight_number, departure_date, aircraft_type,
               arrival_date, passengers_count, updated_at
        FROM flights
        WHERE flight_number = $1 AND departure_date = $2
        ",
    )
    .bind(flight_number)
    .bind(departure_date)
    .fetch_optional(executor)
    .await
    .map_err(|e| map_sqlx_error("get flight", e))?;

    let Some(row) = row else {
        return Ok(None);
    };

    let decode = |e| map_sqlx_error("decode flight", e);
    Ok(Some(FlightRecord {
        flight_number: row.try_get("flight_number").map_err(decode)?,
        departure_date: row.try_get("departure_date").map_err(decode)?,
        aircraft_type: row.try_get("aircraft_type").map_err(decode)?,
        arrival_date: row.try_get("arrival_date").map_err(decode)?,
        passengers_count: row.try_get("passengers_count").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    }))
}
