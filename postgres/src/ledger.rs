//! Status ledger repository (`flight_submissions`).
//!
//! Every function takes any [`PgExecutor`], so callers pass `&PgPool` for an
//! autocommit statement or `&mut *tx` to run inside a transaction.

use crate::error::map_sqlx_error;
use chrono::{DateTime, Utc};
use flight_ingest_core::ledger::{LedgerEntry, LedgerId, LedgerPage, LedgerQuery, LedgerStatus, StatusCounts};
use flight_ingest_core::store::StoreError;
use sqlx::postgres::PgRow;
use sqlx::{PgExecutor, Row};

/// Insert a `pending` entry and return its id.
///
/// # Errors
///
/// Returns [`StoreError`] if the insert fails.
pub async fn insert_pending<'e, E>(
    executor: E,
    flight_number: &str,
    departure_date: DateTime<Utc>,
) -> Result<LedgerId, StoreError>
where
    E: PgExecutor<'e>,
{
    let (id,): (i64,) = sqlx::query_as(
        r"
        INSERT INTO flight_submissions (flight_number, departure_date, status)
        VALUES ($1, $2, 'pending')
        RETURNING id
        ",
    )
    .bind(flight_number)
    .bind(departure_date)
    .fetch_one(executor)
    .await
    .map_err(|e| map_sqlx_error("insert ledger entry", e))?;

    Ok(LedgerId::new(id))
}

/// Fetch one entry.
///
/// # Errors
///
/// Returns [`StoreError`] if the query fails or the row cannot be decoded.
pub async fn get<'e, E>(executor: E, id: LedgerId) -> Result<Option<LedgerEntry>, StoreError>
where
    E: PgExecutor<'e>,
{
    let row = sqlx::query(
        r"
        SELECT id, flight_number, departure_date, status, created_at, processed_at
        FROM flight_submissions
        WHERE id = $1
        ",
    )
    .bind(id.get())
    .fetch_optional(executor)
    .await
    .map_err(|e| map_sqlx_error("get ledger entry", e))?;

    row.as_ref().map(row_to_entry).transpose()
}

/// Read an entry's status and lock the row until the transaction ends.
///
/// # Errors
///
/// Returns [`StoreError`] if the query fails or the status is unknown.
pub async fn lock_status<'e, E>(executor: E, id: LedgerId) -> Result<Option<LedgerStatus>, StoreError>
where
    E: PgExecutor<'e>,
{
    let row: Option<(String,)> =
        sqlx::query_as("SELECT status FROM flight_submissions WHERE id = $1 FOR UPDATE")
            .bind(id.get())
            .fetch_optional(executor)
            .await
            .map_err(|e| map_sqlx_error("lock ledger entry", e))?;

    row.map(|(status,)| LedgerStatus::parse(&status)).transpose()
}

/// Move a `pending` entry to `status` and stamp the processed time.
///
/// Returns `false` if no pending entry with this id exists.
///
/// # Errors
///
/// Returns [`StoreError`] if the update fails.
pub async fn update_status<'e, E>(
    executor: E,
    id: LedgerId,
    status: LedgerStatus,
) -> Result<bool, StoreError>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        r"
        UPDATE flight_submissions
        SET status = $2, processed_at = NOW()
        WHERE id = $1 AND status = 'pending'
        ",
    )
    .bind(id.get())
    .bind(status.as_str())
    .execute(executor)
    .await
    .map_err(|e| map_sqlx_error("update ledger status", e))?;

    Ok(result.rows_affected() == 1)
}

/// List entries for one flight, newest first, with the unpaginated total.
///
/// # Errors
///
/// Returns [`StoreError`] if the query fails or a row cannot be decoded.
pub async fn list_by_flight_number<'e, E>(
    executor: E,
    query: &LedgerQuery,
) -> Result<LedgerPage, StoreError>
where
    E: PgExecutor<'e>,
{
    let limit = LedgerQuery::clamp_limit(Some(query.limit));

    // The window count is taken before LIMIT, so any returned row carries the
    // full total. No rows means no matches.
    let rows = sqlx::query(
        r"
        SELECT id, flight_number, departure_date, status, created_at, processed_at,
               COUNT(*) OVER () AS total
        FROM flight_submissions
        WHERE flight_number = $1
          AND ($2::TEXT IS NULL OR status = $2)
        ORDER BY created_at DESC, id DESC
        LIMIT $3
        ",
    )
    .bind(&query.flight_number)
    .bind(query.status.map(|s| s.as_str()))
    .bind(limit)
    .fetch_all(executor)
    .await
    .map_err(|e| map_sqlx_error("list ledger entries", e))?;

    let total = match rows.first() {
        Some(row) => row
            .try_get::<i64, _>("total")
            .map_err(|e| map_sqlx_error("list ledger entries", e))?,
        None => 0,
    };

    let entries = rows.iter().map(row_to_entry).collect::<Result<Vec<_>, _>>()?;

    Ok(LedgerPage {
        flight_number: query.flight_number.clone(),
        entries,
        total,
        limit,
    })
}

/// Count entries per status.
///
/// # Errors
///
/// Returns [`StoreError`] if the query fails.
pub async fn status_counts<'e, E>(executor: E) -> Result<StatusCounts, StoreError>
where
    E: PgExecutor<'e>,
{
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM flight_submissions GROUP BY status")
            .fetch_all(executor)
            .await
            .map_err(|e| map_sqlx_error("count ledger entries", e))?;

    rows.into_iter()
        .map(|(status, count)| Ok((LedgerStatus::parse(&status)?, count)))
        .collect()
}

fn row_to_entry(row: &PgRow) -> Result<LedgerEntry, StoreError> {
    let decode = |e| map_sqlx_error("decode ledger entry", e);
    let status: String = row.try_get("status").map_err(decode)?;

    Ok(LedgerEntry {
        id: LedgerId::new(row.try_get("id").map_err(decode)?),
        flight_number: row.try_get("flight_number").map_err(decode)?,
        departure_date: row.try_get("departure_date").map_err(decode)?,
        status: LedgerStatus::parse(&status)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        processed_at: row.try_get("processed_at").map_err(decode)?,
    })
}
