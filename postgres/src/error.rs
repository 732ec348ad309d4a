use flight_ingest_core::store::StoreError;

/// Map a sqlx error onto [`StoreError`].
///
/// SQLSTATE class 23 (integrity constraint violation) becomes
/// [`StoreError::ConstraintViolation`] carrying the constraint name when
/// Postgres reports one.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let is_integrity = db_err.code().is_some_and(|code| code.starts_with("23"));
            if is_integrity {
                let constraint = db_err.constraint().unwrap_or("unknown constraint");
                StoreError::ConstraintViolation(format!(
                    "{operation}: {constraint}: {}",
                    db_err.message()
                ))
            } else {
                StoreError::DatabaseError(format!("{operation}: {}", db_err.message()))
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Decode(format!("{operation}: {err}"))
        }
        other => StoreError::DatabaseError(format!("{operation}: {other}")),
    }
}
