//! HTTP routes.
//!
//! ```text
//! POST /api/flights                          accept a submission (202)
//! GET  /api/flights?flight_number=&departure_date=
//!                                            read a flight record
//! GET  /api/flights/:flight_number/meta?status=&limit=
//!                                            list ledger entries, newest first
//! GET  /health                               liveness
//! GET  /metrics                              Prometheus text format
//! ```

use crate::error::AppError;
use crate::service::SubmissionService;
use axum::{
    Json, Router,
    extract::{MatchedPath, Path, Query, Request, State, rejection::JsonRejection},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use flight_ingest_core::flight::{FlightRecord, SubmissionRequest};
use flight_ingest_core::ledger::{
    LedgerEntry, LedgerId, LedgerQuery, LedgerStatus, MAX_PAGE_LIMIT,
};
use flight_ingest_runtime::metrics::record_http_request;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

/// State shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Submission service
    pub service: Arc<SubmissionService>,
    /// Prometheus handle rendering `/metrics`, if a recorder is installed
    pub metrics: Option<PrometheusHandle>,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/flights", get(get_flight).post(create_flight))
        .route("/api/flights/:flight_number/meta", get(get_flight_meta))
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .route_layer(middleware::from_fn(track_requests))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
struct CreatedResponse {
    id: LedgerId,
    status: LedgerStatus,
}

async fn create_flight(
    State(state): State<AppState>,
    body: Result<Json<SubmissionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreatedResponse>), AppError> {
    let Json(request) = body.map_err(|e| AppError::bad_request(format!("Invalid JSON: {e}")))?;
    let submission = request
        .into_submission()
        .map_err(|e| AppError::bad_request(e.to_string()))?;

    let id = state.service.create_submission(submission).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CreatedResponse {
            id,
            status: LedgerStatus::Pending,
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct FlightParams {
    flight_number: Option<String>,
    departure_date: Option<String>,
}

async fn get_flight(
    State(state): State<AppState>,
    Query(params): Query<FlightParams>,
) -> Result<Json<FlightRecord>, AppError> {
    let (Some(flight_number), Some(departure_date)) = (
        params.flight_number.filter(|s| !s.is_empty()),
        params.departure_date.filter(|s| !s.is_empty()),
    ) else {
        return Err(AppError::bad_request(
            "flight_number and departure_date are required",
        ));
    };

    let departure_date = DateTime::parse_from_rfc3339(&departure_date)
        .map_err(|_| AppError::bad_request("invalid departure_date format, expected RFC3339"))?
        .with_timezone(&Utc);

    let flight = state.service.get_flight(&flight_number, departure_date).await?;
    Ok(Json(flight))
}

#[derive(Debug, Deserialize)]
struct MetaParams {
    status: Option<String>,
    limit: Option<String>,
}

#[derive(Debug, Serialize)]
struct Pagination {
    total: i64,
    limit: i64,
}

#[derive(Debug, Serialize)]
struct MetaResponse {
    flight_number: String,
    meta: Vec<LedgerEntry>,
    pagination: Pagination,
}

async fn get_flight_meta(
    State(state): State<AppState>,
    Path(flight_number): Path<String>,
    Query(params): Query<MetaParams>,
) -> Result<Json<MetaResponse>, AppError> {
    let limit = match params.limit.as_deref().filter(|s| !s.is_empty()) {
        None => None,
        Some(raw) => match raw.parse::<i64>() {
            Ok(limit) if (1..=MAX_PAGE_LIMIT).contains(&limit) => Some(limit),
            _ => {
                return Err(AppError::bad_request(format!(
                    "limit must be a positive integer not exceeding {MAX_PAGE_LIMIT}"
                )));
            }
        },
    };

    let status = params
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(LedgerStatus::parse)
        .transpose()
        .map_err(|e| AppError::bad_request(e.to_string()))?;

    let page = state
        .service
        .list_submissions(&LedgerQuery::new(flight_number, status, limit))
        .await?;

    Ok(Json(MetaResponse {
        flight_number: page.flight_number,
        meta: page.entries,
        pagination: Pagination {
            total: page.total,
            limit: page.limit,
        },
    }))
}

#[allow(clippy::unused_async)]
async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

#[allow(clippy::unused_async)]
async fn render_metrics(State(state): State<AppState>) -> Response {
    match state.metrics {
        Some(handle) => handle.render().into_response(),
        None => AppError::not_found("metrics recorder not installed").into_response(),
    }
}

async fn track_requests(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_string(), |path| path.as_str().to_string());

    let response = next.run(request).await;

    record_http_request(
        method.as_str(),
        &route,
        response.status().as_u16(),
        start.elapsed(),
    );
    response
}
