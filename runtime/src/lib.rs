//! # Flight Ingest Runtime
//!
//! Cross-cutting runtime pieces shared by the broker and server crates:
//!
//! - [`retry`]: bounded fixed-delay retry that stops on a cancellation token
//! - [`metrics`]: Prometheus recorder installation and the [`MetricsSink`]
//!   implementation backed by the `metrics` facade
//!
//! [`MetricsSink`]: flight_ingest_core::metrics::MetricsSink

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod metrics;
pub mod retry;

pub use metrics::{MetricsError, PrometheusMetrics, install_recorder, record_http_request};
pub use retry::{RetryError, RetryPolicy, retry_with_cancel};
