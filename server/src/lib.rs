//! Flight ingest service: HTTP front, configuration and process lifecycle.
//!
//! ```text
//! POST /api/flights
//!        │
//!        ▼
//! SubmissionService ──create pending──▶ flight_submissions
//!        │ enqueue                             ▲
//!        ▼                                     │ pending → processed
//! OutboundPublisher ──flights topic──▶ PartitionedConsumer
//!                                              │ upsert
//!                                              ▼
//!                                           flights
//! ```
//!
//! The request path only writes the ledger entry and queues the envelope;
//! the flight record is written asynchronously by the consumer.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod routes;
pub mod service;

pub use config::{Config, ConfigError};
pub use error::AppError;
pub use lifecycle::Application;
pub use routes::{AppState, router};
pub use service::{ServiceError, SubmissionService};
