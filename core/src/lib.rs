//! # Flight Ingest Core
//!
//! Domain types and collaborator contracts for the asynchronous flight
//! ingestion pipeline.
//!
//! ## Pipeline
//!
//! ```text
//! ┌─────────────┐
//! │   Request   │
//! └──────┬──────┘
//!        │ 1. create ledger entry (pending)
//!        ▼
//! ┌─────────────────┐
//! │ Outbound        │
//! │ Publisher       │◄─── bounded queue, fire-and-forget
//! └────────┬────────┘
//!          │ 2. key = correlation id
//!          ▼
//! ┌─────────────────┐
//! │  Redpanda /     │
//! │  Kafka topic    │
//! └────────┬────────┘
//!          │ 3. one claim per partition
//!          ▼
//! ┌─────────────────┐
//! │  Partitioned    │
//! │  Consumer       │◄─── bounded retry, commit after apply
//! └────────┬────────┘
//!          │ 4. single transaction
//!          ▼
//! ┌─────────────────┐
//! │ Transactional   │
//! │ Applier         │◄─── ledger → processed + flight upsert
//! └─────────────────┘
//! ```
//!
//! This crate has no I/O of its own. The Postgres, Redpanda and in-memory
//! implementations live in sibling crates and meet here through the traits in
//! [`store`], [`broker`] and [`metrics`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod envelope;
pub mod flight;
pub mod ledger;
pub mod metrics;
pub mod store;

pub use broker::{BrokerError, BrokerProducer, Delivery, InboundMessage, OffsetCommitter};
pub use envelope::{Envelope, EnvelopeError};
pub use flight::{FlightRecord, FlightSubmission, SubmissionError, SubmissionRequest};
pub use ledger::{LedgerEntry, LedgerId, LedgerPage, LedgerQuery, LedgerStatus, StatusCounts};
pub use metrics::{MetricsSink, NoopMetrics};
pub use store::{Applier, ApplyError, FlightLookup, StoreError, SubmissionLedger};
