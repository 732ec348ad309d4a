//! Redpanda transport for the flight ingest pipeline.
//!
//! Two halves share one topic:
//!
//! ```text
//!  request path                                     consumer group
//! ┌───────────────────┐    ┌──────────┐    ┌──────────────────────────┐
//! │ OutboundPublisher │───►│  flights │───►│ PartitionedConsumer      │
//! │  bounded queue    │    │  topic   │    │  └─ ClaimWorker / part.  │
//! │  drain worker     │    └──────────┘    │      └─ MessageProcessor │
//! └───────────────────┘                    │          └─ Applier      │
//!                                          └──────────────────────────┘
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once** end to end:
//! - Records are keyed by correlation id, so one ledger entry maps to one
//!   partition and its messages stay ordered
//! - Offsets are committed manually, after the applier succeeded or the
//!   message was abandoned as poison
//! - A message interrupted by shutdown is redelivered; the applier treats an
//!   already-processed entry as a no-op on the ledger
//!
//! Both halves work against the `BrokerProducer` and `OffsetCommitter` traits
//! from `flight-ingest-core`, so the publisher and the claim workers are
//! tested without a broker.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod claim;
pub mod consumer;
pub mod processor;
pub mod producer;
pub mod publisher;

pub use claim::{Admission, ClaimRegistry, ClaimSet, ClaimWorker};
pub use consumer::{IngestContext, KafkaCommitter, PartitionedConsumer, PartitionedConsumerBuilder};
pub use processor::{MessageProcessor, ProcessOutcome};
pub use producer::{KafkaProducer, KafkaProducerBuilder};
pub use publisher::{OutboundPublisher, PublisherError};
