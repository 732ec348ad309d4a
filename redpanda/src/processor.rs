//! Per-message procedure shared by every claim worker.
//!
//! Decode, then bounded-retry delivery to the [`Applier`]. The result is a
//! [`ProcessOutcome`] the claim worker turns into a commit decision. Nothing
//! here knows about rdkafka.

use flight_ingest_core::broker::InboundMessage;
use flight_ingest_core::envelope::{Envelope, EnvelopeError};
use flight_ingest_core::ledger::LedgerId;
use flight_ingest_core::metrics::MetricsSink;
use flight_ingest_core::store::{ApplyError, Applier};
use flight_ingest_runtime::retry::{RetryError, RetryPolicy, retry_with_cancel};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// What happened to one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The applier committed the message
    Applied(LedgerId),

    /// The message was malformed and never handed to the applier
    Skipped(EnvelopeError),

    /// Every attempt failed; the ledger entry was moved to `error` if possible
    Exhausted {
        /// Ledger entry of the message
        correlation_id: LedgerId,
        /// Attempts made
        attempts: u32,
        /// Error from the final attempt
        last: ApplyError,
    },

    /// Shutdown or partition revocation interrupted the retry loop
    Cancelled,
}

impl ProcessOutcome {
    /// Whether the message's offset should be committed.
    ///
    /// Poison messages are committed so they never block the partition. A
    /// cancelled message is left uncommitted and redelivered after restart.
    #[must_use]
    pub const fn should_commit(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

/// Decodes inbound messages and drives them through the applier.
pub struct MessageProcessor {
    applier: Arc<dyn Applier>,
    policy: RetryPolicy,
    metrics: Arc<dyn MetricsSink>,
    cancel: CancellationToken,
}

impl MessageProcessor {
    /// Create a processor. `cancel` interrupts retry backoff on shutdown.
    #[must_use]
    pub fn new(
        applier: Arc<dyn Applier>,
        policy: RetryPolicy,
        metrics: Arc<dyn MetricsSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            applier,
            policy,
            metrics,
            cancel,
        }
    }

    /// The shutdown token this processor observes.
    #[must_use]
    pub const fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Process one message, interruptible by shutdown.
    pub async fn process(&self, message: &InboundMessage) -> ProcessOutcome {
        self.process_until(message, &self.cancel).await
    }

    /// Process one message, interruptible through `cancel`.
    ///
    /// Claim workers pass a child of the shutdown token that is also
    /// cancelled when their partition is revoked.
    pub async fn process_until(
        &self,
        message: &InboundMessage,
        cancel: &CancellationToken,
    ) -> ProcessOutcome {
        let envelope = match Envelope::decode(message.key.as_deref(), message.payload.as_deref()) {
            Ok(envelope) => envelope,
            Err(error) => {
                self.metrics.processing_error();
                tracing::warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %error,
                    "Skipping malformed message"
                );
                return ProcessOutcome::Skipped(error);
            }
        };

        let correlation_id = envelope.correlation_id;
        let applier = self.applier.as_ref();
        let payload = &envelope.payload;
        let span = tracing::info_span!(
            "apply",
            correlation_id = %correlation_id,
            partition = message.partition,
            offset = message.offset,
        );

        let result = retry_with_cancel(&self.policy, cancel, move |_attempt| {
            applier.apply(correlation_id, payload)
        })
        .instrument(span)
        .await;

        match result {
            Ok(()) => ProcessOutcome::Applied(correlation_id),
            Err(RetryError::Cancelled) => {
                tracing::info!(
                    correlation_id = %correlation_id,
                    partition = message.partition,
                    offset = message.offset,
                    "Processing interrupted, message left uncommitted"
                );
                ProcessOutcome::Cancelled
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                self.metrics.processing_error();
                tracing::error!(
                    correlation_id = %correlation_id,
                    partition = message.partition,
                    offset = message.offset,
                    attempts,
                    error = %last,
                    "Giving up on message"
                );

                let reason = format!("gave up after {attempts} attempts: {last}");
                if let Err(e) = self.applier.record_failure(correlation_id, &reason).await {
                    tracing::warn!(
                        correlation_id = %correlation_id,
                        error = %e,
                        "Could not mark ledger entry as error"
                    );
                }

                ProcessOutcome::Exhausted {
                    correlation_id,
                    attempts,
                    last,
                }
            }
        }
    }
}
