//! Outbound publisher: bounded queue plus one background drain worker.
//!
//! The request path hands envelopes to [`OutboundPublisher::enqueue`], which
//! only waits when the queue is full. The worker publishes each envelope with
//! its correlation id as the record key. A failed publish is logged, counted
//! and dropped; it is never requeued.
//!
//! Shutdown is two-phase: [`OutboundPublisher::close`] stops admission, then
//! waits for the worker to publish everything already queued and flush the
//! producer.

use flight_ingest_core::broker::BrokerProducer;
use flight_ingest_core::envelope::Envelope;
use flight_ingest_core::metrics::MetricsSink;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Default number of envelopes the queue holds.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// How often the queue depth is sampled while idle.
pub const DEPTH_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// How long close waits for the producer to deliver in-flight records.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors returned by the publisher.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherError {
    /// The publisher is closing or closed
    #[error("Publisher is closed")]
    Closed,

    /// `start` was called more than once
    #[error("Publisher worker already started")]
    AlreadyStarted,
}

struct Worker {
    rx: mpsc::Receiver<Envelope>,
    producer: Arc<dyn BrokerProducer>,
    topic: String,
    metrics: Arc<dyn MetricsSink>,
    closing: CancellationToken,
    flush_timeout: Duration,
}

/// Lifecycle of the drain worker, swapped under one lock.
enum WorkerState {
    Idle(Worker),
    Running(JoinHandle<()>),
    Stopped,
}

/// Bounded, fire-and-forget publisher for correlated envelopes.
///
/// # Example
///
/// ```no_run
/// use flight_ingest_core::metrics::NoopMetrics;
/// use flight_ingest_redpanda::{KafkaProducer, OutboundPublisher};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let producer = Arc::new(KafkaProducer::new("localhost:9092")?);
/// let publisher = OutboundPublisher::new(producer, "flights", 100, Arc::new(NoopMetrics));
/// publisher.start()?;
/// // ... enqueue envelopes ...
/// publisher.close().await;
/// # Ok(())
/// # }
/// ```
pub struct OutboundPublisher {
    tx: mpsc::Sender<Envelope>,
    state: Mutex<WorkerState>,
    closing: CancellationToken,
}

impl OutboundPublisher {
    /// Create a publisher. Nothing is spawned until [`start`](Self::start).
    ///
    /// A `capacity` of 0 is raised to 1.
    #[must_use]
    pub fn new(
        producer: Arc<dyn BrokerProducer>,
        topic: impl Into<String>,
        capacity: usize,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closing = CancellationToken::new();

        let worker = Worker {
            rx,
            producer,
            topic: topic.into(),
            metrics,
            closing: closing.clone(),
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        };

        Self {
            tx,
            state: Mutex::new(WorkerState::Idle(worker)),
            closing,
        }
    }

    /// Spawn the drain worker.
    ///
    /// # Errors
    ///
    /// Returns [`PublisherError::AlreadyStarted`] on a second call and
    /// [`PublisherError::Closed`] after [`close`](Self::close).
    pub fn start(&self) -> Result<(), PublisherError> {
        if self.closing.is_cancelled() {
            return Err(PublisherError::Closed);
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match std::mem::replace(&mut *state, WorkerState::Stopped) {
            WorkerState::Idle(worker) => {
                tracing::info!(
                    topic = %worker.topic,
                    capacity = self.tx.max_capacity(),
                    "Outbound publisher started"
                );
                *state = WorkerState::Running(tokio::spawn(worker.run()));
                Ok(())
            }
            running @ WorkerState::Running(_) => {
                *state = running;
                Err(PublisherError::AlreadyStarted)
            }
            WorkerState::Stopped => Err(PublisherError::Closed),
        }
    }

    /// Queue an envelope for publishing.
    ///
    /// Waits only while the queue is full. A wait in progress is released with
    /// [`PublisherError::Closed`] when the publisher starts closing.
    ///
    /// # Errors
    ///
    /// Returns [`PublisherError::Closed`] if the publisher is closing or closed.
    pub async fn enqueue(&self, envelope: Envelope) -> Result<(), PublisherError> {
        if self.closing.is_cancelled() {
            return Err(PublisherError::Closed);
        }

        let permit = tokio::select! {
            biased;
            () = self.closing.cancelled() => return Err(PublisherError::Closed),
            permit = self.tx.reserve() => permit.map_err(|_| PublisherError::Closed)?,
        };

        tracing::trace!(correlation_id = %envelope.correlation_id, "Envelope queued");
        permit.send(envelope);
        Ok(())
    }

    /// Envelopes waiting to be published.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Stop admission, publish everything already queued, then flush.
    ///
    /// Returns once the queue is drained. Safe to call more than once.
    pub async fn close(&self) {
        self.closing.cancel();

        let state = std::mem::replace(
            &mut *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            WorkerState::Stopped,
        );

        match state {
            WorkerState::Running(handle) => {
                if let Err(e) = handle.await {
                    tracing::error!(error = %e, "Outbound publisher worker panicked");
                }
            }
            // Never started: drain here so accepted envelopes are still published.
            WorkerState::Idle(worker) => worker.drain().await,
            WorkerState::Stopped => {}
        }
    }
}

impl Worker {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(DEPTH_SAMPLE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                () = self.closing.cancelled() => break,
                received = self.rx.recv() => {
                    let Some(envelope) = received else { break };
                    self.metrics.outbound_queue_depth(self.rx.len());
                    self.publish(&envelope).await;
                }
                _ = ticker.tick() => self.metrics.outbound_queue_depth(self.rx.len()),
            }
        }

        self.drain().await;
    }

    async fn drain(mut self) {
        self.rx.close();
        let mut drained = 0_usize;
        while let Some(envelope) = self.rx.recv().await {
            self.metrics.outbound_queue_depth(self.rx.len());
            self.publish(&envelope).await;
            drained += 1;
        }

        let producer = Arc::clone(&self.producer);
        let flush_timeout = self.flush_timeout;
        // rdkafka's flush blocks the calling thread.
        match tokio::task::spawn_blocking(move || producer.flush(flush_timeout)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Producer flush incomplete"),
            Err(e) => tracing::error!(error = %e, "Producer flush task failed"),
        }

        tracing::info!(topic = %self.topic, drained, "Outbound publisher closed");
    }

    async fn publish(&self, envelope: &Envelope) {
        let correlation_id = envelope.correlation_id;

        let payload = match envelope.encode_value() {
            Ok(payload) => payload,
            Err(e) => {
                self.metrics.publish_failed();
                tracing::error!(
                    correlation_id = %correlation_id,
                    error = %e,
                    "Failed to encode envelope, dropping"
                );
                return;
            }
        };

        let key = envelope.routing_key();
        match self.producer.send(&self.topic, &key, &payload).await {
            Ok(delivery) => {
                self.metrics.message_published();
                tracing::debug!(
                    correlation_id = %correlation_id,
                    topic = %self.topic,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "Envelope published"
                );
            }
            Err(e) => {
                self.metrics.publish_failed();
                tracing::error!(
                    correlation_id = %correlation_id,
                    topic = %self.topic,
                    error = %e,
                    "Failed to publish envelope, dropping"
                );
            }
        }
    }
}
