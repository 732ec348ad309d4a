//! Process wiring and graceful shutdown.
//!
//! [`Application::build`] connects every component; [`Application::run`]
//! serves HTTP until Ctrl+C, SIGTERM or a consumer failure, then stops the
//! pipeline in dependency order:
//!
//! 1. HTTP server stops accepting requests and drains in-flight ones
//! 2. Consumer is cancelled; claim workers finish or abandon their message
//! 3. Outbound publisher drains its queue and flushes the producer
//! 4. Database pool is closed
//!
//! Steps 2 and 3 are each bounded by `SHUTDOWN_TIMEOUT`.

use crate::config::Config;
use crate::routes::{AppState, router};
use crate::service::SubmissionService;
use anyhow::Context;
use flight_ingest_core::metrics::MetricsSink;
use flight_ingest_postgres::{PostgresFlightStore, TransactionalApplier};
use flight_ingest_redpanda::{
    KafkaProducer, MessageProcessor, OutboundPublisher, PartitionedConsumer,
};
use flight_ingest_runtime::metrics::{PrometheusMetrics, install_recorder};
use flight_ingest_runtime::retry::RetryPolicy;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A fully wired service, ready to run.
pub struct Application {
    listener: TcpListener,
    router: axum::Router,
    consumer: PartitionedConsumer,
    publisher: Arc<OutboundPublisher>,
    service: Arc<SubmissionService>,
    store: PostgresFlightStore,
    shutdown: CancellationToken,
    config: Arc<Config>,
}

impl Application {
    /// Connect storage and the broker, start the publisher and bind the
    /// listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics recorder is already installed, the
    /// database is unreachable or its migrations fail, a Kafka client cannot
    /// be created, or the address cannot be bound.
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let prometheus = install_recorder().context("Failed to install metrics recorder")?;
        let metrics: Arc<dyn MetricsSink> = Arc::new(PrometheusMetrics);

        info!(max_connections = config.postgres.max_connections, "Connecting to PostgreSQL...");
        let store = PostgresFlightStore::connect(&config.postgres.url, config.postgres.max_connections)
            .await
            .context("Failed to connect to PostgreSQL")?;
        store.migrate().await.context("Failed to run migrations")?;
        info!("PostgreSQL connected and migrated");

        info!(brokers = %config.redpanda.brokers, topic = %config.redpanda.topic, "Connecting to Redpanda...");
        let producer = KafkaProducer::builder()
            .brokers(&config.redpanda.brokers)
            .acks(&config.redpanda.acks)
            .compression(&config.redpanda.compression)
            .build()
            .context("Failed to create Kafka producer")?;

        let publisher = Arc::new(OutboundPublisher::new(
            Arc::new(producer),
            &config.redpanda.topic,
            config.pipeline.queue_capacity,
            metrics.clone(),
        ));
        publisher.start().context("Failed to start outbound publisher")?;

        let shutdown = CancellationToken::new();
        let applier = TransactionalApplier::new(store.pool().clone(), metrics.clone());
        let processor = MessageProcessor::new(
            Arc::new(applier),
            RetryPolicy::builder()
                .max_attempts(config.pipeline.retry_attempts)
                .delay(config.pipeline.retry_delay())
                .build(),
            metrics.clone(),
            shutdown.clone(),
        );

        let consumer = PartitionedConsumer::builder()
            .brokers(&config.redpanda.brokers)
            .group_id(&config.redpanda.consumer_group)
            .topic(&config.redpanda.topic)
            .session_timeout(config.redpanda.session_timeout())
            .claim_buffer(config.pipeline.claim_buffer)
            .processor(Arc::new(processor))
            .build()
            .context("Failed to create Kafka consumer")?;
        info!(group_id = %config.redpanda.consumer_group, "Redpanda clients created");

        let service = Arc::new(SubmissionService::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            publisher.clone(),
            metrics,
        ));

        let router = router(AppState {
            service: service.clone(),
            metrics: Some(prometheus),
        });

        let listener = TcpListener::bind(config.bind_address())
            .await
            .with_context(|| format!("Failed to bind {}", config.bind_address()))?;

        Ok(Self {
            listener,
            router,
            consumer,
            publisher,
            service,
            store,
            shutdown,
            config,
        })
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns the socket error if the address cannot be read.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run until a shutdown signal, then stop everything in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP server fails or the consumer stopped
    /// with an error.
    pub async fn run(self) -> anyhow::Result<()> {
        let step_timeout = self.config.server.shutdown_timeout();
        let http_stop = CancellationToken::new();

        let consumer_task = {
            let http_stop = http_stop.clone();
            let consumer = self.consumer;
            tokio::spawn(async move {
                let result = consumer.run().await;
                if let Err(e) = &result {
                    error!(error = %e, "Consumer stopped, shutting down");
                    http_stop.cancel();
                }
                result
            })
        };

        let gauge_task = tokio::spawn(refresh_status_gauges(
            self.service.clone(),
            self.config.pipeline.status_gauge_interval(),
            self.shutdown.child_token(),
        ));

        info!(address = %self.config.bind_address(), "HTTP server listening for requests");
        let served = axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    () = shutdown_signal() => {}
                    () = http_stop.cancelled() => {}
                }
            })
            .await;
        info!("HTTP server stopped, initiating graceful shutdown...");

        self.shutdown.cancel();

        let consumer_result = match tokio::time::timeout(step_timeout, consumer_task).await {
            Ok(Ok(Ok(()))) => {
                info!("Consumer stopped gracefully");
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(anyhow::Error::new(e).context("Consumer failed")),
            Ok(Err(e)) => {
                warn!(error = %e, "Consumer task failed");
                Ok(())
            }
            Err(_) => {
                warn!("Consumer shutdown timed out");
                Ok(())
            }
        };

        if tokio::time::timeout(step_timeout, self.publisher.close())
            .await
            .is_err()
        {
            warn!(
                queued = self.publisher.queue_depth(),
                "Outbound publisher drain timed out"
            );
        } else {
            info!("Outbound publisher drained");
        }

        if let Err(e) = gauge_task.await {
            warn!(error = %e, "Status gauge task failed");
        }

        self.store.pool().close().await;
        info!("Graceful shutdown complete");

        served.context("HTTP server failed")?;
        consumer_result
    }
}

/// Refresh the ledger status gauges now and then every `period` until
/// cancelled.
async fn refresh_status_gauges(
    service: Arc<SubmissionService>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = service.refresh_status_gauges().await {
                    warn!(error = %e, "Failed to refresh ledger status gauges");
                }
            }
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        () = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use flight_ingest_core::ledger::LedgerStatus;
    use flight_ingest_core::store::SubmissionLedger;
    use flight_ingest_testing::fixtures::test_departure;
    use flight_ingest_testing::{InMemoryFlightStore, RecordingMetrics, RecordingProducer};

    fn service(store: &InMemoryFlightStore, metrics: Arc<RecordingMetrics>) -> Arc<SubmissionService> {
        let publisher = Arc::new(OutboundPublisher::new(
            Arc::new(RecordingProducer::new(1)),
            "flights",
            10,
            metrics.clone(),
        ));
        Arc::new(SubmissionService::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            publisher,
            metrics,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn status_gauges_refresh_on_interval_until_cancelled() {
        let store = InMemoryFlightStore::new();
        let metrics = Arc::new(RecordingMetrics::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(refresh_status_gauges(
            service(&store, metrics.clone()),
            Duration::from_secs(30),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let initial = metrics.last_counts().unwrap();
        assert_eq!(initial.get(&LedgerStatus::Pending).copied().unwrap_or(0), 0);

        store.create_pending("AB123", test_departure()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        let refreshed = metrics.last_counts().unwrap();
        assert_eq!(refreshed.get(&LedgerStatus::Pending), Some(&1));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("refresher should stop on cancel")
            .unwrap();
    }
}
