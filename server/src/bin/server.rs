//! Flight ingest HTTP server.

use flight_ingest_server::{Application, Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine; the environment may be set directly.
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "info,flight_ingest=debug,tower_http=info,sqlx=warn,rdkafka=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting flight ingest server");

    let config = Config::from_env()?;
    info!(
        redpanda_brokers = %config.redpanda.brokers,
        topic = %config.redpanda.topic,
        consumer_group = %config.redpanda.consumer_group,
        queue_capacity = config.pipeline.queue_capacity,
        "Configuration loaded"
    );

    let app = Application::build(config).await?;
    info!(address = %app.local_addr()?, "Application ready");

    app.run().await
}
