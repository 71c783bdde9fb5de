//! Relay Worker - RabbitMQ consumer for learning-platform events.
//!
//! Declares the event topology, attaches a consumer to every event queue and
//! runs the platform handlers on each delivery. Failed deliveries are retried
//! through the per-event retry queues.

mod consumer;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relay::RelayConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    tracing::info!("worker_starting");

    // Load configuration from environment
    let config = RelayConfig::from_env();
    config.validate().context("Invalid configuration")?;
    tracing::info!(
        rabbitmq_url_set = config.rabbitmq_url.is_some(),
        exchange = %config.exchange,
        prefetch_count = config.prefetch_count,
        reconnect_attempts = config.reconnect_attempts,
        platform_configured = config.platform_configured(),
        "config_loaded"
    );

    consumer::run(config).await?;

    Ok(())
}
