//! Queue consumer supervisor.
//!
//! Connects the event queue, attaches the platform handlers to every event
//! queue plus the default queue, and then waits for one of:
//! - SIGINT / SIGTERM
//! - the error handler asking for a shutdown
//! - the broker settling in `Disconnected` after reconnection gave up

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use relay::broker::amqp::AmqpGateway;
use relay::handlers::platform_handlers;
use relay::platform::PlatformClient;
use relay::registry::DEFAULT_EVENT_NAME;
use relay::{ConnectionState, ErrorHandler, EventQueue, RelayConfig};

/// Run the consumer until shutdown. Returns an error when the worker stops
/// for any reason other than a signal.
pub async fn run(config: RelayConfig) -> Result<()> {
    let settings = config
        .amqp_settings()
        .context("RABBITMQ_URL is required and the queue must be enabled to run the worker")?;

    let (Some(base_url), Some(token)) = (
        config.platform_base_url.as_deref(),
        config.platform_token.as_deref(),
    ) else {
        bail!("MOODLE_BASE_URL and MOODLE_TOKEN are required to run the worker");
    };
    let platform = PlatformClient::new(base_url, token, config.request_timeout())
        .context("Failed to create platform client")?;
    let handlers = platform_handlers(Arc::new(platform));

    let errors = Arc::new(ErrorHandler::new(config.error_handler_config()));
    let cancel = CancellationToken::new();
    let gateway = AmqpGateway::with_cancellation(settings, cancel.clone());
    let mut broker_state = gateway.subscribe_state();

    let queue = EventQueue::new(
        Arc::new(gateway),
        Arc::new(config.registry()),
        errors.clone(),
        config.event_queue_settings(),
    );
    queue
        .initialize()
        .await
        .context("Failed to initialize event queue")?;

    for kind in handlers.kinds() {
        let Some(handler) = handlers.get(&kind) else {
            continue;
        };
        if !queue.is_event_supported(kind.name()) {
            warn!(event_name = %kind, "handler_without_queue");
            continue;
        }
        queue
            .consume_events(kind.name(), handler)
            .await
            .with_context(|| format!("Failed to consume {kind}"))?;
    }
    queue
        .consume_events(DEFAULT_EVENT_NAME, Arc::new(handlers.clone()))
        .await
        .context("Failed to consume default queue")?;

    info!(handlers = handlers.len(), "worker_ready");

    let fatal = queue.fatal_signal();
    let mut stats_ticker =
        tokio::time::interval(Duration::from_secs(config.stats_interval_secs.max(1)));

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let failure = loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("worker_stopping");
                break None;
            }
            _ = fatal.cancelled() => {
                error!("worker_fatal_error");
                break Some("error handler requested shutdown");
            }
            changed = broker_state.changed() => {
                if changed.is_err() {
                    break Some("broker state channel closed");
                }
                let state = *broker_state.borrow_and_update();
                if state == ConnectionState::Disconnected {
                    error!("broker_unavailable");
                    break Some("broker connection lost and reconnection gave up");
                }
            }
            _ = stats_ticker.tick() => {
                let stats = queue.get_queue_stats().await;
                let stats = serde_json::to_string(&stats).unwrap_or_default();
                info!(stats = %stats, "queue_stats");
            }
        }
    };

    cancel.cancel();
    if let Err(e) = queue.shutdown().await {
        warn!(error = %e, "event_queue_shutdown_failed");
    }

    if let Some(metrics) = errors.metrics() {
        info!(errors = ?metrics, "error_metrics");
    }
    info!("worker_shutdown_complete");

    match failure {
        Some(reason) => bail!(reason),
        None => Ok(()),
    }
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "ctrl_c_handler_failed");
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
                error!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
