//! Relay Web Server - platform webhook receiver.
//!
//! Accepts webhook payloads, checks the shared token, and hands every enabled
//! event to the processing context. The processing mode comes from
//! `PROCESSING_MODE`, or is recommended from the broker situation at startup.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relay::broker::amqp::AmqpGateway;
use relay::handlers::platform_handlers;
use relay::platform::PlatformClient;
use relay::strategy::{build_context, recommended_mode};
use relay::web::router;
use relay::{AppState, ErrorDisposition, ErrorHandler, EventQueue, HandlerMap, RelayConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("web_server_starting");

    // Load configuration
    let config = RelayConfig::from_env();
    config.validate().context("Invalid configuration")?;
    info!(
        host = %config.host,
        port = config.port,
        broker_configured = config.broker_configured(),
        platform_configured = config.platform_configured(),
        webhook_token_configured = config.webhook_token.is_some(),
        enabled_events = ?config.enabled_events,
        "config_loaded"
    );

    let errors = Arc::new(ErrorHandler::new(config.error_handler_config()));

    // Connect the event queue when a broker is configured
    let queue = match config.amqp_settings() {
        Some(settings) => {
            let queue = EventQueue::new(
                Arc::new(AmqpGateway::new(settings)),
                Arc::new(config.registry()),
                errors.clone(),
                config.event_queue_settings(),
            );
            match queue.initialize().await {
                Ok(()) => Some(queue),
                Err(e) => {
                    if errors.handle(&e, "startup") == ErrorDisposition::Shutdown {
                        return Err(e).context("Failed to initialize event queue");
                    }
                    warn!(error = %e, "event_queue_unavailable");
                    None
                }
            }
        }
        None => None,
    };

    let handlers = match (
        config.platform_base_url.as_deref(),
        config.platform_token.as_deref(),
    ) {
        (Some(base_url), Some(token)) => {
            let platform = PlatformClient::new(base_url, token, config.request_timeout())
                .context("Failed to create platform client")?;
            platform_handlers(Arc::new(platform))
        }
        _ => {
            warn!("platform_not_configured");
            HandlerMap::new()
        }
    };

    let mode = match config.mode()? {
        Some(mode) => mode,
        None => recommended_mode(
            config.broker_configured(),
            queue.as_ref().is_some_and(|q| q.is_connected()),
        ),
    };
    let context = build_context(mode, handlers, queue.clone())
        .context("Failed to build processing context")?;
    info!(mode = %mode, "processing_mode_selected");

    let state = AppState::new(config.clone(), context, queue.clone(), errors);
    let fatal = state.fatal_signal();
    let app = router(state);

    // Bind to address
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid HOST/PORT")?;
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(fatal.clone()))
        .await
        .context("Server error")?;

    if let Some(queue) = queue {
        if let Err(e) = queue.shutdown().await {
            warn!(error = %e, "event_queue_shutdown_failed");
        }
    }

    info!("web_server_shutdown_complete");

    if fatal.is_cancelled() {
        bail!("error handler requested shutdown");
    }
    Ok(())
}

/// Create a future that completes on SIGINT, SIGTERM, or when `fatal` is
/// cancelled.
async fn shutdown_signal(fatal: CancellationToken) {
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
        _ = fatal.cancelled() => error!("web_fatal_shutdown"),
    }

    info!("web_server_shutting_down");
}
