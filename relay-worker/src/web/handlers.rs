//! HTTP endpoint handlers.
//!
//! The webhook endpoint checks the shared token, filters by the enabled
//! event list, and hands each event to the processing context. Operators get
//! a liveness probe and a queue statistics view.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::{ConnectionState, QueueStats};
use crate::error::RelayError;
use crate::error_handler::{ErrorDisposition, ErrorHandler};
use crate::queue::{EventQueue, WebhookPayload};
use crate::strategy::{Dispatch, ProcessingContext};
use crate::RelayConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub context: ProcessingContext,
    pub queue: Option<EventQueue>,
    pub errors: Arc<ErrorHandler>,
    /// Cancelled once an error asks for a shutdown. Shared with the event
    /// queue when there is one.
    fatal: CancellationToken,
}

impl AppState {
    pub fn new(
        config: RelayConfig,
        context: ProcessingContext,
        queue: Option<EventQueue>,
        errors: Arc<ErrorHandler>,
    ) -> Self {
        let fatal = queue
            .as_ref()
            .map(EventQueue::fatal_signal)
            .unwrap_or_default();
        Self {
            config: Arc::new(config),
            context,
            queue,
            errors,
            fatal,
        }
    }

    /// Completes when a reported error has asked for a shutdown.
    pub fn fatal_signal(&self) -> CancellationToken {
        self.fatal.clone()
    }

    /// Hand `err` to the error handler and raise the fatal signal if asked.
    pub fn report(&self, err: &RelayError, context: &str) -> ErrorDisposition {
        let disposition = self.errors.handle(err, context);
        if disposition == ErrorDisposition::Shutdown {
            error!(error_code = err.code(), context, "web_fatal_error");
            self.fatal.cancel();
        }
        disposition
    }

    /// Count and log `err`, then render it for the client.
    fn reject(&self, err: RelayError, context: &str) -> Response {
        self.report(&err, context);
        let status = err.status_code();
        (status, Json(self.errors.error_response(&err))).into_response()
    }
}

// =============================================================================
// Health Check
// =============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub mode: &'static str,
    /// `None` when the listener runs without a broker.
    pub broker: Option<ConnectionState>,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        mode: state.context.mode().as_str(),
        broker: state.queue.as_ref().map(|q| q.gateway().state()),
    })
}

// =============================================================================
// Queue Statistics
// =============================================================================

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub queues: QueueStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<BTreeMap<String, u64>>,
}

pub async fn stats(State(state): State<AppState>) -> Response {
    let Some(queue) = state.queue.as_ref() else {
        return state.reject(RelayError::connection("no event queue configured"), "stats");
    };
    Json(StatsResponse {
        queues: queue.get_queue_stats().await,
        errors: state.errors.metrics(),
    })
    .into_response()
}

// =============================================================================
// Platform Webhook
// =============================================================================

#[derive(Debug, Default, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
    pub received: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub async fn webhook(
    State(state): State<AppState>,
    Json(payload): Json<WebhookPayload>,
) -> Response {
    info!(
        site = %payload.site.url,
        events = payload.events.len(),
        "webhook_received"
    );

    if let Some(expected) = state.config.webhook_token.as_deref() {
        if !token_matches(expected, &payload.token) {
            warn!(site = %payload.site.url, "webhook_token_rejected");
            return state.reject(
                RelayError::InvalidToken {
                    reason: "webhook token mismatch".to_string(),
                },
                "webhook",
            );
        }
    }

    let mut summary = WebhookResponse {
        status: "ok",
        received: payload.events.len(),
        ..Default::default()
    };

    for event in &payload.events {
        if !state.config.event_enabled(&event.event_name) {
            summary.skipped += 1;
            continue;
        }
        match state.context.process_event(event, Some(&payload)).await {
            Ok(Dispatch::Processed) => summary.processed += 1,
            Ok(Dispatch::Skipped) => summary.skipped += 1,
            Err(err) => {
                state.report(&err, &event.event_name);
                summary.failed += 1;
            }
        }
    }

    info!(
        processed = summary.processed,
        skipped = summary.skipped,
        failed = summary.failed,
        "webhook_complete"
    );

    if summary.failed > 0 {
        summary.status = "partial_failure";
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(summary)).into_response();
    }
    Json(summary).into_response()
}

fn token_matches(expected: &str, provided: &str) -> bool {
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_matches() {
        assert!(token_matches("secret", "secret"));
        assert!(!token_matches("secret", "secreT"));
        assert!(!token_matches("secret", "secret2"));
        assert!(!token_matches("secret", ""));
    }
}
