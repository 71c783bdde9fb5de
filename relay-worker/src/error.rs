//! Error taxonomy shared by the broker gateway, the event queue and the
//! processing strategies.
//!
//! Every variant is classified as operational (expected, recoverable) or not,
//! and carries a stable error code plus an HTTP-style status that drives the
//! log severity band in [`crate::error_handler::ErrorHandler`].

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

/// Errors produced by the relay core.
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    /// Broker unreachable, or the channel is unavailable.
    #[error("broker connection error: {reason}")]
    Connection { reason: String },

    /// The broker refused a publish (send buffer full or confirm nack).
    #[error("failed to publish to {routing_key}: {reason}")]
    Publish { routing_key: String, reason: String },

    /// Exchange or queue declaration failed.
    #[error("failed to declare {queue}: {reason}")]
    Creation { queue: String, reason: String },

    /// A consumer could not be attached or its delivery stream broke.
    #[error("failed to consume from {queue}: {reason}")]
    Consume { queue: String, reason: String },

    #[error("queue {queue} over capacity: {current}/{max}")]
    CapacityExceeded { queue: String, current: u32, max: u32 },

    /// Payload on the wire could not be decoded.
    #[error("invalid message: {reason}")]
    InvalidMessage { reason: String },

    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// A registered handler returned an error for an event.
    #[error("handler for {event_name} failed: {reason}")]
    Handler { event_name: String, reason: String },

    #[error("{resource} {id} not found on platform")]
    ResourceNotFound { resource: String, id: String },

    #[error("invalid token: {reason}")]
    InvalidToken { reason: String },

    /// Platform API answered with an error or could not be reached.
    #[error("platform request {function} failed: {reason}")]
    Platform { function: String, reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    /// Unexpected condition, most likely a defect.
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl RelayError {
    pub fn connection(reason: impl Into<String>) -> Self {
        RelayError::Connection {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        RelayError::Configuration {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        RelayError::Internal {
            reason: reason.into(),
        }
    }

    /// Stable, machine-readable code. Also the key for error counters.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Connection { .. } => "QUEUE_CONNECTION_ERROR",
            RelayError::Publish { .. } => "QUEUE_PUBLISH_ERROR",
            RelayError::Creation { .. } => "QUEUE_CREATION_ERROR",
            RelayError::Consume { .. } => "QUEUE_CONSUME_ERROR",
            RelayError::CapacityExceeded { .. } => "QUEUE_CAPACITY_EXCEEDED",
            RelayError::InvalidMessage { .. } => "QUEUE_INVALID_MESSAGE",
            RelayError::NotFound { .. } => "QUEUE_NOT_FOUND",
            RelayError::Timeout { .. } => "QUEUE_TIMEOUT_ERROR",
            RelayError::Handler { .. } => "EVENT_HANDLER_EXECUTION_ERROR",
            RelayError::ResourceNotFound { .. } => "PLATFORM_RESOURCE_NOT_FOUND",
            RelayError::InvalidToken { .. } => "WEBHOOK_INVALID_TOKEN",
            RelayError::Platform { .. } => "PLATFORM_ERROR",
            RelayError::Configuration { .. } => "CONFIGURATION_ERROR",
            RelayError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::Connection { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::CapacityExceeded { .. } => StatusCode::INSUFFICIENT_STORAGE,
            RelayError::InvalidMessage { .. } => StatusCode::BAD_REQUEST,
            RelayError::NotFound { .. } => StatusCode::NOT_FOUND,
            RelayError::ResourceNotFound { .. } => StatusCode::NOT_FOUND,
            RelayError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            RelayError::InvalidToken { .. } => StatusCode::UNAUTHORIZED,
            RelayError::Platform { .. } => StatusCode::BAD_GATEWAY,
            RelayError::Publish { .. }
            | RelayError::Creation { .. }
            | RelayError::Consume { .. }
            | RelayError::Handler { .. }
            | RelayError::Configuration { .. }
            | RelayError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Operational errors are expected failure modes; anything else is a defect.
    pub fn is_operational(&self) -> bool {
        !matches!(self, RelayError::Internal { .. })
    }

    /// Whether a delivery that failed with this error should go back on its
    /// queue instead of being dead-lettered.
    pub fn is_requeueable(&self) -> bool {
        matches!(
            self,
            RelayError::Connection { .. } | RelayError::Publish { .. } | RelayError::Timeout { .. }
        )
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::InvalidMessage {
            reason: err.to_string(),
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({
            "statusCode": status.as_u16(),
            "error": self.code(),
            "message": self.to_string(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }));

        (status, body).into_response()
    }
}

/// Result alias used across the crate.
pub type RelayResult<T> = Result<T, RelayError>;
