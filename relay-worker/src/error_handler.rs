//! Central error handling: classification, severity-banded logging, per-code
//! counters, and the fatal-error policy.
//!
//! The handler never terminates the process itself. It reports an
//! [`ErrorDisposition`] and the binary acting as supervisor decides whether to
//! shut down.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::RelayError;

/// What to do with a non-operational error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalErrorPolicy {
    /// Ask the supervisor to shut the process down.
    Abort,
    /// Log and keep running.
    LogOnly,
}

/// Outcome of [`ErrorHandler::handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    Continue,
    Shutdown,
}

/// Severity band a given error is logged at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogBand {
    Error,
    Warn,
    Info,
}

#[derive(Debug, Clone)]
pub struct ErrorHandlerConfig {
    pub fatal_policy: FatalErrorPolicy,
    pub enable_metrics: bool,
    pub detailed_errors: bool,
}

impl Default for ErrorHandlerConfig {
    fn default() -> Self {
        Self {
            fatal_policy: FatalErrorPolicy::Abort,
            enable_metrics: true,
            detailed_errors: false,
        }
    }
}

/// Client-facing error body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub status_code: u16,
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub timestamp: String,
}

pub struct ErrorHandler {
    config: ErrorHandlerConfig,
    counts: Mutex<HashMap<&'static str, u64>>,
}

impl ErrorHandler {
    pub fn new(config: ErrorHandlerConfig) -> Self {
        Self {
            config,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Count, log and classify an error.
    ///
    /// `context` is a short free-form description of where the error surfaced
    /// (queue name, event name, route).
    pub fn handle(&self, err: &RelayError, context: &str) -> ErrorDisposition {
        if self.config.enable_metrics {
            if let Ok(mut counts) = self.counts.lock() {
                *counts.entry(err.code()).or_insert(0) += 1;
            }
        }

        let operational = err.is_operational();
        match Self::band(err) {
            LogBand::Error => error!(
                error_code = err.code(),
                status_code = err.status_code().as_u16(),
                operational,
                context,
                error = %err,
                "error_occurred"
            ),
            LogBand::Warn => warn!(
                error_code = err.code(),
                status_code = err.status_code().as_u16(),
                context,
                error = %err,
                "warning_occurred"
            ),
            LogBand::Info => info!(
                error_code = err.code(),
                context,
                error = %err,
                "info_occurred"
            ),
        }

        if operational {
            return ErrorDisposition::Continue;
        }

        error!(
            error_code = err.code(),
            context,
            error = %err,
            policy = ?self.config.fatal_policy,
            "critical_error"
        );

        match self.config.fatal_policy {
            FatalErrorPolicy::Abort => ErrorDisposition::Shutdown,
            FatalErrorPolicy::LogOnly => ErrorDisposition::Continue,
        }
    }

    /// Non-operational errors always log at error; operational ones by status.
    pub fn band(err: &RelayError) -> LogBand {
        if !err.is_operational() {
            return LogBand::Error;
        }
        let status = err.status_code().as_u16();
        if status >= 500 {
            LogBand::Error
        } else if status >= 400 {
            LogBand::Warn
        } else {
            LogBand::Info
        }
    }

    /// Snapshot of the per-code counters, or `None` when metrics are off.
    pub fn metrics(&self) -> Option<BTreeMap<String, u64>> {
        if !self.config.enable_metrics {
            return None;
        }
        let counts = self.counts.lock().ok()?;
        Some(
            counts
                .iter()
                .map(|(code, count)| (code.to_string(), *count))
                .collect(),
        )
    }

    pub fn reset_metrics(&self) {
        if let Ok(mut counts) = self.counts.lock() {
            counts.clear();
        }
        debug!("error_metrics_reset");
    }

    pub fn is_recoverable(&self, err: &RelayError) -> bool {
        err.is_operational()
    }

    pub fn error_response(&self, err: &RelayError) -> ErrorResponse {
        let details = if self.config.detailed_errors {
            Some(serde_json::json!({ "operational": err.is_operational(), "detail": format!("{err:?}") }))
        } else {
            None
        };

        let message = if err.is_operational() || self.config.detailed_errors {
            err.to_string()
        } else {
            "internal server error".to_string()
        };

        ErrorResponse {
            status_code: err.status_code().as_u16(),
            error: err.code(),
            message,
            details,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(ErrorHandlerConfig::default())
    }
}
