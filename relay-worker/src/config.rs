//! Configuration module for environment variable parsing.
//!
//! Built once at startup and passed to every component that needs it.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::broker::amqp::AmqpSettings;
use crate::error::{RelayError, RelayResult};
use crate::error_handler::{ErrorHandlerConfig, FatalErrorPolicy};
use crate::queue::EventQueueSettings;
use crate::registry::{EventTypeRegistry, DEFAULT_QUEUE_PREFIX};
use crate::strategy::ProcessingMode;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Broker URL; `None` means no broker is configured.
    pub rabbitmq_url: Option<String>,

    /// Primary topic exchange. The DLX is `<exchange>.dlx`.
    pub exchange: String,

    /// `false` ignores the broker even when a URL is set
    pub rabbitmq_enabled: bool,

    /// Reconnect attempts before the gateway settles in `Disconnected`
    pub reconnect_attempts: u32,

    /// Delay between reconnect attempts in milliseconds
    pub reconnect_delay_ms: u64,

    /// Unacknowledged deliveries each consumer may hold
    pub prefetch_count: u16,

    /// Deadline for publish and queue statistics calls in milliseconds
    pub operation_timeout_ms: u64,

    /// Depth at which publishing is refused; `None` means unbounded
    pub queue_max_depth: Option<u32>,

    /// Hold time in milliseconds before a redelivered message whose retry
    /// could not be published is requeued again
    pub requeue_delay_ms: u64,

    /// Queue name prefix, as in `<prefix>.user.created`
    pub queue_prefix: String,

    /// Raw `PROCESSING_MODE`; checked by [`RelayConfig::validate`].
    pub processing_mode: Option<String>,

    /// Queue processing switch
    pub enable_queue: bool,

    /// Platform site root, e.g. `https://lms.example.com`
    pub platform_base_url: Option<String>,

    /// Web service token for the platform API
    pub platform_token: Option<String>,

    /// Platform HTTP timeout in milliseconds
    pub request_timeout_ms: u64,

    // =========================================================================
    // Web Server Configuration
    // =========================================================================
    /// Host to bind the web server to
    pub host: String,

    /// Port to bind the web server to
    pub port: u16,

    /// Token inbound payloads must carry
    pub webhook_token: Option<String>,

    /// Event names the listener accepts; `None` accepts all
    pub enabled_events: Option<Vec<String>>,

    // =========================================================================
    // Error Handling
    // =========================================================================
    /// Shut down on a non-operational error
    pub abort_on_fatal_error: bool,

    /// Keep per-code error counters
    pub enable_error_metrics: bool,

    /// Include error context in HTTP error bodies
    pub detailed_errors: bool,

    /// Period of the consumer's queue statistics log line
    pub stats_interval_secs: u64,
}

impl RelayConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its
    /// value.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        RelayConfig {
            rabbitmq_url: var("RABBITMQ_URL").or_else(|| var("CLOUDAMQP_URL")),
            exchange: var("RABBITMQ_EXCHANGE").unwrap_or_else(|| "webhook-events".to_string()),
            rabbitmq_enabled: parse_bool(&var, "RABBITMQ_ENABLED", true),
            reconnect_attempts: parse_or(&var, "RABBITMQ_RETRY_ATTEMPTS", 3),
            reconnect_delay_ms: parse_or(&var, "RABBITMQ_RETRY_DELAY", 5000),
            prefetch_count: parse_or(&var, "RABBITMQ_PREFETCH", 10),
            operation_timeout_ms: parse_or(&var, "QUEUE_OPERATION_TIMEOUT_MS", 10_000),
            queue_max_depth: parse_opt(&var, "QUEUE_MAX_DEPTH"),
            requeue_delay_ms: parse_or(&var, "QUEUE_REQUEUE_DELAY_MS", 5000),
            queue_prefix: var("QUEUE_NAME_PREFIX")
                .unwrap_or_else(|| DEFAULT_QUEUE_PREFIX.to_string()),
            processing_mode: var("PROCESSING_MODE"),
            enable_queue: parse_bool(&var, "ENABLE_QUEUE", true),
            platform_base_url: var("MOODLE_BASE_URL"),
            platform_token: var("MOODLE_TOKEN"),
            request_timeout_ms: parse_or(&var, "REQUEST_TIMEOUT_MS", 30_000),

            host: var("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(&var, "PORT", 3000),
            webhook_token: var("WEBHOOK_TOKEN"),
            enabled_events: parse_csv(&var, "ENABLED_EVENTS"),

            abort_on_fatal_error: parse_bool(&var, "ABORT_ON_FATAL_ERROR", true),
            enable_error_metrics: parse_bool(&var, "ENABLE_ERROR_METRICS", true),
            detailed_errors: parse_bool(&var, "DETAILED_ERRORS", false),
            stats_interval_secs: parse_or(&var, "STATS_INTERVAL_SECS", 30),
        }
    }

    /// Explicit processing mode, if one was set.
    pub fn mode(&self) -> RelayResult<Option<ProcessingMode>> {
        self.processing_mode
            .as_deref()
            .map(ProcessingMode::from_str)
            .transpose()
    }

    /// Reject settings the binaries cannot run with.
    pub fn validate(&self) -> RelayResult<()> {
        let mode = self.mode()?;
        let wants_queue = matches!(mode, Some(ProcessingMode::Queue | ProcessingMode::Hybrid));
        if wants_queue && self.enable_queue && self.rabbitmq_url.is_none() {
            return Err(RelayError::configuration(format!(
                "RABBITMQ_URL is required for {} processing with the queue enabled",
                mode.map(|m| m.as_str()).unwrap_or_default()
            )));
        }
        if self.prefetch_count == 0 {
            return Err(RelayError::configuration("RABBITMQ_PREFETCH must be at least 1"));
        }
        Ok(())
    }

    /// A broker URL is present and neither the broker nor the queue is disabled.
    pub fn broker_configured(&self) -> bool {
        self.rabbitmq_url.is_some() && self.rabbitmq_enabled && self.enable_queue
    }

    pub fn platform_configured(&self) -> bool {
        self.platform_base_url.is_some() && self.platform_token.is_some()
    }

    pub fn amqp_settings(&self) -> Option<AmqpSettings> {
        if !self.broker_configured() {
            return None;
        }
        self.rabbitmq_url.as_ref().map(|url| AmqpSettings {
            url: url.clone(),
            exchange: self.exchange.clone(),
            reconnect_attempts: self.reconnect_attempts,
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
        })
    }

    pub fn event_queue_settings(&self) -> EventQueueSettings {
        EventQueueSettings {
            prefetch_count: self.prefetch_count,
            operation_timeout: Duration::from_millis(self.operation_timeout_ms),
            max_depth: self.queue_max_depth,
            requeue_delay: Duration::from_millis(self.requeue_delay_ms),
        }
    }

    pub fn error_handler_config(&self) -> ErrorHandlerConfig {
        ErrorHandlerConfig {
            fatal_policy: if self.abort_on_fatal_error {
                FatalErrorPolicy::Abort
            } else {
                FatalErrorPolicy::LogOnly
            },
            enable_metrics: self.enable_error_metrics,
            detailed_errors: self.detailed_errors,
        }
    }

    pub fn registry(&self) -> EventTypeRegistry {
        EventTypeRegistry::with_defaults(&self.queue_prefix)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Whether the listener accepts `event_name`.
    pub fn event_enabled(&self, event_name: &str) -> bool {
        self.enabled_events
            .as_ref()
            .map_or(true, |events| events.iter().any(|e| e == event_name))
    }
}

/// Parse a typed value, warning and falling back to `default` on bad input.
fn parse_or<T, F>(var: &F, name: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = var(name) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(env_var = name, value = %raw, "Invalid value, using default");
            default
        }
    }
}

fn parse_opt<T, F>(var: &F, name: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = var(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(env_var = name, value = %raw, "Invalid value, ignoring");
            None
        }
    }
}

/// Anything but `false` / `0` counts as enabled.
fn parse_bool<F>(var: &F, name: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(raw) => !matches!(raw.trim().to_ascii_lowercase().as_str(), "false" | "0"),
        None => default,
    }
}

/// Parse a comma-separated list of strings.
fn parse_csv<F>(var: &F, name: &str) -> Option<Vec<String>>
where
    F: Fn(&str) -> Option<String>,
{
    var(name).map(|raw| {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> RelayConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RelayConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[]);
        assert_eq!(cfg.exchange, "webhook-events");
        assert_eq!(cfg.reconnect_attempts, 3);
        assert_eq!(cfg.reconnect_delay_ms, 5000);
        assert_eq!(cfg.prefetch_count, 10);
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.queue_prefix, "webhook");
        assert!(!cfg.broker_configured());
        assert!(cfg.amqp_settings().is_none());
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.mode().unwrap(), None);
        assert_eq!(cfg.error_handler_config().fatal_policy, FatalErrorPolicy::Abort);
    }

    #[test]
    fn test_cloudamqp_fallback() {
        let cfg = config(&[("CLOUDAMQP_URL", "amqp://cloud")]);
        assert_eq!(cfg.rabbitmq_url.as_deref(), Some("amqp://cloud"));

        let cfg = config(&[("CLOUDAMQP_URL", "amqp://cloud"), ("RABBITMQ_URL", "amqp://local")]);
        assert_eq!(cfg.rabbitmq_url.as_deref(), Some("amqp://local"));
        assert!(cfg.broker_configured());
    }

    #[test]
    fn test_bad_numbers_fall_back() {
        let cfg = config(&[("PORT", "http"), ("RABBITMQ_PREFETCH", "-1"), ("QUEUE_MAX_DEPTH", "x")]);
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.prefetch_count, 10);
        assert_eq!(cfg.queue_max_depth, None);
    }

    #[test]
    fn test_flags() {
        let cfg = config(&[
            ("RABBITMQ_URL", "amqp://localhost"),
            ("RABBITMQ_ENABLED", "false"),
            ("ABORT_ON_FATAL_ERROR", "0"),
            ("DETAILED_ERRORS", "true"),
        ]);
        assert!(!cfg.broker_configured());
        assert_eq!(cfg.error_handler_config().fatal_policy, FatalErrorPolicy::LogOnly);
        assert!(cfg.error_handler_config().detailed_errors);
    }

    #[test]
    fn test_validate_mode() {
        let err = config(&[("PROCESSING_MODE", "batch")]).validate().unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");

        let err = config(&[("PROCESSING_MODE", "queue")]).validate().unwrap_err();
        assert!(err.to_string().contains("RABBITMQ_URL"));

        assert!(config(&[("PROCESSING_MODE", "queue"), ("ENABLE_QUEUE", "false")])
            .validate()
            .is_ok());
        assert!(config(&[("PROCESSING_MODE", "direct")]).validate().is_ok());
        assert!(config(&[("PROCESSING_MODE", "hybrid"), ("RABBITMQ_URL", "amqp://x")])
            .validate()
            .is_ok());
    }

    #[test]
    fn test_enabled_events_filter() {
        let cfg = config(&[("ENABLED_EVENTS", "\\core\\event\\user_created, ,\\core\\event\\user_loggedin")]);
        assert_eq!(cfg.enabled_events.as_ref().map(Vec::len), Some(2));
        assert!(cfg.event_enabled("\\core\\event\\user_created"));
        assert!(!cfg.event_enabled("\\core\\event\\course_completed"));
        assert!(config(&[]).event_enabled("anything"));
    }

    #[test]
    fn test_derived_settings() {
        let cfg = config(&[
            ("RABBITMQ_URL", "amqp://localhost"),
            ("RABBITMQ_EXCHANGE", "lms"),
            ("QUEUE_NAME_PREFIX", "lms"),
            ("QUEUE_OPERATION_TIMEOUT_MS", "2500"),
            ("QUEUE_MAX_DEPTH", "1000"),
            ("QUEUE_REQUEUE_DELAY_MS", "750"),
        ]);
        let amqp = cfg.amqp_settings().unwrap();
        assert_eq!(amqp.dlx(), "lms.dlx");
        assert_eq!(amqp.reconnect_delay, Duration::from_millis(5000));

        let queue = cfg.event_queue_settings();
        assert_eq!(queue.operation_timeout, Duration::from_millis(2500));
        assert_eq!(queue.max_depth, Some(1000));
        assert_eq!(queue.requeue_delay, Duration::from_millis(750));

        let registry = cfg.registry();
        assert_eq!(registry.get_default().queue_name, "lms.events.default");
    }
}
