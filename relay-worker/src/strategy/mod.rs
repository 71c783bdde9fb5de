//! Processing strategies: how an inbound event reaches a handler.
//!
//! - [`DirectStrategy`]: run the registered handler in-line
//! - [`QueueStrategy`]: publish to the event queue, never run a handler
//! - [`HybridStrategy`]: try the queue, fall back to direct on any error
//!
//! The mode is chosen once at startup and wrapped in a [`ProcessingContext`].

pub mod context;
pub mod direct;
pub mod hybrid;
pub mod queued;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{RelayError, RelayResult};
use crate::handlers::HandlerMap;
use crate::queue::{EventQueue, InboundEvent, WebhookPayload};

pub use context::{Dispatch, ProcessingContext};
pub use direct::DirectStrategy;
pub use hybrid::HybridStrategy;
pub use queued::QueueStrategy;

#[async_trait]
pub trait ProcessingStrategy: Send + Sync {
    fn mode(&self) -> ProcessingMode;

    fn should_process(&self, event: &InboundEvent) -> bool;

    async fn process(&self, event: &InboundEvent, payload: Option<&WebhookPayload>)
        -> RelayResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    Direct,
    Queue,
    Hybrid,
}

impl ProcessingMode {
    pub const ALL: [ProcessingMode; 3] = [
        ProcessingMode::Direct,
        ProcessingMode::Queue,
        ProcessingMode::Hybrid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingMode::Direct => "direct",
            ProcessingMode::Queue => "queue",
            ProcessingMode::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingMode {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(ProcessingMode::Direct),
            "queue" => Ok(ProcessingMode::Queue),
            "hybrid" => Ok(ProcessingMode::Hybrid),
            other => Err(RelayError::configuration(format!(
                "invalid processing mode '{other}', expected one of: direct, queue, hybrid"
            ))),
        }
    }
}

/// Startup mode for the given broker situation. Never `Queue`: with the
/// broker unreachable and no fallback, events would be lost.
pub fn recommended_mode(has_queue: bool, queue_connected: bool) -> ProcessingMode {
    match (has_queue, queue_connected) {
        (true, true) => ProcessingMode::Hybrid,
        _ => ProcessingMode::Direct,
    }
}

/// Build the context for `mode`. `Queue` requires an event queue.
pub fn build_context(
    mode: ProcessingMode,
    handlers: HandlerMap,
    queue: Option<EventQueue>,
) -> RelayResult<ProcessingContext> {
    let strategy: Arc<dyn ProcessingStrategy> = match mode {
        ProcessingMode::Direct => Arc::new(DirectStrategy::new(handlers)),
        ProcessingMode::Queue => {
            let queue = queue.ok_or_else(|| {
                RelayError::configuration("queue processing mode requires an event queue")
            })?;
            Arc::new(QueueStrategy::new(queue))
        }
        ProcessingMode::Hybrid => Arc::new(HybridStrategy::new(handlers, queue)),
    };
    Ok(ProcessingContext::new(strategy))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recommended_mode() {
        assert_eq!(recommended_mode(false, false), ProcessingMode::Direct);
        assert_eq!(recommended_mode(true, true), ProcessingMode::Hybrid);
        assert_eq!(recommended_mode(true, false), ProcessingMode::Direct);
        assert_eq!(recommended_mode(false, true), ProcessingMode::Direct);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("hybrid".parse::<ProcessingMode>().unwrap(), ProcessingMode::Hybrid);
        assert_eq!(" Queue ".parse::<ProcessingMode>().unwrap(), ProcessingMode::Queue);
        for mode in ProcessingMode::ALL {
            assert_eq!(mode.as_str().parse::<ProcessingMode>().unwrap(), mode);
        }
        let err = "batch".parse::<ProcessingMode>().unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
        assert!(err.to_string().contains("direct, queue, hybrid"));
    }

    #[test]
    fn test_queue_mode_requires_queue() {
        let err = build_context(ProcessingMode::Queue, HandlerMap::new(), None)
            .err()
            .unwrap();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");

        let context = build_context(ProcessingMode::Hybrid, HandlerMap::new(), None).unwrap();
        assert_eq!(context.mode(), ProcessingMode::Hybrid);
    }
}
