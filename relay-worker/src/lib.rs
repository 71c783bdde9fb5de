//! Relay - reliable delivery of learning-platform webhook events.
//!
//! This library provides shared modules for the two relay binaries:
//! - `relay-web`: receives platform webhooks and hands each event to the
//!   processing context (direct, queued, or hybrid)
//! - `relay-worker`: consumes the per-event queues and runs the handlers,
//!   retrying failures with backoff and priority decay
//!
//! ## Architecture
//!
//! ```text
//! Platform → relay-web → ProcessingContext ─┬─► handler (direct)
//!                                           └─► EventQueue → RabbitMQ → relay-worker → handler
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod error_handler;
pub mod handlers;
pub mod platform;
pub mod queue;
pub mod registry;
pub mod strategy;
pub mod web;

// Re-export commonly used types
pub use broker::{BrokerGateway, ConnectionState};
pub use config::RelayConfig;
pub use error::{RelayError, RelayResult};
pub use error_handler::{ErrorDisposition, ErrorHandler};
pub use handlers::{EventHandler, HandlerMap};
pub use queue::{EventQueue, InboundEvent, QueuedMessage, WebhookPayload};
pub use registry::{EventKind, EventTypeConfig, EventTypeRegistry};
pub use strategy::{ProcessingContext, ProcessingMode};
pub use web::AppState;
