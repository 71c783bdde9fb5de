//! Routing-on-publish, retry escalation and consumer wiring.
//!
//! Retries are explicit: when a handler fails and budget remains, a successor
//! message is published to `<routingKey>.retry` with the backoff delay as its
//! expiration and the failed delivery is acked. The retry queue dead-letters
//! the expired successor onto the DLX, which routes it back to the primary
//! queue. When the budget is spent the delivery is nacked without requeue and
//! dead-lettered to `<routingKey>.dead`, which nothing consumes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::retry::{self, RetryDecision};
use super::types::{InboundEvent, QueuedMessage, WebhookPayload};
use crate::broker::{
    BrokerDelivery, BrokerGateway, ConsumeOptions, DeliveryHandler, PublishOptions,
    PublishOutcome, QueueSpec, QueueStats,
};
use crate::error::{RelayError, RelayResult};
use crate::error_handler::{ErrorDisposition, ErrorHandler};
use crate::handlers::EventHandler;
use crate::registry::{EventTypeConfig, EventTypeRegistry, DEFAULT_EVENT_NAME};

#[derive(Debug, Clone)]
pub struct EventQueueSettings {
    pub prefetch_count: u16,
    /// Deadline for publish and statistics calls.
    pub operation_timeout: Duration,
    /// Refuse to publish into a queue holding this many messages.
    pub max_depth: Option<u32>,
    /// How long a redelivered message is held before it is requeued again
    /// after its retry could not be published.
    pub requeue_delay: Duration,
}

impl Default for EventQueueSettings {
    fn default() -> Self {
        Self {
            prefetch_count: 10,
            operation_timeout: Duration::from_secs(10),
            max_depth: None,
            requeue_delay: Duration::from_secs(5),
        }
    }
}

/// Result of [`EventQueue::retry_failed_event`].
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    /// The successor message now waiting in the retry queue.
    Scheduled(QueuedMessage),
    Exhausted,
}

/// Handle to the event queue. Cheap to clone.
#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<EventQueueInner>,
}

struct EventQueueInner {
    gateway: Arc<dyn BrokerGateway>,
    registry: Arc<EventTypeRegistry>,
    errors: Arc<ErrorHandler>,
    settings: EventQueueSettings,
    fatal: CancellationToken,
}

impl EventQueue {
    pub fn new(
        gateway: Arc<dyn BrokerGateway>,
        registry: Arc<EventTypeRegistry>,
        errors: Arc<ErrorHandler>,
        settings: EventQueueSettings,
    ) -> Self {
        Self {
            inner: Arc::new(EventQueueInner {
                gateway,
                registry,
                errors,
                settings,
                fatal: CancellationToken::new(),
            }),
        }
    }

    pub fn registry(&self) -> &EventTypeRegistry {
        &self.inner.registry
    }

    pub fn error_handler(&self) -> &ErrorHandler {
        &self.inner.errors
    }

    pub fn gateway(&self) -> &Arc<dyn BrokerGateway> {
        &self.inner.gateway
    }

    /// Cancelled once the error handler asks for a shutdown.
    pub fn fatal_signal(&self) -> CancellationToken {
        self.inner.fatal.clone()
    }

    /// Connect and declare the full topology. Safe to call repeatedly.
    pub async fn initialize(&self) -> RelayResult<()> {
        self.inner.gateway.connect().await?;
        self.create_topology().await?;
        info!(
            event_types = self.inner.registry.get_all().len(),
            "event_queue_initialized"
        );
        Ok(())
    }

    /// Declare the primary and retry queue of every registered type and of
    /// the default row.
    pub async fn create_topology(&self) -> RelayResult<()> {
        let registry = &self.inner.registry;
        for config in registry
            .get_all()
            .iter()
            .chain(std::iter::once(registry.get_default()))
        {
            for spec in topology_for(config) {
                self.inner.gateway.declare_queue(&spec).await?;
            }
        }
        Ok(())
    }

    /// Publish a first-attempt message for `event` on its routing key.
    /// Unregistered event names go to the default queue.
    pub async fn publish_event(&self, event: InboundEvent) -> RelayResult<QueuedMessage> {
        let config = self.inner.registry.get(&event.event_name).clone();
        self.ensure_capacity(&config).await?;

        let message = QueuedMessage::new(event, config.retries);
        let options = PublishOptions {
            priority: Some(config.priority),
            expiration_ms: None,
            headers: Some(message.headers.clone()),
        };
        self.publish(&message, &config.routing_key, options).await?;

        info!(
            event_name = %message.event.event_name,
            routing_key = %config.routing_key,
            message_id = %message.message_id,
            priority = config.priority,
            "event_published"
        );
        Ok(message)
    }

    /// Schedule the next attempt for `message`, whose delivery carrying
    /// `retry_count` failed.
    pub async fn retry_failed_event(
        &self,
        message: &QueuedMessage,
        retry_count: u32,
    ) -> RelayResult<RetryOutcome> {
        let config = self.inner.registry.get(&message.event.event_name);
        let max_retries = message.headers.max_retries;

        let (next_retry_count, delay, priority) =
            match retry::decide(retry_count, max_retries, config.priority) {
                RetryDecision::Exhausted => {
                    warn!(
                        event_name = %message.event.event_name,
                        message_id = %message.message_id,
                        retry_count,
                        max_retries,
                        "event_retries_exhausted"
                    );
                    return Ok(RetryOutcome::Exhausted);
                }
                RetryDecision::Retry {
                    next_retry_count,
                    delay,
                    priority,
                } => (next_retry_count, delay, priority),
            };

        let successor = message.next_attempt(next_retry_count, max_retries);
        let routing_key = config.retry_routing_key();
        let delay_ms = delay.as_millis() as u64;
        let options = PublishOptions {
            priority: Some(priority),
            expiration_ms: Some(delay_ms),
            headers: Some(successor.headers.clone()),
        };
        self.publish(&successor, &routing_key, options).await?;

        info!(
            event_name = %successor.event.event_name,
            message_id = %successor.message_id,
            original_message_id = %message.message_id,
            retry_count = next_retry_count,
            delay_ms,
            priority,
            "event_retry_scheduled"
        );
        Ok(RetryOutcome::Scheduled(successor))
    }

    /// Attach `handler` to the primary queue of `event_name`.
    ///
    /// `event_name` must be registered, or be `default` for the fallback queue.
    pub async fn consume_events(
        &self,
        event_name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> RelayResult<()> {
        let registry = &self.inner.registry;
        let config = if event_name == DEFAULT_EVENT_NAME {
            registry.get_default()
        } else {
            registry.lookup(event_name).ok_or_else(|| RelayError::NotFound {
                what: format!("event type {event_name}"),
            })?
        };

        let adapter = Arc::new(EventDelivery {
            queue: self.clone(),
            event_name: config.event_name.clone(),
            handler,
        });
        let options = ConsumeOptions {
            prefetch_count: self.inner.settings.prefetch_count,
        };
        self.inner
            .gateway
            .consume(&config.queue_name, adapter, options)
            .await?;

        info!(
            event_name = %config.event_name,
            queue = %config.queue_name,
            prefetch_count = options.prefetch_count,
            "event_consumer_attached"
        );
        Ok(())
    }

    /// Message and consumer counts for every registered (non-default) type.
    /// A queue that cannot be inspected is left out.
    pub async fn get_queue_stats(&self) -> QueueStats {
        let mut stats = QueueStats::new();
        for config in self.inner.registry.get_all() {
            let info = self
                .with_deadline(
                    "queue_info",
                    self.inner.gateway.queue_info(&config.queue_name),
                )
                .await;
            match info {
                Ok(info) => {
                    stats.insert(config.event_name.clone(), info);
                }
                Err(err) => {
                    self.report(&err, &config.queue_name);
                }
            }
        }
        stats
    }

    pub fn is_connected(&self) -> bool {
        self.inner.gateway.is_connected()
    }

    pub fn is_event_supported(&self, event_name: &str) -> bool {
        self.inner.registry.is_supported(event_name)
    }

    pub async fn shutdown(&self) -> RelayResult<()> {
        self.inner.gateway.close().await?;
        info!("event_queue_shutdown");
        Ok(())
    }

    /// Hand `err` to the error handler and raise the fatal signal if asked.
    pub fn report(&self, err: &RelayError, context: &str) -> ErrorDisposition {
        let disposition = self.inner.errors.handle(err, context);
        if disposition == ErrorDisposition::Shutdown {
            self.inner.fatal.cancel();
        }
        disposition
    }

    async fn publish(
        &self,
        message: &QueuedMessage,
        routing_key: &str,
        options: PublishOptions,
    ) -> RelayResult<()> {
        let outcome = self
            .with_deadline(
                "publish",
                self.inner.gateway.publish(message, routing_key, options),
            )
            .await?;
        match outcome {
            PublishOutcome::Accepted => Ok(()),
            PublishOutcome::Rejected => Err(RelayError::Publish {
                routing_key: routing_key.to_string(),
                reason: "publish rejected by broker".to_string(),
            }),
        }
    }

    async fn ensure_capacity(&self, config: &EventTypeConfig) -> RelayResult<()> {
        let Some(max) = self.inner.settings.max_depth else {
            return Ok(());
        };
        let info = self
            .with_deadline(
                "queue_info",
                self.inner.gateway.queue_info(&config.queue_name),
            )
            .await;
        match info {
            Ok(info) if info.message_count >= max => Err(RelayError::CapacityExceeded {
                queue: config.queue_name.clone(),
                current: info.message_count,
                max,
            }),
            Ok(_) => Ok(()),
            Err(err) => {
                // Depth is advisory; an unreadable counter does not block publishing.
                warn!(queue = %config.queue_name, error = %err, "queue_depth_unavailable");
                Ok(())
            }
        }
    }

    async fn with_deadline<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = RelayResult<T>>,
    ) -> RelayResult<T> {
        let timeout = self.inner.settings.operation_timeout;
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::Timeout {
                operation: operation.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

/// Primary and retry queue declarations for one event type.
pub fn topology_for(config: &EventTypeConfig) -> [QueueSpec; 2] {
    let primary = QueueSpec::new(&config.queue_name, &config.routing_key)
        .with_ttl(config.ttl_ms)
        .with_dead_letter_routing_key(config.dead_routing_key())
        .with_dlx_binding(&config.routing_key);
    let retry = QueueSpec::new(config.retry_queue_name(), config.retry_routing_key())
        .with_ttl(config.ttl_ms.saturating_mul(2))
        .with_dead_letter_routing_key(&config.routing_key);
    [primary, retry]
}

/// Bridges broker deliveries to an [`EventHandler`] and applies the retry
/// protocol.
struct EventDelivery {
    queue: EventQueue,
    event_name: String,
    handler: Arc<dyn EventHandler>,
}

#[async_trait]
impl DeliveryHandler for EventDelivery {
    async fn handle_delivery(&self, delivery: &BrokerDelivery) -> RelayResult<()> {
        let message: QueuedMessage = match serde_json::from_slice(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                let err = RelayError::from(e);
                self.queue.report(&err, &delivery.queue);
                return Err(err);
            }
        };

        let payload = WebhookPayload::minimal(&message.event);
        let retry_count = message.headers.retry_count;
        let failure = match self.handler.handle(&message.event, &payload).await {
            Ok(()) => {
                debug!(
                    event_name = %message.event.event_name,
                    message_id = %message.message_id,
                    retry_count,
                    "event_processed"
                );
                return Ok(());
            }
            Err(e) => RelayError::Handler {
                event_name: self.event_name.clone(),
                reason: format!("{e:#}"),
            },
        };
        self.queue.report(&failure, &delivery.queue);

        match self.queue.retry_failed_event(&message, retry_count).await {
            Ok(RetryOutcome::Scheduled(_)) => Ok(()),
            Ok(RetryOutcome::Exhausted) => Err(failure),
            Err(err) => {
                error!(
                    message_id = %message.message_id,
                    error = %err,
                    "event_retry_publish_failed"
                );
                self.queue.report(&err, &delivery.queue);
                if delivery.redelivered {
                    // The broker keeps refusing the retry; hold the slot so
                    // the requeue does not spin.
                    let delay = self.queue.inner.settings.requeue_delay;
                    warn!(
                        message_id = %message.message_id,
                        delay_ms = delay.as_millis() as u64,
                        "event_requeue_delayed"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err)
            }
        }
    }
}
