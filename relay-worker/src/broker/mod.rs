//! Broker gateway: connection lifecycle, topology declaration and the
//! publish / consume / ack primitives the event queue is built on.
//!
//! [`amqp::AmqpGateway`] talks to RabbitMQ through lapin.
//! [`memory::InMemoryGateway`] implements the same contract in-process.

pub mod amqp;
pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::RelayResult;
use crate::queue::{MessageHeaders, QueuedMessage};

/// Upper bound for `x-max-priority` on declared queues.
pub const MAX_PRIORITY: u8 = 10;

/// Connection lifecycle.
///
/// `Reconnecting` either returns to `Connected` or, once the attempt budget is
/// spent, settles in `Disconnected` and stays there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Durable queue declaration bound to the primary exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub routing_key: String,
    pub ttl_ms: Option<u64>,
    /// Overrides the gateway's DLX when set.
    pub dead_letter_exchange: Option<String>,
    /// Routing key used when the broker dead-letters a message from this queue.
    pub dead_letter_routing_key: Option<String>,
    /// Also bind the queue to the DLX with this key.
    pub dlx_binding_key: Option<String>,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routing_key: routing_key.into(),
            ttl_ms: None,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            dlx_binding_key: None,
        }
    }

    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = (ttl_ms > 0).then_some(ttl_ms);
        self
    }

    pub fn with_dead_letter_routing_key(mut self, key: impl Into<String>) -> Self {
        self.dead_letter_routing_key = Some(key.into());
        self
    }

    pub fn with_dlx_binding(mut self, key: impl Into<String>) -> Self {
        self.dlx_binding_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub priority: Option<u8>,
    /// Per-message TTL. On a retry queue this is the retry delay.
    pub expiration_ms: Option<u64>,
    pub headers: Option<MessageHeaders>,
}

/// Broker verdict on a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Accepted,
    /// Local buffer full or the broker nacked the publish.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub prefetch_count: u16,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self { prefetch_count: 10 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueInfo {
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Per-event-name queue statistics.
pub type QueueStats = BTreeMap<String, QueueInfo>;

/// One message handed to a consumer.
#[derive(Debug, Clone)]
pub struct BrokerDelivery {
    pub queue: String,
    pub routing_key: String,
    pub message_id: Option<String>,
    pub redelivered: bool,
    pub body: Vec<u8>,
}

/// Consumer callback.
///
/// `Ok` acks the delivery. `Err` nacks it; the delivery is requeued only when
/// the error is [`RelayError::is_requeueable`](crate::error::RelayError::is_requeueable),
/// otherwise the broker dead-letters it.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle_delivery(&self, delivery: &BrokerDelivery) -> RelayResult<()>;
}

#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Open the connection and declare both exchanges. No-op when connected.
    async fn connect(&self) -> RelayResult<()>;

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> RelayResult<()>;

    /// Serialize `message` and publish it persistently on the primary exchange.
    async fn publish(
        &self,
        message: &QueuedMessage,
        routing_key: &str,
        options: PublishOptions,
    ) -> RelayResult<PublishOutcome>;

    /// Attach a manual-ack consumer to `queue`.
    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
        options: ConsumeOptions,
    ) -> RelayResult<()>;

    /// Point-in-time counters for `queue`.
    async fn queue_info(&self, queue: &str) -> RelayResult<QueueInfo>;

    async fn close(&self) -> RelayResult<()>;
}

/// AMQP topic matching: `*` matches one word, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("user.created", "user.created"));
        assert!(!topic_matches("user.created", "user.created.retry"));
        assert!(topic_matches("user.*", "user.created"));
        assert!(!topic_matches("user.*", "user.created.retry"));
        assert!(topic_matches("user.#", "user.created.retry"));
        assert!(topic_matches("#", "events.default"));
        assert!(topic_matches("#.retry", "course.completed.retry"));
        assert!(!topic_matches("course.completed", "user.created"));
    }

    #[test]
    fn test_queue_spec_ttl_zero_means_none() {
        let spec = QueueSpec::new("q", "rk").with_ttl(0);
        assert_eq!(spec.ttl_ms, None);
        let spec = QueueSpec::new("q", "rk").with_ttl(5);
        assert_eq!(spec.ttl_ms, Some(5));
    }
}
