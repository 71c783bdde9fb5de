//! In-process broker gateway.
//!
//! Implements the same topology semantics as the AMQP gateway (topic routing,
//! a DLX, dead-letter routing keys, manual ack) without a network. Deliveries
//! to a queue are dispatched one at a time in publish order. TTL expiry is not
//! driven by a clock: [`InMemoryGateway::expire`] dead-letters a queue's
//! backlog on demand.
//!
//! Used by the test suite and for local dry runs.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{
    topic_matches, BrokerDelivery, BrokerGateway, ConnectionState, ConsumeOptions,
    DeliveryHandler, PublishOptions, PublishOutcome, QueueInfo, QueueSpec,
};
use crate::error::{RelayError, RelayResult};
use crate::queue::QueuedMessage;

/// A message as recorded by the in-memory broker.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message: QueuedMessage,
    pub options: PublishOptions,
    pub body: Vec<u8>,
}

struct MemoryQueue {
    spec: QueueSpec,
    messages: VecDeque<PublishedMessage>,
    consumers: Vec<Arc<dyn DeliveryHandler>>,
    next_consumer: usize,
    prefetch_count: u16,
    delivering: bool,
}

#[derive(Default)]
struct MemoryBroker {
    exchanges: HashSet<String>,
    queues: BTreeMap<String, MemoryQueue>,
    published: Vec<PublishedMessage>,
    dropped: Vec<PublishedMessage>,
    acked: usize,
    failing_queue_info: HashSet<String>,
}

pub struct InMemoryGateway {
    exchange: String,
    dlx: String,
    state: watch::Sender<ConnectionState>,
    broker: Mutex<MemoryBroker>,
    reject_publishes: AtomicBool,
    fail_connect: AtomicBool,
    connect_calls: AtomicUsize,
}

impl InMemoryGateway {
    pub fn new(exchange: &str) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            exchange: exchange.to_string(),
            dlx: format!("{exchange}.dlx"),
            state,
            broker: Mutex::new(MemoryBroker::default()),
            reject_publishes: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            connect_calls: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryBroker> {
        // A panicking test handler must not wedge every later call.
        self.broker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_connected(&self, operation: &str) -> RelayResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(RelayError::connection(format!(
                "broker not connected ({operation})"
            )))
        }
    }

    /// Make every following publish come back as [`PublishOutcome::Rejected`].
    pub fn set_reject_publishes(&self, reject: bool) {
        self.reject_publishes.store(reject, Ordering::SeqCst);
    }

    /// Make every following `connect` fail.
    pub fn set_connect_failure(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make `queue_info` fail for one queue.
    pub fn fail_queue_info_for(&self, queue: &str) {
        self.lock().failing_queue_info.insert(queue.to_string());
    }

    /// Simulate losing the broker.
    pub fn drop_connection(&self) {
        self.state.send_replace(ConnectionState::Disconnected);
        warn!("memory_broker_connection_dropped");
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Every message accepted by the primary exchange, in publish order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    /// Messages dead-lettered to a routing key nothing is bound to.
    pub fn dropped(&self) -> Vec<PublishedMessage> {
        self.lock().dropped.clone()
    }

    pub fn acked(&self) -> usize {
        self.lock().acked
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.lock().queues.keys().cloned().collect()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains(name)
    }

    pub fn queue_spec(&self, queue: &str) -> Option<QueueSpec> {
        self.lock().queues.get(queue).map(|q| q.spec.clone())
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    pub fn prefetch_of(&self, queue: &str) -> Option<u16> {
        self.lock().queues.get(queue).map(|q| q.prefetch_count)
    }

    /// Messages currently waiting in `queue`.
    pub fn queued(&self, queue: &str) -> Vec<PublishedMessage> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Expire everything waiting in `queue`, as if its TTL elapsed, and
    /// dead-letter it. Returns the number of expired messages.
    pub async fn expire(&self, queue: &str) -> usize {
        let (expired, targets) = {
            let mut broker = self.lock();
            let Some(q) = broker.queues.get_mut(queue) else {
                return 0;
            };
            let spec = q.spec.clone();
            let drained: Vec<PublishedMessage> = q.messages.drain(..).collect();
            let count = drained.len();
            let mut targets = Vec::new();
            for message in drained {
                targets.extend(self.dead_letter(&mut broker, &spec, message));
            }
            (count, targets)
        };

        debug!(queue, expired, "memory_broker_expired");
        for target in dedup(targets) {
            self.dispatch(&target).await;
        }
        expired
    }

    /// Queues bound on `exchange` whose pattern matches `routing_key`.
    fn route(&self, broker: &MemoryBroker, exchange: &str, routing_key: &str) -> Vec<String> {
        broker
            .queues
            .values()
            .filter(|q| {
                let primary = exchange == self.exchange
                    && topic_matches(&q.spec.routing_key, routing_key);
                let dlx = exchange == self.dlx
                    && q.spec
                        .dlx_binding_key
                        .as_deref()
                        .is_some_and(|key| topic_matches(key, routing_key));
                primary || dlx
            })
            .map(|q| q.spec.name.clone())
            .collect()
    }

    fn enqueue(
        &self,
        broker: &mut MemoryBroker,
        exchange: &str,
        routing_key: &str,
        message: PublishedMessage,
    ) -> Vec<String> {
        let targets = self.route(broker, exchange, routing_key);
        if targets.is_empty() {
            debug!(exchange, routing_key, "memory_broker_unroutable");
            broker.dropped.push(message);
            return targets;
        }
        for name in &targets {
            if let Some(q) = broker.queues.get_mut(name) {
                q.messages.push_back(message.clone());
            }
        }
        targets
    }

    fn dead_letter(
        &self,
        broker: &mut MemoryBroker,
        spec: &QueueSpec,
        mut message: PublishedMessage,
    ) -> Vec<String> {
        let exchange = spec
            .dead_letter_exchange
            .clone()
            .unwrap_or_else(|| self.dlx.clone());
        let routing_key = spec
            .dead_letter_routing_key
            .clone()
            .unwrap_or_else(|| message.routing_key.clone());
        message.exchange = exchange.clone();
        message.routing_key = routing_key.clone();
        // The broker strips per-message expiration when dead-lettering.
        message.options.expiration_ms = None;
        self.enqueue(broker, &exchange, &routing_key, message)
    }

    /// Deliver the backlog of `queue` one message at a time.
    fn dispatch<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, ()> {
        async move {
            loop {
                let (message, handler) = {
                    let mut broker = self.lock();
                    let Some(q) = broker.queues.get_mut(queue) else {
                        return;
                    };
                    if q.delivering || q.consumers.is_empty() {
                        return;
                    }
                    let Some(message) = q.messages.pop_front() else {
                        return;
                    };
                    let handler = Arc::clone(&q.consumers[q.next_consumer % q.consumers.len()]);
                    q.next_consumer = q.next_consumer.wrapping_add(1);
                    q.delivering = true;
                    (message, handler)
                };

                let delivery = BrokerDelivery {
                    queue: queue.to_string(),
                    routing_key: message.routing_key.clone(),
                    message_id: Some(message.message.message_id.clone()),
                    redelivered: false,
                    body: message.body.clone(),
                };
                let result = handler.handle_delivery(&delivery).await;

                let targets = {
                    let mut broker = self.lock();
                    let Some(q) = broker.queues.get_mut(queue) else {
                        return;
                    };
                    q.delivering = false;
                    let spec = q.spec.clone();
                    match result {
                        Ok(()) => {
                            broker.acked += 1;
                            Vec::new()
                        }
                        Err(err) if err.is_requeueable() => {
                            if let Some(q) = broker.queues.get_mut(queue) {
                                q.messages.push_front(message);
                            }
                            // Stop here; the requeued message waits for the next dispatch.
                            return;
                        }
                        Err(_) => self.dead_letter(&mut broker, &spec, message),
                    }
                };

                for target in dedup(targets) {
                    if target != queue {
                        self.dispatch(&target).await;
                    }
                }
            }
        }
        .boxed()
    }
}

fn dedup(mut names: Vec<String>) -> Vec<String> {
    names.sort();
    names.dedup();
    names
}

#[async_trait]
impl BrokerGateway for InMemoryGateway {
    async fn connect(&self) -> RelayResult<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.is_connected() {
            return Ok(());
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            self.state.send_replace(ConnectionState::Disconnected);
            return Err(RelayError::connection("memory broker refused connection"));
        }

        self.state.send_replace(ConnectionState::Connecting);
        {
            let mut broker = self.lock();
            broker.exchanges.insert(self.exchange.clone());
            broker.exchanges.insert(self.dlx.clone());
        }
        self.state.send_replace(ConnectionState::Connected);
        info!(exchange = %self.exchange, dlx = %self.dlx, "memory_broker_connected");
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> RelayResult<()> {
        self.ensure_connected("declare_queue")?;
        let mut broker = self.lock();
        if let Some(existing) = broker.queues.get(&spec.name) {
            if existing.spec == *spec {
                return Ok(());
            }
            return Err(RelayError::Creation {
                queue: spec.name.clone(),
                reason: "PRECONDITION_FAILED - inequivalent queue arguments".to_string(),
            });
        }
        broker.queues.insert(
            spec.name.clone(),
            MemoryQueue {
                spec: spec.clone(),
                messages: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
                prefetch_count: 0,
                delivering: false,
            },
        );
        debug!(queue = %spec.name, routing_key = %spec.routing_key, "memory_broker_queue_declared");
        Ok(())
    }

    async fn publish(
        &self,
        message: &QueuedMessage,
        routing_key: &str,
        options: PublishOptions,
    ) -> RelayResult<PublishOutcome> {
        self.ensure_connected("publish")?;
        if self.reject_publishes.load(Ordering::SeqCst) {
            return Ok(PublishOutcome::Rejected);
        }

        let body = serde_json::to_vec(message)
            .map_err(|e| RelayError::internal(format!("failed to serialize message: {e}")))?;
        let record = PublishedMessage {
            exchange: self.exchange.clone(),
            routing_key: routing_key.to_string(),
            message: message.clone(),
            options,
            body,
        };

        let targets = {
            let mut broker = self.lock();
            broker.published.push(record.clone());
            self.enqueue(&mut broker, &self.exchange, routing_key, record)
        };
        for target in targets {
            self.dispatch(&target).await;
        }
        Ok(PublishOutcome::Accepted)
    }

    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
        options: ConsumeOptions,
    ) -> RelayResult<()> {
        self.ensure_connected("consume")?;
        {
            let mut broker = self.lock();
            let q = broker.queues.get_mut(queue).ok_or_else(|| RelayError::NotFound {
                what: format!("queue {queue}"),
            })?;
            q.consumers.push(handler);
            q.prefetch_count = options.prefetch_count;
        }
        info!(queue, prefetch_count = options.prefetch_count, "memory_broker_consumer_started");
        self.dispatch(queue).await;
        Ok(())
    }

    async fn queue_info(&self, queue: &str) -> RelayResult<QueueInfo> {
        self.ensure_connected("queue_info")?;
        let broker = self.lock();
        if broker.failing_queue_info.contains(queue) {
            return Err(RelayError::connection(format!(
                "failed to inspect queue {queue}"
            )));
        }
        let q = broker.queues.get(queue).ok_or_else(|| RelayError::NotFound {
            what: format!("queue {queue}"),
        })?;
        Ok(QueueInfo {
            message_count: q.messages.len() as u32,
            consumer_count: q.consumers.len() as u32,
        })
    }

    async fn close(&self) -> RelayResult<()> {
        self.state.send_replace(ConnectionState::Disconnected);
        info!("memory_broker_closed");
        Ok(())
    }
}
