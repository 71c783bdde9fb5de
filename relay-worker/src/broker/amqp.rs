//! RabbitMQ gateway using lapin.
//!
//! One connection and one channel are shared by every publisher and consumer
//! of the process. Access to the channel is serialized through a single async
//! mutex; deliveries are pushed by lapin and handled on their own tasks,
//! bounded by each consumer's prefetch.
//!
//! On a connection error the gateway moves to `Reconnecting`, waits a fixed
//! delay between a bounded number of attempts, and on success re-declares the
//! remembered topology and re-attaches consumers. When the attempts run out it
//! settles in `Disconnected` and stops; the state is observable through
//! [`AmqpGateway::subscribe_state`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{
    BrokerDelivery, BrokerGateway, ConnectionState, ConsumeOptions, DeliveryHandler,
    PublishOptions, PublishOutcome, QueueInfo, QueueSpec, MAX_PRIORITY,
};
use crate::error::{RelayError, RelayResult};
use crate::queue::{MessageHeaders, QueuedMessage};

/// Connection parameters for [`AmqpGateway`].
#[derive(Debug, Clone)]
pub struct AmqpSettings {
    pub url: String,
    pub exchange: String,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl AmqpSettings {
    pub fn dlx(&self) -> String {
        format!("{}.dlx", self.exchange)
    }
}

/// lapin-backed [`BrokerGateway`]. Cheap to clone.
#[derive(Clone)]
pub struct AmqpGateway {
    inner: Arc<GatewayInner>,
}

struct Session {
    connection: Connection,
    channel: Channel,
}

#[derive(Clone)]
struct ConsumerRegistration {
    queue: String,
    handler: Arc<dyn DeliveryHandler>,
    options: ConsumeOptions,
}

struct GatewayInner {
    settings: AmqpSettings,
    state: watch::Sender<ConnectionState>,
    // The one writer lock for the shared channel.
    session: Mutex<Option<Session>>,
    topology: StdMutex<Vec<QueueSpec>>,
    consumers: StdMutex<Vec<ConsumerRegistration>>,
    cancel: CancellationToken,
    closing: AtomicBool,
    consumer_seq: AtomicUsize,
}

impl AmqpGateway {
    pub fn new(settings: AmqpSettings) -> Self {
        Self::with_cancellation(settings, CancellationToken::new())
    }

    /// Gateway whose reconnection loop and consumers stop when `cancel` fires.
    pub fn with_cancellation(settings: AmqpSettings, cancel: CancellationToken) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(GatewayInner {
                settings,
                state,
                session: Mutex::new(None),
                topology: StdMutex::new(Vec::new()),
                consumers: StdMutex::new(Vec::new()),
                cancel,
                closing: AtomicBool::new(false),
                consumer_seq: AtomicUsize::new(0),
            }),
        }
    }

    /// Watch connection state changes, including the terminal `Disconnected`
    /// after reconnection gives up.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }
}

impl GatewayInner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(from = ?previous, to = ?state, "broker_state_changed");
        }
    }

    async fn open_session(self: &Arc<Self>) -> RelayResult<Session> {
        info!(
            url = %redact_url(&self.settings.url),
            exchange = %self.settings.exchange,
            "broker_connecting"
        );

        let connection = Connection::connect(&self.settings.url, ConnectionProperties::default())
            .await
            .map_err(|e| RelayError::connection(format!("failed to connect: {e}")))?;
        let channel = open_channel(&connection).await?;

        for exchange in [self.settings.exchange.clone(), self.settings.dlx()] {
            channel
                .exchange_declare(
                    &exchange,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| RelayError::Creation {
                    queue: exchange.clone(),
                    reason: e.to_string(),
                })?;
        }

        let weak = Arc::downgrade(self);
        let runtime = Handle::current();
        connection.on_error(move |err| {
            error!(error = %err, "broker_connection_error");
            if let Some(inner) = weak.upgrade() {
                runtime.spawn(inner.reconnect());
            }
        });

        info!(
            exchange = %self.settings.exchange,
            dlx = %self.settings.dlx(),
            "broker_connected"
        );
        Ok(Session {
            connection,
            channel,
        })
    }

    fn reconnect(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            if self.closing.load(Ordering::SeqCst) {
                return;
            }
            let started = self.state.send_if_modified(|state| {
                if *state == ConnectionState::Reconnecting {
                    false
                } else {
                    *state = ConnectionState::Reconnecting;
                    true
                }
            });
            if !started {
                return;
            }
            warn!("broker_reconnecting");

            let attempts = self.settings.reconnect_attempts.max(1);
            for attempt in 1..=attempts {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        info!(attempt, "broker_reconnect_cancelled");
                        self.set_state(ConnectionState::Disconnected);
                        return;
                    }
                    _ = sleep(self.settings.reconnect_delay) => {}
                }

                let mut session = self.session.lock().await;
                *session = None;
                match self.open_session().await {
                    Ok(fresh) => {
                        self.restore_topology(&fresh.channel).await;
                        self.restore_consumers(&fresh.channel).await;
                        *session = Some(fresh);
                        self.set_state(ConnectionState::Connected);
                        info!(attempt, "broker_reconnected");
                        return;
                    }
                    Err(err) => warn!(
                        attempt,
                        max_attempts = attempts,
                        error = %err,
                        "broker_reconnect_attempt_failed"
                    ),
                }
            }

            error!(attempts, "broker_reconnect_exhausted");
            self.set_state(ConnectionState::Disconnected);
        }
        .boxed()
    }

    async fn restore_topology(&self, channel: &Channel) {
        let specs = self
            .topology
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default();
        for spec in &specs {
            if let Err(err) = self.declare_on(channel, spec).await {
                error!(queue = %spec.name, error = %err, "broker_topology_restore_failed");
            }
        }
    }

    async fn restore_consumers(&self, channel: &Channel) {
        let registrations = self
            .consumers
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default();
        for registration in &registrations {
            if let Err(err) = self.start_consumer(channel, registration).await {
                error!(queue = %registration.queue, error = %err, "broker_consumer_restore_failed");
            }
        }
    }

    /// The session's channel, reopened if the broker closed it while the
    /// connection stayed up (e.g. after a failed declaration).
    async fn live_channel(&self, session: &mut Option<Session>) -> RelayResult<Channel> {
        let session = session
            .as_mut()
            .ok_or_else(|| RelayError::connection("broker not connected"))?;

        if session.channel.status().connected() {
            return Ok(session.channel.clone());
        }
        if !session.connection.status().connected() {
            return Err(RelayError::connection("broker connection lost"));
        }

        warn!("broker_channel_reopening");
        let channel = open_channel(&session.connection).await?;
        self.restore_consumers(&channel).await;
        session.channel = channel.clone();
        Ok(channel)
    }

    async fn declare_on(&self, channel: &Channel, spec: &QueueSpec) -> RelayResult<()> {
        let creation = |e: lapin::Error| RelayError::Creation {
            queue: spec.name.clone(),
            reason: e.to_string(),
        };
        let dlx = self.settings.dlx();

        channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                queue_arguments(spec, &dlx),
            )
            .await
            .map_err(creation)?;

        channel
            .queue_bind(
                &spec.name,
                &self.settings.exchange,
                &spec.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(creation)?;

        if let Some(key) = &spec.dlx_binding_key {
            let exchange = spec.dead_letter_exchange.as_deref().unwrap_or(&dlx);
            channel
                .queue_bind(
                    &spec.name,
                    exchange,
                    key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(creation)?;
        }

        info!(queue = %spec.name, routing_key = %spec.routing_key, "broker_queue_declared");
        Ok(())
    }

    async fn start_consumer(
        &self,
        channel: &Channel,
        registration: &ConsumerRegistration,
    ) -> RelayResult<()> {
        let consume = |e: lapin::Error| RelayError::Consume {
            queue: registration.queue.clone(),
            reason: e.to_string(),
        };

        channel
            .basic_qos(registration.options.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(consume)?;

        let tag = format!(
            "relay-{}-{}",
            registration.queue,
            self.consumer_seq.fetch_add(1, Ordering::SeqCst)
        );
        let consumer = channel
            .basic_consume(
                &registration.queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(consume)?;

        info!(
            queue = %registration.queue,
            consumer_tag = %tag,
            prefetch_count = registration.options.prefetch_count,
            "broker_consumer_started"
        );

        tokio::spawn(run_consumer(
            consumer,
            channel.clone(),
            registration.clone(),
            self.cancel.clone(),
        ));
        Ok(())
    }
}

async fn open_channel(connection: &Connection) -> RelayResult<Channel> {
    let channel = connection
        .create_channel()
        .await
        .map_err(|e| RelayError::connection(format!("failed to create channel: {e}")))?;
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .map_err(|e| RelayError::connection(format!("failed to enable confirms: {e}")))?;
    Ok(channel)
}

/// Read deliveries until the stream ends or the gateway is cancelled.
async fn run_consumer(
    mut consumer: lapin::Consumer,
    channel: Channel,
    registration: ConsumerRegistration,
    cancel: CancellationToken,
) {
    let queue = registration.queue.clone();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(queue = %queue, "broker_consumer_stopping");
                break;
            }
            delivery = consumer.next() => {
                match delivery {
                    Some(Ok(delivery)) => {
                        let channel = channel.clone();
                        let handler = Arc::clone(&registration.handler);
                        let queue = queue.clone();
                        tokio::spawn(async move {
                            settle(channel, handler, queue, delivery).await;
                        });
                    }
                    Some(Err(e)) => {
                        error!(queue = %queue, error = %e, "broker_delivery_error");
                    }
                    None => {
                        warn!(queue = %queue, "broker_consumer_closed");
                        break;
                    }
                }
            }
        }
    }
}

/// Run the handler for one delivery and ack or nack it.
async fn settle(
    channel: Channel,
    handler: Arc<dyn DeliveryHandler>,
    queue: String,
    delivery: lapin::message::Delivery,
) {
    let delivery_tag = delivery.delivery_tag;
    let inbound = BrokerDelivery {
        queue,
        routing_key: delivery.routing_key.to_string(),
        message_id: delivery
            .properties
            .message_id()
            .as_ref()
            .map(|s| s.to_string()),
        redelivered: delivery.redelivered,
        body: delivery.data,
    };

    match handler.handle_delivery(&inbound).await {
        Ok(()) => {
            if let Err(e) = channel
                .basic_ack(delivery_tag, BasicAckOptions::default())
                .await
            {
                error!(delivery_tag, error = %e, "broker_ack_failed");
            }
        }
        Err(err) => {
            let requeue = err.is_requeueable();
            if let Err(e) = channel
                .basic_nack(
                    delivery_tag,
                    BasicNackOptions {
                        requeue,
                        ..Default::default()
                    },
                )
                .await
            {
                error!(delivery_tag, error = %e, "broker_nack_failed");
            } else {
                warn!(
                    queue = %inbound.queue,
                    message_id = ?inbound.message_id,
                    requeue,
                    error = %err,
                    "broker_delivery_nacked"
                );
            }
        }
    }
}

/// `x-` arguments for a queue declaration.
pub fn queue_arguments(spec: &QueueSpec, default_dlx: &str) -> FieldTable {
    let mut args = FieldTable::default();
    let dlx = spec.dead_letter_exchange.as_deref().unwrap_or(default_dlx);
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(dlx.into()),
    );
    if let Some(key) = &spec.dead_letter_routing_key {
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(key.as_str().into()),
        );
    }
    if let Some(ttl) = spec.ttl_ms {
        args.insert("x-message-ttl".into(), AMQPValue::LongLongInt(ttl as i64));
    }
    args.insert(
        "x-max-priority".into(),
        AMQPValue::LongInt(i32::from(MAX_PRIORITY)),
    );
    args
}

/// AMQP headers mirroring [`MessageHeaders`].
pub fn header_table(headers: &MessageHeaders) -> FieldTable {
    let mut table = FieldTable::default();
    table.insert(
        "eventType".into(),
        AMQPValue::LongString(headers.event_type.as_str().into()),
    );
    table.insert(
        "component".into(),
        AMQPValue::LongString(headers.component.as_str().into()),
    );
    table.insert(
        "retryCount".into(),
        AMQPValue::LongLongInt(i64::from(headers.retry_count)),
    );
    table.insert(
        "maxRetries".into(),
        AMQPValue::LongLongInt(i64::from(headers.max_retries)),
    );
    if let Some(original) = &headers.original_message_id {
        table.insert(
            "originalMessageId".into(),
            AMQPValue::LongString(original.as_str().into()),
        );
    }
    table
}

/// Persistent JSON properties for a publish.
pub fn publish_properties(message_id: &str, options: &PublishOptions) -> BasicProperties {
    let mut properties = BasicProperties::default()
        .with_delivery_mode(2) // Persistent
        .with_content_type("application/json".into())
        .with_message_id(message_id.into())
        .with_timestamp(chrono::Utc::now().timestamp().max(0) as u64);

    if let Some(priority) = options.priority {
        properties = properties.with_priority(priority.min(MAX_PRIORITY));
    }
    if let Some(expiration) = options.expiration_ms {
        properties = properties.with_expiration(expiration.to_string().into());
    }
    if let Some(headers) = &options.headers {
        properties = properties.with_headers(header_table(headers));
    }
    properties
}

/// The broker URL without its password, for logs.
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}

#[async_trait]
impl BrokerGateway for AmqpGateway {
    async fn connect(&self) -> RelayResult<()> {
        let mut session = self.inner.session.lock().await;
        if session.is_some() && self.is_connected() {
            return Ok(());
        }

        self.inner.closing.store(false, Ordering::SeqCst);
        self.inner.set_state(ConnectionState::Connecting);
        match self.inner.open_session().await {
            Ok(fresh) => {
                *session = Some(fresh);
                self.inner.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(err) => {
                self.inner.set_state(ConnectionState::Disconnected);
                Err(err)
            }
        }
    }

    fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> RelayResult<()> {
        {
            let mut session = self.inner.session.lock().await;
            let channel = self.inner.live_channel(&mut session).await?;
            self.inner.declare_on(&channel, spec).await?;
        }

        if let Ok(mut topology) = self.inner.topology.lock() {
            match topology.iter_mut().find(|s| s.name == spec.name) {
                Some(existing) => *existing = spec.clone(),
                None => topology.push(spec.clone()),
            }
        }
        Ok(())
    }

    async fn publish(
        &self,
        message: &QueuedMessage,
        routing_key: &str,
        options: PublishOptions,
    ) -> RelayResult<PublishOutcome> {
        if !self.is_connected() {
            return Err(RelayError::connection(format!(
                "broker not connected, cannot publish to {routing_key}"
            )));
        }

        let publish_error = |reason: String| RelayError::Publish {
            routing_key: routing_key.to_string(),
            reason,
        };
        let body = serde_json::to_vec(message)
            .map_err(|e| RelayError::internal(format!("failed to serialize message: {e}")))?;
        let properties = publish_properties(&message.message_id, &options);

        let confirm = {
            let mut session = self.inner.session.lock().await;
            let channel = self.inner.live_channel(&mut session).await?;
            channel
                .basic_publish(
                    &self.inner.settings.exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    &body,
                    properties,
                )
                .await
                .map_err(|e| publish_error(e.to_string()))?
        };

        let confirmation = confirm.await.map_err(|e| publish_error(e.to_string()))?;
        if matches!(confirmation, Confirmation::Nack(_)) {
            return Ok(PublishOutcome::Rejected);
        }
        Ok(PublishOutcome::Accepted)
    }

    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
        options: ConsumeOptions,
    ) -> RelayResult<()> {
        let registration = ConsumerRegistration {
            queue: queue.to_string(),
            handler,
            options,
        };

        {
            let mut session = self.inner.session.lock().await;
            let channel = self.inner.live_channel(&mut session).await?;
            self.inner.start_consumer(&channel, &registration).await?;
        }

        if let Ok(mut consumers) = self.inner.consumers.lock() {
            consumers.push(registration);
        }
        Ok(())
    }

    async fn queue_info(&self, queue: &str) -> RelayResult<QueueInfo> {
        let mut session = self.inner.session.lock().await;
        let channel = self.inner.live_channel(&mut session).await?;
        let declared = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                let reason = e.to_string();
                if reason.contains("NOT_FOUND") {
                    RelayError::NotFound {
                        what: format!("queue {queue}"),
                    }
                } else {
                    RelayError::connection(format!("failed to inspect queue {queue}: {reason}"))
                }
            })?;

        Ok(QueueInfo {
            message_count: declared.message_count(),
            consumer_count: declared.consumer_count(),
        })
    }

    async fn close(&self) -> RelayResult<()> {
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.cancel.cancel();

        let mut session = self.inner.session.lock().await;
        if let Some(Session {
            connection,
            channel,
        }) = session.take()
        {
            if let Err(e) = channel.close(200, "Normal shutdown").await {
                warn!(error = %e, "broker_channel_close_error");
            }
            if let Err(e) = connection.close(200, "Normal shutdown").await {
                warn!(error = %e, "broker_connection_close_error");
            }
        }

        self.inner.set_state(ConnectionState::Disconnected);
        info!("broker_closed");
        Ok(())
    }
}
