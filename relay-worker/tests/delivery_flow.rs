//! End-to-end delivery through the event queue on the in-memory broker:
//! publish, consume, fail, retry through the TTL reroute, succeed or drop.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use relay::broker::memory::InMemoryGateway;
use relay::queue::{EventQueueSettings, InboundEvent, QueuedMessage, WebhookPayload};
use relay::strategy::{build_context, recommended_mode, Dispatch, ProcessingMode};
use relay::{
    ErrorHandler, EventHandler, EventKind, EventQueue, EventTypeRegistry, HandlerMap,
};

fn event(name: &str) -> InboundEvent {
    serde_json::from_value(json!({
        "eventname": name,
        "component": "core",
        "objectid": 42,
        "userid": 7,
        "courseid": 3,
        "crud": "c",
        "timecreated": 1_700_000_000,
        "host": "lms.example.com",
        "token": "tok",
        "other": null
    }))
    .unwrap()
}

/// Fails the first `failures` calls, records every delivered message.
struct Scripted {
    failures: usize,
    calls: AtomicUsize,
    seen: Mutex<Vec<InboundEvent>>,
}

impl Scripted {
    fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for Scripted {
    async fn handle(&self, event: &InboundEvent, _payload: &WebhookPayload) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(event.clone());
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            anyhow::bail!("handler failure {call}");
        }
        Ok(())
    }
}

async fn setup() -> (Arc<InMemoryGateway>, EventQueue) {
    let gateway = Arc::new(InMemoryGateway::new("webhook-events"));
    let queue = EventQueue::new(
        gateway.clone(),
        Arc::new(EventTypeRegistry::default()),
        Arc::new(ErrorHandler::default()),
        EventQueueSettings::default(),
    );
    queue.initialize().await.unwrap();
    (gateway, queue)
}

fn body_of(gateway: &InMemoryGateway, index: usize) -> QueuedMessage {
    serde_json::from_slice(&gateway.published()[index].body).unwrap()
}

#[tokio::test]
async fn test_every_registered_type_is_delivered_first_time() {
    let (gateway, queue) = setup().await;

    for kind in EventKind::KNOWN {
        let handler = Scripted::new(0);
        queue
            .consume_events(kind.name(), handler.clone())
            .await
            .unwrap();
        queue.publish_event(event(kind.name())).await.unwrap();

        assert_eq!(handler.calls(), 1, "{kind}");
        assert_eq!(handler.seen.lock().unwrap()[0].event_name, kind.name());
    }

    for (i, published) in gateway.published().iter().enumerate() {
        let message = body_of(&gateway, i);
        assert_eq!(message.headers.retry_count, 0);
        assert_eq!(message.headers.event_type, message.event.event_name);
        assert_eq!(published.options.headers.as_ref(), Some(&message.headers));
    }
    assert_eq!(gateway.acked(), EventKind::KNOWN.len());
}

#[tokio::test]
async fn test_retry_then_success() {
    let (gateway, queue) = setup().await;
    let handler = Scripted::new(1);
    queue
        .consume_events(EventKind::UserCreated.name(), handler.clone())
        .await
        .unwrap();

    let first = queue
        .publish_event(event(EventKind::UserCreated.name()))
        .await
        .unwrap();
    assert_eq!(gateway.queue_len("webhook.user.created.retry"), 1);

    // TTL elapses: the retry is dead-lettered back to the primary queue.
    assert_eq!(gateway.expire("webhook.user.created.retry").await, 1);

    assert_eq!(handler.calls(), 2);
    assert_eq!(gateway.acked(), 2);
    assert_eq!(gateway.queue_len("webhook.user.created"), 0);
    assert!(gateway.dropped().is_empty());

    let retry = body_of(&gateway, 1);
    assert_eq!(retry.headers.retry_count, 1);
    assert_eq!(
        retry.headers.original_message_id.as_deref(),
        Some(first.message_id.as_str())
    );
    assert_eq!(gateway.published()[1].routing_key, "user.created.retry");
    assert_eq!(gateway.published()[1].options.expiration_ms, Some(1_000));
}

#[tokio::test]
async fn test_budget_of_three_drops_after_third_failure() {
    let (gateway, queue) = setup().await;
    let handler = Scripted::new(usize::MAX);
    queue
        .consume_events(EventKind::UserCreated.name(), handler.clone())
        .await
        .unwrap();

    queue
        .publish_event(event(EventKind::UserCreated.name()))
        .await
        .unwrap();
    gateway.expire("webhook.user.created.retry").await;
    gateway.expire("webhook.user.created.retry").await;
    // Nothing left to retry.
    assert_eq!(gateway.expire("webhook.user.created.retry").await, 0);

    assert_eq!(handler.calls(), 3);

    let counts: Vec<u32> = (0..gateway.published().len())
        .map(|i| body_of(&gateway, i).headers.retry_count)
        .collect();
    assert_eq!(counts, vec![0, 1, 2]);

    // The third failure is nacked and dead-lettered to a key nothing consumes.
    let dropped = gateway.dropped();
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0].routing_key, "user.created.dead");
    assert_eq!(dropped[0].message.headers.retry_count, 2);
    assert_eq!(gateway.acked(), 2);
}

#[tokio::test]
async fn test_priority_decays_per_attempt() {
    let (gateway, queue) = setup().await;
    let handler = Scripted::new(3);
    queue
        .consume_events(EventKind::CourseCompleted.name(), handler.clone())
        .await
        .unwrap();

    queue
        .publish_event(event(EventKind::CourseCompleted.name()))
        .await
        .unwrap();
    for _ in 0..3 {
        gateway.expire("webhook.course.completed.retry").await;
    }
    assert_eq!(handler.calls(), 4);

    let published = gateway.published();
    let priorities: Vec<Option<u8>> = published.iter().map(|p| p.options.priority).collect();
    let delays: Vec<Option<u64>> = published.iter().map(|p| p.options.expiration_ms).collect();
    assert_eq!(priorities, vec![Some(9), Some(9), Some(8), Some(7)]);
    assert_eq!(delays, vec![None, Some(1_000), Some(2_000), Some(4_000)]);
}

#[tokio::test]
async fn test_message_ids_are_unique_and_chained() {
    let (gateway, queue) = setup().await;
    let handler = Scripted::new(2);
    queue
        .consume_events(EventKind::UserEnrolmentCreated.name(), handler.clone())
        .await
        .unwrap();

    queue
        .publish_event(event(EventKind::UserEnrolmentCreated.name()))
        .await
        .unwrap();
    gateway.expire("webhook.user.enrolment.retry").await;
    gateway.expire("webhook.user.enrolment.retry").await;

    let messages: Vec<QueuedMessage> = (0..gateway.published().len())
        .map(|i| body_of(&gateway, i))
        .collect();
    assert_eq!(messages.len(), 3);
    let ids: HashSet<&str> = messages.iter().map(|m| m.message_id.as_str()).collect();
    assert_eq!(ids.len(), 3);
    for pair in messages.windows(2) {
        assert_eq!(
            pair[1].headers.original_message_id.as_deref(),
            Some(pair[0].message_id.as_str())
        );
    }
}

#[tokio::test]
async fn test_unsupported_event_reaches_default_consumer() {
    let (gateway, queue) = setup().await;
    let forum = EventKind::from_name("\\mod_forum\\event\\post_created");
    let handler = Scripted::new(0);
    let mut handlers = HandlerMap::new();
    handlers.register(forum.clone(), handler.clone());
    queue
        .consume_events("default", Arc::new(handlers))
        .await
        .unwrap();

    let message = queue.publish_event(event(forum.name())).await.unwrap();
    assert_eq!(message.headers.max_retries, 2);
    assert_eq!(gateway.published()[0].routing_key, "events.default");
    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn test_hybrid_falls_back_to_direct_exactly_once() {
    let (gateway, queue) = setup().await;
    let handler = Scripted::new(0);
    let mut handlers = HandlerMap::new();
    handlers.register(EventKind::UserCreated, handler.clone());

    let mode = recommended_mode(true, queue.is_connected());
    assert_eq!(mode, ProcessingMode::Hybrid);
    let context = build_context(mode, handlers, Some(queue.clone())).unwrap();

    gateway.set_reject_publishes(true);
    let dispatch = context
        .process_event(&event(EventKind::UserCreated.name()), None)
        .await
        .unwrap();

    assert_eq!(dispatch, Dispatch::Processed);
    assert_eq!(handler.calls(), 1);
    assert!(gateway.published().is_empty());
}

#[tokio::test]
async fn test_topology_survives_repeated_initialization() {
    let (gateway, queue) = setup().await;
    let before = gateway.queue_names();
    queue.initialize().await.unwrap();
    queue.create_topology().await.unwrap();
    assert_eq!(gateway.queue_names(), before);
    assert!(gateway.has_exchange("webhook-events"));
    assert!(gateway.has_exchange("webhook-events.dlx"));
}
