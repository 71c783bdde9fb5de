use async_trait::async_trait;
use tracing::info;

use super::{ProcessingMode, ProcessingStrategy};
use crate::error::{RelayError, RelayResult};
use crate::queue::{EventQueue, InboundEvent, WebhookPayload};

/// Publishes events to the queue; handlers run on the consumer side.
pub struct QueueStrategy {
    queue: EventQueue,
}

impl QueueStrategy {
    pub fn new(queue: EventQueue) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl ProcessingStrategy for QueueStrategy {
    fn mode(&self) -> ProcessingMode {
        ProcessingMode::Queue
    }

    fn should_process(&self, event: &InboundEvent) -> bool {
        self.queue.is_connected() && self.queue.is_event_supported(&event.event_name)
    }

    async fn process(
        &self,
        event: &InboundEvent,
        _payload: Option<&WebhookPayload>,
    ) -> RelayResult<()> {
        if !self.queue.is_connected() {
            return Err(RelayError::connection(format!(
                "event queue unavailable for {}",
                event.event_name
            )));
        }
        let message = self.queue.publish_event(event.clone()).await?;
        info!(
            event_name = %event.event_name,
            message_id = %message.message_id,
            "event_enqueued"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::InMemoryGateway;
    use crate::error_handler::ErrorHandler;
    use crate::queue::types::fixtures;
    use crate::queue::EventQueueSettings;
    use crate::registry::{EventKind, EventTypeRegistry};
    use std::sync::Arc;

    async fn strategy() -> (Arc<InMemoryGateway>, QueueStrategy) {
        let gateway = Arc::new(InMemoryGateway::new("webhook-events"));
        let queue = EventQueue::new(
            gateway.clone(),
            Arc::new(EventTypeRegistry::default()),
            Arc::new(ErrorHandler::default()),
            EventQueueSettings::default(),
        );
        queue.initialize().await.unwrap();
        (gateway, QueueStrategy::new(queue))
    }

    #[tokio::test]
    async fn test_applies_to_supported_events_only() {
        let (_gateway, queued) = strategy().await;
        assert!(queued.should_process(&fixtures::event(EventKind::UserLoggedIn.name())));
        assert!(!queued.should_process(&fixtures::event("\\mod_forum\\event\\post_created")));
    }

    #[tokio::test]
    async fn test_publishes() {
        let (gateway, queued) = strategy().await;
        let event = fixtures::event(EventKind::UserLoggedIn.name());
        queued.process(&event, None).await.unwrap();
        assert_eq!(gateway.published()[0].routing_key, "user.login");
    }

    #[tokio::test]
    async fn test_disconnected_is_a_connection_error() {
        let (gateway, queued) = strategy().await;
        gateway.drop_connection();
        let event = fixtures::event(EventKind::UserLoggedIn.name());
        assert!(!queued.should_process(&event));
        let err = queued.process(&event, None).await.unwrap_err();
        assert_eq!(err.code(), "QUEUE_CONNECTION_ERROR");
    }
}
