use async_trait::async_trait;
use tracing::warn;

use super::{DirectStrategy, ProcessingMode, ProcessingStrategy, QueueStrategy};
use crate::error::RelayResult;
use crate::handlers::HandlerMap;
use crate::queue::{EventQueue, InboundEvent, WebhookPayload};

/// Queue first, direct when the queue does not apply or fails.
pub struct HybridStrategy {
    direct: DirectStrategy,
    queued: Option<QueueStrategy>,
}

impl HybridStrategy {
    pub fn new(handlers: HandlerMap, queue: Option<EventQueue>) -> Self {
        Self {
            direct: DirectStrategy::new(handlers),
            queued: queue.map(QueueStrategy::new),
        }
    }
}

#[async_trait]
impl ProcessingStrategy for HybridStrategy {
    fn mode(&self) -> ProcessingMode {
        ProcessingMode::Hybrid
    }

    fn should_process(&self, event: &InboundEvent) -> bool {
        self.direct.should_process(event)
            || self
                .queued
                .as_ref()
                .is_some_and(|queued| queued.should_process(event))
    }

    async fn process(
        &self,
        event: &InboundEvent,
        payload: Option<&WebhookPayload>,
    ) -> RelayResult<()> {
        if let Some(queued) = self.queued.as_ref().filter(|q| q.should_process(event)) {
            match queued.process(event, payload).await {
                Ok(()) => return Ok(()),
                Err(err) => warn!(
                    event_name = %event.event_name,
                    error_code = err.code(),
                    error = %err,
                    "strategy_queue_fallback"
                ),
            }
        }
        self.direct.process(event, payload).await
    }
}
