use std::sync::Arc;

use tracing::debug;

use super::{ProcessingMode, ProcessingStrategy};
use crate::error::RelayResult;
use crate::queue::{InboundEvent, WebhookPayload};

/// What [`ProcessingContext::process_event`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Processed,
    /// No path applies to the event.
    Skipped,
}

/// Entry point for inbound events; delegates to the selected strategy.
#[derive(Clone)]
pub struct ProcessingContext {
    strategy: Arc<dyn ProcessingStrategy>,
}

impl ProcessingContext {
    pub fn new(strategy: Arc<dyn ProcessingStrategy>) -> Self {
        Self { strategy }
    }

    pub fn set_strategy(&mut self, strategy: Arc<dyn ProcessingStrategy>) {
        self.strategy = strategy;
    }

    pub fn mode(&self) -> ProcessingMode {
        self.strategy.mode()
    }

    pub fn can_process(&self, event: &InboundEvent) -> bool {
        self.strategy.should_process(event)
    }

    pub async fn process_event(
        &self,
        event: &InboundEvent,
        payload: Option<&WebhookPayload>,
    ) -> RelayResult<Dispatch> {
        if !self.strategy.should_process(event) {
            debug!(
                event_name = %event.event_name,
                mode = %self.mode(),
                "event_skipped"
            );
            return Ok(Dispatch::Skipped);
        }
        self.strategy.process(event, payload).await?;
        Ok(Dispatch::Processed)
    }
}
