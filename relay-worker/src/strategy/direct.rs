use async_trait::async_trait;
use tracing::{info, warn};

use super::{ProcessingMode, ProcessingStrategy};
use crate::error::{RelayError, RelayResult};
use crate::handlers::HandlerMap;
use crate::queue::{InboundEvent, WebhookPayload};

/// Runs the registered handler in the caller's task.
pub struct DirectStrategy {
    handlers: HandlerMap,
}

impl DirectStrategy {
    pub fn new(handlers: HandlerMap) -> Self {
        Self { handlers }
    }
}

#[async_trait]
impl ProcessingStrategy for DirectStrategy {
    fn mode(&self) -> ProcessingMode {
        ProcessingMode::Direct
    }

    fn should_process(&self, event: &InboundEvent) -> bool {
        self.handlers.contains(&event.event_name)
    }

    async fn process(
        &self,
        event: &InboundEvent,
        payload: Option<&WebhookPayload>,
    ) -> RelayResult<()> {
        let Some(handler) = self.handlers.get(&event.kind()) else {
            warn!(event_name = %event.event_name, "direct_no_handler");
            return Ok(());
        };

        let minimal;
        let payload = match payload {
            Some(payload) => payload,
            None => {
                minimal = WebhookPayload::minimal(event);
                &minimal
            }
        };

        handler
            .handle(event, payload)
            .await
            .map_err(|e| RelayError::Handler {
                event_name: event.event_name.clone(),
                reason: format!("{e:#}"),
            })?;

        info!(event_name = %event.event_name, "event_processed_direct");
        Ok(())
    }
}
