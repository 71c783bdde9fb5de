//! Event handlers and the table that maps event kinds to them.

pub mod platform;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::queue::{InboundEvent, WebhookPayload};
use crate::registry::EventKind;

pub use platform::{platform_handlers, PlatformEventHandler};

/// Business logic run for one delivered event. An `Err` marks the delivery
/// as failed and engages the retry protocol when it came from a queue.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &InboundEvent, payload: &WebhookPayload) -> anyhow::Result<()>;
}

/// Handlers keyed by event kind.
#[derive(Clone, Default)]
pub struct HandlerMap {
    handlers: HashMap<EventKind, Arc<dyn EventHandler>>,
}

impl HandlerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: &EventKind) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn get_by_name(&self, event_name: &str) -> Option<Arc<dyn EventHandler>> {
        self.get(&EventKind::from_name(event_name))
    }

    pub fn contains(&self, event_name: &str) -> bool {
        self.handlers.contains_key(&EventKind::from_name(event_name))
    }

    /// Registered kinds, sorted by event name.
    pub fn kinds(&self) -> Vec<EventKind> {
        let mut kinds: Vec<EventKind> = self.handlers.keys().cloned().collect();
        kinds.sort_by(|a, b| a.name().cmp(b.name()));
        kinds
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Dispatches by event kind; events without a handler are accepted as-is.
#[async_trait]
impl EventHandler for HandlerMap {
    async fn handle(&self, event: &InboundEvent, payload: &WebhookPayload) -> anyhow::Result<()> {
        match self.get(&event.kind()) {
            Some(handler) => handler.handle(event, payload).await,
            None => {
                debug!(event_name = %event.event_name, "event_without_handler");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl EventHandler for Noop {
        async fn handle(&self, _: &InboundEvent, _: &WebhookPayload) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_handler_map_lookup() {
        let mut map = HandlerMap::new();
        map.register(EventKind::CourseCompleted, Arc::new(Noop));
        map.register(EventKind::UserCreated, Arc::new(Noop));
        map.register(EventKind::UserCreated, Arc::new(Noop));

        assert_eq!(map.len(), 2);
        assert!(map.contains("\\core\\event\\user_created"));
        assert!(!map.contains("\\core\\event\\user_loggedin"));
        assert!(map.get_by_name("\\core\\event\\course_completed").is_some());
        assert_eq!(
            map.kinds(),
            vec![EventKind::CourseCompleted, EventKind::UserCreated]
        );
    }

    #[tokio::test]
    async fn test_map_dispatches_by_kind() {
        struct Failing;

        #[async_trait]
        impl EventHandler for Failing {
            async fn handle(&self, _: &InboundEvent, _: &WebhookPayload) -> anyhow::Result<()> {
                anyhow::bail!("failing handler")
            }
        }

        let mut map = HandlerMap::new();
        map.register(EventKind::UserCreated, Arc::new(Failing));

        let created = crate::queue::types::fixtures::event("\\core\\event\\user_created");
        let other = crate::queue::types::fixtures::event("\\mod_forum\\event\\post_created");
        assert!(map
            .handle(&created, &WebhookPayload::minimal(&created))
            .await
            .is_err());
        assert!(map
            .handle(&other, &WebhookPayload::minimal(&other))
            .await
            .is_ok());
    }

    #[test]
    fn test_unknown_kinds_can_be_registered() {
        let mut map = HandlerMap::new();
        let kind = EventKind::from_name("\\mod_quiz\\event\\attempt_submitted");
        map.register(kind.clone(), Arc::new(Noop));
        assert!(map.get(&kind).is_some());
        assert!(map.contains("\\mod_quiz\\event\\attempt_submitted"));
    }
}
