//! Event vocabulary and per-event delivery policy.
//!
//! Every inbound event resolves to an [`EventTypeConfig`]: either a dedicated
//! row registered for its name, or the `default` row. Nothing is dropped for
//! lack of configuration.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of the fallback row.
pub const DEFAULT_EVENT_NAME: &str = "default";

/// Default queue name prefix (`<prefix>.<category>.<action>`).
pub const DEFAULT_QUEUE_PREFIX: &str = "webhook";

/// Suffix for retry queues and retry routing keys.
pub const RETRY_SUFFIX: &str = ".retry";

/// Suffix for the dead-letter routing key of primary queues.
pub const DEAD_SUFFIX: &str = ".dead";

/// Platform events the relay knows about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    UserCreated,
    CourseCompleted,
    UserLoggedIn,
    UserEnrolmentCreated,
    Other(String),
}

impl EventKind {
    pub const KNOWN: [EventKind; 4] = [
        EventKind::UserCreated,
        EventKind::CourseCompleted,
        EventKind::UserLoggedIn,
        EventKind::UserEnrolmentCreated,
    ];

    pub fn from_name(name: &str) -> Self {
        match name {
            "\\core\\event\\user_created" => EventKind::UserCreated,
            "\\core\\event\\course_completed" => EventKind::CourseCompleted,
            "\\core\\event\\user_loggedin" => EventKind::UserLoggedIn,
            "\\core\\event\\user_enrolment_created" => EventKind::UserEnrolmentCreated,
            other => EventKind::Other(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            EventKind::UserCreated => "\\core\\event\\user_created",
            EventKind::CourseCompleted => "\\core\\event\\course_completed",
            EventKind::UserLoggedIn => "\\core\\event\\user_loggedin",
            EventKind::UserEnrolmentCreated => "\\core\\event\\user_enrolment_created",
            EventKind::Other(name) => name,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, EventKind::Other(_))
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Delivery policy for one event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTypeConfig {
    pub event_name: String,
    pub queue_name: String,
    pub routing_key: String,
    /// 1 (lowest) to 10 (highest).
    pub priority: u8,
    pub retries: u32,
    pub ttl_ms: u64,
    pub description: String,
}

impl EventTypeConfig {
    pub fn retry_queue_name(&self) -> String {
        format!("{}{}", self.queue_name, RETRY_SUFFIX)
    }

    pub fn retry_routing_key(&self) -> String {
        format!("{}{}", self.routing_key, RETRY_SUFFIX)
    }

    pub fn dead_routing_key(&self) -> String {
        format!("{}{}", self.routing_key, DEAD_SUFFIX)
    }

    pub fn is_default(&self) -> bool {
        self.event_name == DEFAULT_EVENT_NAME
    }
}

/// Immutable-after-startup table of event delivery policies.
#[derive(Debug, Clone)]
pub struct EventTypeRegistry {
    prefix: String,
    // Registration order is kept so topology is declared deterministically.
    events: Vec<EventTypeConfig>,
    default: EventTypeConfig,
}

impl EventTypeRegistry {
    /// Registry holding only the `default` row.
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            events: Vec::new(),
            default: EventTypeConfig {
                event_name: DEFAULT_EVENT_NAME.to_string(),
                queue_name: format!("{prefix}.events.default"),
                routing_key: "events.default".to_string(),
                priority: 5,
                retries: 2,
                ttl_ms: 300_000,
                description: "Default configuration for unsupported events".to_string(),
            },
        }
    }

    /// Registry with the built-in platform events.
    pub fn with_defaults(prefix: &str) -> Self {
        let mut registry = Self::new(prefix);
        registry.register(registry.row(
            &EventKind::UserCreated,
            "user.created",
            8,
            3,
            300_000,
            "User creation events",
        ));
        registry.register(registry.row(
            &EventKind::CourseCompleted,
            "course.completed",
            9,
            5,
            600_000,
            "Course completion events",
        ));
        registry.register(registry.row(
            &EventKind::UserLoggedIn,
            "user.login",
            3,
            1,
            60_000,
            "User login events",
        ));
        registry.register(registry.row(
            &EventKind::UserEnrolmentCreated,
            "user.enrolment",
            7,
            3,
            300_000,
            "User enrolment events",
        ));
        registry
    }

    fn row(
        &self,
        kind: &EventKind,
        routing_key: &str,
        priority: u8,
        retries: u32,
        ttl_ms: u64,
        description: &str,
    ) -> EventTypeConfig {
        EventTypeConfig {
            event_name: kind.name().to_string(),
            queue_name: format!("{}.{}", self.prefix, routing_key),
            routing_key: routing_key.to_string(),
            priority,
            retries,
            ttl_ms,
            description: description.to_string(),
        }
    }

    /// Add a row, replacing any existing row for the same event name.
    /// Priority is clamped into 1..=10.
    pub fn register(&mut self, mut config: EventTypeConfig) {
        config.priority = config.priority.clamp(1, 10);
        match self
            .events
            .iter_mut()
            .find(|c| c.event_name == config.event_name)
        {
            Some(existing) => *existing = config,
            None => self.events.push(config),
        }
    }

    /// Config for `event_name`, falling back to the default row.
    pub fn get(&self, event_name: &str) -> &EventTypeConfig {
        self.lookup(event_name).unwrap_or(&self.default)
    }

    /// Config for `event_name` only if it is registered.
    pub fn lookup(&self, event_name: &str) -> Option<&EventTypeConfig> {
        self.events.iter().find(|c| c.event_name == event_name)
    }

    /// Registered rows in registration order, without the default row.
    pub fn get_all(&self) -> &[EventTypeConfig] {
        &self.events
    }

    pub fn is_supported(&self, event_name: &str) -> bool {
        self.lookup(event_name).is_some()
    }

    pub fn get_default(&self) -> &EventTypeConfig {
        &self.default
    }

    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.events.iter().map(|c| c.event_name.as_str())
    }
}

impl Default for EventTypeRegistry {
    fn default() -> Self {
        Self::with_defaults(DEFAULT_QUEUE_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_rows() {
        let registry = EventTypeRegistry::default();
        let config = registry.get("\\core\\event\\user_created");
        assert_eq!(config.queue_name, "webhook.user.created");
        assert_eq!(config.routing_key, "user.created");
        assert_eq!(config.priority, 8);
        assert_eq!(config.retries, 3);
        assert_eq!(config.retry_queue_name(), "webhook.user.created.retry");
        assert_eq!(config.retry_routing_key(), "user.created.retry");

        let course = registry.get("\\core\\event\\course_completed");
        assert_eq!(course.priority, 9);
        assert_eq!(course.ttl_ms, 600_000);
        assert_eq!(registry.get_all().len(), 4);
    }

    #[test]
    fn test_unknown_event_falls_back_to_default() {
        let registry = EventTypeRegistry::default();
        let config = registry.get("\\mod_forum\\event\\post_created");
        assert!(config.is_default());
        assert_eq!(config.queue_name, "webhook.events.default");
        assert_eq!(config.routing_key, "events.default");
        assert!(!registry.is_supported("\\mod_forum\\event\\post_created"));
        assert!(registry.lookup("\\mod_forum\\event\\post_created").is_none());
        assert!(!registry.is_supported(DEFAULT_EVENT_NAME));
    }

    #[test]
    fn test_register_replaces_and_clamps() {
        let mut registry = EventTypeRegistry::new("lms");
        let mut config = EventTypeConfig {
            event_name: "\\mod_quiz\\event\\attempt_submitted".to_string(),
            queue_name: "lms.quiz.submitted".to_string(),
            routing_key: "quiz.submitted".to_string(),
            priority: 0,
            retries: 2,
            ttl_ms: 1_000,
            description: "Quiz submissions".to_string(),
        };
        registry.register(config.clone());
        assert_eq!(registry.get(&config.event_name).priority, 1);

        config.priority = 42;
        config.retries = 4;
        registry.register(config.clone());
        assert_eq!(registry.get_all().len(), 1);
        assert_eq!(registry.get(&config.event_name).priority, 10);
        assert_eq!(registry.get(&config.event_name).retries, 4);
        assert_eq!(registry.get_default().queue_name, "lms.events.default");
    }

    #[test]
    fn test_event_kind_round_trip_names() {
        for kind in EventKind::KNOWN {
            assert_eq!(EventKind::from_name(kind.name()), kind);
            assert!(kind.is_known());
        }
        let other = EventKind::from_name("\\core\\event\\something");
        assert_eq!(other, EventKind::Other("\\core\\event\\something".to_string()));
        assert!(!other.is_known());
    }
}
