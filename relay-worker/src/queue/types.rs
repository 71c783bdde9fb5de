//! Message formats for the relay.
//!
//! - [`InboundEvent`]: one platform event as delivered by the webhook listener
//! - [`WebhookPayload`]: the envelope the platform posts (token, site, events)
//! - [`QueuedMessage`]: an event plus the delivery metadata carried on the wire

use std::fmt;

use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::registry::EventKind;

/// Component tag attached to events that do not name one.
pub const DEFAULT_COMPONENT: &str = "core";

/// Platform identifiers arrive either as numbers or as strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlatformId {
    Int(i64),
    Str(String),
}

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformId::Int(id) => write!(f, "{id}"),
            PlatformId::Str(id) => f.write_str(id),
        }
    }
}

impl From<i64> for PlatformId {
    fn from(id: i64) -> Self {
        PlatformId::Int(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Crud {
    #[serde(rename = "c")]
    Create,
    #[serde(rename = "r")]
    Read,
    #[serde(rename = "u")]
    Update,
    #[serde(rename = "d")]
    Delete,
}

/// A platform event. Field names match the platform's webhook JSON; fields the
/// relay does not interpret are carried through untouched in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    #[serde(rename = "eventname")]
    pub event_name: String,
    #[serde(default = "default_component")]
    pub component: String,
    #[serde(rename = "objectid")]
    pub object_id: PlatformId,
    #[serde(rename = "userid")]
    pub user_id: PlatformId,
    #[serde(rename = "courseid", default, skip_serializing_if = "Option::is_none")]
    pub course_id: Option<PlatformId>,
    #[serde(
        rename = "relateduserid",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub related_user_id: Option<PlatformId>,
    pub crud: Crud,
    #[serde(rename = "timecreated")]
    pub time_created: i64,
    pub host: String,
    pub token: String,
    /// Event-specific details, passed through untouched. PHP encodes an
    /// empty map as `[]`, so any JSON value is accepted.
    #[serde(default)]
    pub other: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_component() -> String {
    DEFAULT_COMPONENT.to_string()
}

impl InboundEvent {
    pub fn kind(&self) -> EventKind {
        EventKind::from_name(&self.event_name)
    }
}

/// Site descriptor from the webhook envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteInfo {
    pub id: String,
    pub url: String,
    pub name: String,
    pub version: String,
}

/// Envelope posted by the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub token: String,
    pub events: Vec<InboundEvent>,
    pub site: SiteInfo,
}

impl WebhookPayload {
    /// Envelope synthesized around a single event when no real one exists,
    /// e.g. for events replayed from a queue.
    pub fn minimal(event: &InboundEvent) -> Self {
        let host = if event.host.is_empty() {
            "localhost"
        } else {
            event.host.as_str()
        };
        Self {
            token: event.token.clone(),
            events: vec![event.clone()],
            site: SiteInfo {
                id: "1".to_string(),
                url: format!("http://{host}"),
                name: "Platform Site".to_string(),
                version: "4.0".to_string(),
            },
        }
    }
}

/// Delivery metadata, duplicated into AMQP headers on publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeaders {
    pub event_type: String,
    pub component: String,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_message_id: Option<String>,
}

/// An event as it travels through the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    #[serde(flatten)]
    pub event: InboundEvent,
    #[serde(rename = "publishedAt")]
    pub published_at: DateTime<Utc>,
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub headers: MessageHeaders,
}

impl QueuedMessage {
    /// First-attempt message for `event`.
    pub fn new(event: InboundEvent, max_retries: u32) -> Self {
        let headers = MessageHeaders {
            event_type: event.event_name.clone(),
            component: event.component.clone(),
            retry_count: 0,
            max_retries,
            original_message_id: None,
        };
        Self {
            event,
            published_at: Utc::now(),
            message_id: generate_message_id(),
            headers,
        }
    }

    /// Successor of `self` for the next attempt. Gets a fresh id and points
    /// back at this message through `original_message_id`.
    pub fn next_attempt(&self, retry_count: u32, max_retries: u32) -> Self {
        Self {
            event: self.event.clone(),
            published_at: Utc::now(),
            message_id: generate_message_id(),
            headers: MessageHeaders {
                event_type: self.event.event_name.clone(),
                component: self.event.component.clone(),
                retry_count,
                max_retries,
                original_message_id: Some(self.message_id.clone()),
            },
        }
    }
}

/// `<epoch millis>-<9 random alphanumerics>`.
pub fn generate_message_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("{}-{}", Utc::now().timestamp_millis(), suffix)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn event(event_name: &str) -> InboundEvent {
        InboundEvent {
            event_name: event_name.to_string(),
            component: "core".to_string(),
            object_id: PlatformId::Int(42),
            user_id: PlatformId::Int(7),
            course_id: Some(PlatformId::Int(3)),
            related_user_id: None,
            crud: Crud::Create,
            time_created: 1_700_000_000,
            host: "lms.example.com".to_string(),
            token: "tok".to_string(),
            other: None,
            extra: Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW_EVENT: &str = r#"{
        "eventname": "\\core\\event\\user_created",
        "component": "core",
        "action": "created",
        "target": "user",
        "objectid": 42,
        "userid": "7",
        "crud": "c",
        "edulevel": 0,
        "contextid": 1,
        "timecreated": 1700000000,
        "host": "lms.example.com",
        "token": "tok",
        "other": null
    }"#;

    #[test]
    fn test_inbound_event_parses_platform_json() {
        let event: InboundEvent = serde_json::from_str(RAW_EVENT).unwrap();
        assert_eq!(event.kind(), EventKind::UserCreated);
        assert_eq!(event.object_id, PlatformId::Int(42));
        assert_eq!(event.user_id, PlatformId::Str("7".to_string()));
        assert_eq!(event.crud, Crud::Create);
        assert!(event.course_id.is_none());
        assert_eq!(event.extra.get("action"), Some(&Value::from("created")));
        assert_eq!(event.extra.get("edulevel"), Some(&Value::from(0)));
    }

    #[test]
    fn test_other_is_opaque() {
        let raw = RAW_EVENT.replace(r#""other": null"#, r#""other": []"#);
        let event: InboundEvent = serde_json::from_str(&raw).unwrap();
        assert_eq!(event.other, Some(Value::Array(Vec::new())));

        let raw = RAW_EVENT.replace(r#""other": null"#, r#""other": {"relateduserid": 9}"#);
        let event: InboundEvent = serde_json::from_str(&raw).unwrap();
        let message = QueuedMessage::new(event, 3);
        let body = serde_json::to_vec(&message).unwrap();
        let parsed: QueuedMessage = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.event.other.unwrap()["relateduserid"], 9);
    }

    #[test]
    fn test_queued_message_wire_format() {
        let event: InboundEvent = serde_json::from_str(RAW_EVENT).unwrap();
        let message = QueuedMessage::new(event, 3);

        let json: Value = serde_json::to_value(&message).unwrap();
        assert_eq!(json["eventname"], "\\core\\event\\user_created");
        assert_eq!(json["target"], "user");
        assert_eq!(json["messageId"], Value::from(message.message_id.clone()));
        assert_eq!(json["headers"]["retryCount"], 0);
        assert_eq!(json["headers"]["maxRetries"], 3);
        assert!(json["headers"].get("originalMessageId").is_none());
        assert!(json.get("publishedAt").is_some());

        let parsed: QueuedMessage = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.message_id, message.message_id);
        assert!(!parsed.event.extra.contains_key("messageId"));
        assert!(!parsed.event.extra.contains_key("headers"));
    }

    #[test]
    fn test_next_attempt_links_back() {
        let first = QueuedMessage::new(fixtures::event("\\core\\event\\user_created"), 3);
        let second = first.next_attempt(1, 3);
        assert_ne!(second.message_id, first.message_id);
        assert_eq!(second.headers.retry_count, 1);
        assert_eq!(
            second.headers.original_message_id.as_deref(),
            Some(first.message_id.as_str())
        );
        assert_eq!(second.event, first.event);
    }

    #[test]
    fn test_message_ids_are_unique() {
        let ids: std::collections::HashSet<String> =
            (0..1000).map(|_| generate_message_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_minimal_payload() {
        let mut event = fixtures::event("\\core\\event\\user_created");
        event.host = String::new();
        let payload = WebhookPayload::minimal(&event);
        assert_eq!(payload.site.url, "http://localhost");
        assert_eq!(payload.events.len(), 1);
        assert_eq!(payload.token, "tok");
    }
}
