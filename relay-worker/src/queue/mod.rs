//! Event queue built on the broker gateway.
//!
//! ```text
//! publish_event ─► <exchange> ─rk─► <queue> ─► consumer ─ok─► ack
//!                                                 │
//!                                               fail
//!                                                 ▼
//!                     <exchange> ─rk.retry─► <queue>.retry   (ack original)
//!                                                 │ ttl
//!                                                 ▼
//!                     <exchange>.dlx ─rk─► <queue>           (next attempt)
//! ```

pub mod event_queue;
pub mod retry;
pub mod types;

pub use event_queue::{EventQueue, EventQueueSettings, RetryOutcome};
pub use retry::RetryDecision;
pub use types::{
    Crud, InboundEvent, MessageHeaders, PlatformId, QueuedMessage, SiteInfo, WebhookPayload,
};
