//! Handlers for the built-in platform events.
//!
//! Each handler resolves the user (and course, where the event has one)
//! through the platform API and logs the outcome. Lookup failures are
//! returned so queued deliveries get retried.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use tracing::{debug, info};

use super::{EventHandler, HandlerMap};
use crate::platform::PlatformLookup;
use crate::queue::{InboundEvent, PlatformId, WebhookPayload};
use crate::registry::EventKind;

pub struct PlatformEventHandler {
    kind: EventKind,
    platform: Arc<dyn PlatformLookup>,
}

impl PlatformEventHandler {
    pub fn new(kind: EventKind, platform: Arc<dyn PlatformLookup>) -> Self {
        Self { kind, platform }
    }

    fn course_id(event: &InboundEvent) -> anyhow::Result<&PlatformId> {
        event
            .course_id
            .as_ref()
            .ok_or_else(|| anyhow!("{} carries no course id", event.event_name))
    }
}

#[async_trait]
impl EventHandler for PlatformEventHandler {
    async fn handle(&self, event: &InboundEvent, payload: &WebhookPayload) -> anyhow::Result<()> {
        match &self.kind {
            EventKind::UserCreated => {
                let user = self
                    .platform
                    .get_user_by_id(&event.object_id)
                    .await
                    .context("user lookup failed")?;
                info!(
                    user_id = %event.object_id,
                    username = %user.username,
                    site = %payload.site.url,
                    "user_created_processed"
                );
            }
            EventKind::CourseCompleted => {
                let course_id = Self::course_id(event)?;
                let (user, course) = tokio::try_join!(
                    self.platform.get_user_by_id(&event.user_id),
                    self.platform.get_course_by_id(course_id),
                )
                .context("completion lookups failed")?;
                info!(
                    user_id = %event.user_id,
                    username = %user.username,
                    course_id = %course_id,
                    course = %course.shortname,
                    "course_completed_processed"
                );
            }
            EventKind::UserLoggedIn => {
                let user = self
                    .platform
                    .get_user_by_id(&event.user_id)
                    .await
                    .context("user lookup failed")?;
                info!(user_id = %event.user_id, username = %user.username, "user_login_processed");
            }
            EventKind::UserEnrolmentCreated => {
                let course_id = Self::course_id(event)?;
                // The enrolled user is the related user; userid is whoever enrolled them.
                let enrolled = event.related_user_id.as_ref().unwrap_or(&event.user_id);
                let (user, course) = tokio::try_join!(
                    self.platform.get_user_by_id(enrolled),
                    self.platform.get_course_by_id(course_id),
                )
                .context("enrolment lookups failed")?;
                info!(
                    user_id = %enrolled,
                    username = %user.username,
                    course_id = %course_id,
                    course = %course.shortname,
                    "user_enrolment_processed"
                );
            }
            EventKind::Other(name) => {
                debug!(event_name = %name, "event_ignored");
            }
        }
        Ok(())
    }
}

/// Platform handlers for every built-in event kind.
pub fn platform_handlers(platform: Arc<dyn PlatformLookup>) -> HandlerMap {
    let mut map = HandlerMap::new();
    for kind in EventKind::KNOWN {
        let handler = PlatformEventHandler::new(kind.clone(), Arc::clone(&platform));
        map.register(kind, Arc::new(handler));
    }
    map
}
