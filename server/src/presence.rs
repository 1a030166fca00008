//! Advisory "who is looking at this conversation" lease.
//!
//! The lease never blocks a write. Expiry is evaluated on every read from
//! the stored heartbeat, so any instance can answer without a background task.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::{
    error::RelayError,
    realtime::RealtimeNotifier,
    store::{ConversationStore, ViewerClaim},
    types::{format_timestamp, parse_timestamp, Conversation, Viewer},
};

/// What one admin sees after a presence call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceView {
    pub conversation_id: String,
    pub viewer: Option<Viewer>,
    /// Another admin holds a live lease. Advisory only.
    pub viewed_by_other: bool,
}

#[derive(Clone)]
pub struct PresenceTracker {
    store: Arc<dyn ConversationStore>,
    notifier: RealtimeNotifier,
    heartbeat: Duration,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn ConversationStore>, notifier: RealtimeNotifier, heartbeat: Duration) -> Self {
        Self {
            store,
            notifier,
            heartbeat,
        }
    }

    fn expiry(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.heartbeat * 2).unwrap_or_else(|_| chrono::Duration::seconds(30))
    }

    /// The lease if its last heartbeat is recent enough at `now`.
    pub fn live_viewer(&self, viewer: Option<&Viewer>, now: DateTime<Utc>) -> Option<Viewer> {
        let viewer = viewer?;
        let last = parse_timestamp(&viewer.last_heartbeat)?;
        (now - last <= self.expiry()).then(|| viewer.clone())
    }

    /// Copy of `conversation` with an expired lease removed.
    pub fn with_live_viewer(&self, mut conversation: Conversation, now: DateTime<Utc>) -> Conversation {
        conversation.viewer = self.live_viewer(conversation.viewer.as_ref(), now);
        conversation
    }

    fn view(&self, conversation_id: &str, admin_id: &str, viewer: Option<Viewer>) -> PresenceView {
        PresenceView {
            conversation_id: conversation_id.to_string(),
            viewed_by_other: viewer.as_ref().is_some_and(|v| v.admin_id != admin_id),
            viewer,
        }
    }

    pub async fn start_viewing(
        &self,
        conversation_id: &str,
        admin_id: &str,
        admin_name: Option<&str>,
    ) -> Result<PresenceView, RelayError> {
        self.start_viewing_at(conversation_id, admin_id, admin_name, Utc::now())
            .await
    }

    pub async fn start_viewing_at(
        &self,
        conversation_id: &str,
        admin_id: &str,
        admin_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<PresenceView, RelayError> {
        let admin_id = admin_id.trim();
        if admin_id.is_empty() {
            return Err(RelayError::Validation("adminId is required".to_string()));
        }
        let claim = ViewerClaim {
            admin_id: admin_id.to_string(),
            admin_name: admin_name.map(str::to_string),
            now: format_timestamp(now),
            stale_before: format_timestamp(now - self.expiry()),
        };
        let holder = self.store.claim_viewer(conversation_id, &claim).await?;
        let viewer = self.live_viewer(holder.as_ref(), now);
        if viewer.as_ref().is_some_and(|v| v.admin_id == admin_id) {
            self.notifier
                .presence_changed(conversation_id, viewer.as_ref())
                .await;
        } else {
            debug!(conversation_id, admin_id, "conversation already viewed by another admin");
        }
        Ok(self.view(conversation_id, admin_id, viewer))
    }

    /// Refreshes the lease. Same conditional claim as `start_viewing`, so a
    /// heartbeat also picks up a lease that expired in the meantime.
    pub async fn heartbeat(
        &self,
        conversation_id: &str,
        admin_id: &str,
        admin_name: Option<&str>,
    ) -> Result<PresenceView, RelayError> {
        self.start_viewing_at(conversation_id, admin_id, admin_name, Utc::now())
            .await
    }

    pub async fn stop_viewing(
        &self,
        conversation_id: &str,
        admin_id: &str,
    ) -> Result<PresenceView, RelayError> {
        self.stop_viewing_at(conversation_id, admin_id, Utc::now()).await
    }

    pub async fn stop_viewing_at(
        &self,
        conversation_id: &str,
        admin_id: &str,
        now: DateTime<Utc>,
    ) -> Result<PresenceView, RelayError> {
        let released = self.store.release_viewer(conversation_id, admin_id).await?;
        if released {
            self.notifier.presence_changed(conversation_id, None).await;
        }
        self.active_viewer_view(conversation_id, admin_id, now).await
    }

    pub async fn active_viewer(&self, conversation_id: &str) -> Result<Option<Viewer>, RelayError> {
        self.active_viewer_at(conversation_id, Utc::now()).await
    }

    pub async fn active_viewer_at(
        &self,
        conversation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Viewer>, RelayError> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| RelayError::not_found("conversation", conversation_id))?;
        Ok(self.live_viewer(conversation.viewer.as_ref(), now))
    }

    async fn active_viewer_view(
        &self,
        conversation_id: &str,
        admin_id: &str,
        now: DateTime<Utc>,
    ) -> Result<PresenceView, RelayError> {
        let viewer = self.active_viewer_at(conversation_id, now).await?;
        Ok(self.view(conversation_id, admin_id, viewer))
    }
}
