//! Service facade used by the HTTP handlers and the websocket.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    channels::ChannelRegistry,
    config::RelayConfig,
    error::RelayError,
    inbound::InboundRouter,
    merge::IdentityMerger,
    outbound::OutboundDispatcher,
    presence::PresenceTracker,
    realtime::RealtimeNotifier,
    store::ConversationStore,
    types::{
        ChannelOrigin, Contact, Conversation, ConversationFilter, ConversationStatus,
        CurrentIdentity, IdentityKey, Message, NewConversation, NewMessage,
    },
};

/// A conversation with its history spanning every merged conversation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationHistory {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
}

/// A persisted message whose outbound relay runs in the background.
/// Dropping `relay` detaches the task.
pub struct Posted {
    pub message: Message,
    pub conversation: Conversation,
    pub relay: JoinHandle<()>,
}

#[derive(Clone)]
pub struct ChatRelay {
    store: Arc<dyn ConversationStore>,
    notifier: RealtimeNotifier,
    dispatcher: OutboundDispatcher,
    merger: IdentityMerger,
    presence: PresenceTracker,
    inbound: InboundRouter,
    config: Arc<RelayConfig>,
}

impl ChatRelay {
    pub fn new(config: RelayConfig, store: Arc<dyn ConversationStore>, channels: ChannelRegistry) -> Self {
        let notifier = RealtimeNotifier::new();
        let dispatcher = OutboundDispatcher::new(
            store.clone(),
            channels.clone(),
            notifier.clone(),
            config.quick_replies.clone(),
            config.outbound_timeout,
        );
        let inbound = InboundRouter::new(
            store.clone(),
            dispatcher.clone(),
            notifier.clone(),
            channels,
            config.webhook_secrets.clone(),
            config.quick_replies.clone(),
        )
        .with_whatsapp_phone_number_id(config.whatsapp.as_ref().map(|w| w.phone_number_id.clone()));
        Self {
            merger: IdentityMerger::new(store.clone()),
            presence: PresenceTracker::new(store.clone(), notifier.clone(), config.presence_heartbeat),
            store,
            notifier,
            dispatcher,
            inbound,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub fn notifier(&self) -> &RealtimeNotifier {
        &self.notifier
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn inbound(&self) -> &InboundRouter {
        &self.inbound
    }

    pub fn dispatcher(&self) -> &OutboundDispatcher {
        &self.dispatcher
    }

    /// Folds a guest session into a user when a request carries both. A
    /// conflicting merge is logged and skipped so the customer can keep
    /// chatting under their authenticated identity.
    async fn merge_pending(&self, identity: &CurrentIdentity) -> Result<(), RelayError> {
        let Some((session_id, user_id)) = identity.pending_merge() else {
            return Ok(());
        };
        let profile = identity.profile.clone().unwrap_or_default();
        match self.merger.merge_guest_into_user(&session_id, &user_id, &profile).await {
            Ok(_) => Ok(()),
            Err(RelayError::MergeConflict { .. }) => {
                warn!(session_id, user_id, "lazy merge skipped: session belongs to another user");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn merge(
        &self,
        session_id: &str,
        user_id: &str,
        profile: &Contact,
    ) -> Result<Vec<String>, RelayError> {
        self.merger.merge_guest_into_user(session_id, user_id, profile).await
    }

    /// The identity's current conversation, creating it on first contact.
    pub async fn resume_conversation(
        &self,
        identity: &CurrentIdentity,
    ) -> Result<ConversationHistory, RelayError> {
        let identity = identity.clone().normalized();
        self.merge_pending(&identity).await?;
        let (conversation, created) = self
            .store
            .find_or_create_for_identity(NewConversation::for_identity(&identity)?)
            .await?;
        if created {
            info!(conversation_id = %conversation.id, "conversation opened from widget");
            self.notifier.conversation_updated(&conversation).await;
        }
        let messages = self.store.list_messages(&conversation.id).await?;
        Ok(ConversationHistory {
            conversation,
            messages,
        })
    }

    /// History of the identity's latest live conversation without creating
    /// one. `None` when the identity never wrote.
    pub async fn widget_history(
        &self,
        identity: &CurrentIdentity,
    ) -> Result<Option<ConversationHistory>, RelayError> {
        let identity = identity.clone().normalized();
        let candidates = match identity.key()? {
            IdentityKey::User(user_id) => self.store.conversations_for_user(&user_id).await?,
            IdentityKey::Session(session_id) => self
                .store
                .conversations_for_session(&session_id)
                .await?
                .into_iter()
                .filter(|c| c.user_id.is_none() && !c.is_deleted())
                .collect(),
        };
        let Some(conversation) = candidates.into_iter().max_by(|a, b| {
            a.last_message_at
                .cmp(&b.last_message_at)
                .then_with(|| a.created_at.cmp(&b.created_at))
        }) else {
            return Ok(None);
        };
        let messages = self.store.list_messages(&conversation.id).await?;
        Ok(Some(ConversationHistory {
            conversation,
            messages,
        }))
    }

    /// Persists a widget message as `queued`, publishes it, and relays it to
    /// staff in the background.
    pub async fn post_customer_message(
        &self,
        identity: &CurrentIdentity,
        body: &str,
    ) -> Result<Posted, RelayError> {
        crate::store::validate_body(body)?;
        let identity = identity.clone().normalized();
        self.merge_pending(&identity).await?;
        let (conversation, _) = self
            .store
            .find_or_create_for_identity(NewConversation::for_identity(&identity)?)
            .await?;
        let appended = self
            .store
            .append_message(NewMessage::customer(&conversation.id, body, ChannelOrigin::Web))
            .await?;
        debug!(conversation_id = %conversation.id, message_id = %appended.message.id, "customer message stored");
        Ok(self.publish_and_spawn(appended.message, appended.conversation, appended.family_ids).await)
    }

    /// Persists a console reply and relays it to the customer's channel.
    pub async fn post_staff_reply(
        &self,
        conversation_id: &str,
        body: &str,
        author: Option<String>,
    ) -> Result<Posted, RelayError> {
        self.require_conversation(conversation_id).await?;
        let appended = self
            .store
            .append_message(
                NewMessage::staff(conversation_id, body, ChannelOrigin::AdminConsole).authored_by(author),
            )
            .await?;
        info!(conversation_id, message_id = %appended.message.id, "staff reply stored");
        Ok(self.publish_and_spawn(appended.message, appended.conversation, appended.family_ids).await)
    }

    async fn publish_and_spawn(
        &self,
        message: Message,
        conversation: Conversation,
        family_ids: Vec<String>,
    ) -> Posted {
        self.notifier.message_appended(&family_ids, &message).await;
        self.notifier.conversation_updated(&conversation).await;

        let dispatcher = self.dispatcher.clone();
        let (msg, conv) = (message.clone(), conversation.clone());
        let relay = tokio::spawn(async move {
            if let Err(e) = dispatcher.relay(&msg, &conv).await {
                // Left queued; the retry sweep picks it up.
                error!(message_id = %msg.id, error = %e, "relay failed");
            }
        });
        Posted {
            message,
            conversation,
            relay,
        }
    }

    async fn require_conversation(&self, id: &str) -> Result<Conversation, RelayError> {
        self.store
            .get_conversation(id)
            .await?
            .ok_or_else(|| RelayError::not_found("conversation", id))
    }

    /// Dashboard listing with expired viewer leases hidden.
    pub async fn list_conversations(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Vec<Conversation>, RelayError> {
        let now = chrono::Utc::now();
        Ok(self
            .store
            .list_conversations(filter)
            .await?
            .into_iter()
            .map(|c| self.presence.with_live_viewer(c, now))
            .collect())
    }

    pub async fn conversation_history(&self, id: &str) -> Result<ConversationHistory, RelayError> {
        let conversation = self.require_conversation(id).await?;
        let messages = self.store.list_messages(id).await?;
        Ok(ConversationHistory {
            conversation: self.presence.with_live_viewer(conversation, chrono::Utc::now()),
            messages,
        })
    }

    pub async fn update_status(
        &self,
        id: &str,
        status: ConversationStatus,
    ) -> Result<Conversation, RelayError> {
        let conversation = self.store.update_status(id, status).await?;
        info!(conversation_id = id, status = %status, "conversation status changed");
        self.notifier.conversation_updated(&conversation).await;
        Ok(conversation)
    }

    pub async fn delete_conversation(&self, id: &str) -> Result<Conversation, RelayError> {
        let conversation = self.store.soft_delete(id).await?;
        info!(conversation_id = id, "conversation soft-deleted");
        self.notifier.conversation_updated(&conversation).await;
        Ok(conversation)
    }

    pub async fn sweep_queued(&self) -> Result<usize, RelayError> {
        self.dispatcher.sweep_queued(self.config.retry_stale_after()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::MemoryConversationStore, types::MessageStatus};

    fn relay() -> ChatRelay {
        ChatRelay::new(
            RelayConfig::default(),
            Arc::new(MemoryConversationStore::new()),
            ChannelRegistry::default(),
        )
    }

    #[tokio::test]
    async fn resume_creates_once_and_history_is_empty_before_first_message() {
        let relay = relay();
        let guest = CurrentIdentity::anonymous("abc");
        assert!(relay.widget_history(&guest).await.unwrap().is_none());

        let first = relay.resume_conversation(&guest).await.unwrap();
        let second = relay.resume_conversation(&guest).await.unwrap();
        assert_eq!(first.conversation.id, second.conversation.id);
        assert!(second.messages.is_empty());
    }

    #[tokio::test]
    async fn web_message_without_staff_platforms_is_delivered() {
        let relay = relay();
        let posted = relay
            .post_customer_message(&CurrentIdentity::anonymous("abc"), "hi")
            .await
            .unwrap();
        posted.relay.await.unwrap();
        let history = relay.conversation_history(&posted.conversation.id).await.unwrap();
        assert_eq!(history.messages.len(), 1);
        // No staff chat configured: nothing primary was attempted.
        assert_eq!(history.messages[0].status, MessageStatus::Delivered);
        assert!(history.conversation.needs_response);
    }

    #[tokio::test]
    async fn staff_reply_to_missing_conversation_is_not_found() {
        let err = relay()
            .post_staff_reply("missing", "hello", None)
            .await
            .err()
            .unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn lazy_merge_when_a_logged_in_customer_writes() {
        let relay = relay();
        relay
            .post_customer_message(&CurrentIdentity::anonymous("abc"), "hi")
            .await
            .unwrap();
        let user = CurrentIdentity::authenticated(
            "U",
            Some("abc"),
            Contact {
                name: Some("Ana".to_string()),
                ..Contact::default()
            },
        );
        let posted = relay.post_customer_message(&user, "it's me").await.unwrap();
        assert_eq!(posted.conversation.user_id.as_deref(), Some("U"));
        assert_eq!(posted.conversation.contact.name.as_deref(), Some("Ana"));
        let history = relay.widget_history(&user).await.unwrap().unwrap();
        assert_eq!(history.messages.len(), 2);
        assert_eq!(history.conversation.unread_count, 2);
    }
}
