use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{validate_body, ConversationStore, ViewerClaim};
use crate::{
    error::RelayError,
    types::{
        listing_order, next_message_timestamp, now_iso, AppendOutcome, ChannelOrigin, Contact,
        Conversation, ConversationFilter, ConversationStatus, IdentityKey, Message,
        MessageDelivery, MessageStatus, NewConversation, NewMessage, Viewer,
    },
    unread,
};

#[derive(Default)]
struct MemoryState {
    conversations: HashMap<String, Conversation>,
    messages: Vec<Message>,
    deliveries: Vec<MessageDelivery>,
    /// Retry-sweep claims by message id.
    claims: HashMap<String, String>,
}

/// Process-local store. One lock guards everything, so every write is
/// serialized; suitable for tests and single-instance development.
#[derive(Default)]
pub struct MemoryConversationStore {
    state: RwLock<MemoryState>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn conversation_from_new(new: NewConversation) -> Conversation {
    let now = now_iso();
    let (session_id, user_id) = match new.owner {
        IdentityKey::Session(session_id) => (Some(session_id), None),
        IdentityKey::User(user_id) => (new.session_id, Some(user_id)),
    };
    Conversation {
        id: Uuid::new_v4().to_string(),
        session_id,
        user_id,
        contact: new.contact.normalized(),
        status: ConversationStatus::Open,
        needs_response: false,
        unread_count: 0,
        last_message_at: None,
        last_customer_message_at: None,
        link: new.link,
        viewer: None,
        deleted_at: None,
        created_at: now.clone(),
        updated_at: now,
    }
}

fn owned_by(conversation: &Conversation, owner: &IdentityKey) -> bool {
    match owner {
        IdentityKey::User(user_id) => conversation.user_id.as_deref() == Some(user_id.as_str()),
        IdentityKey::Session(session_id) => {
            conversation.user_id.is_none()
                && conversation.session_id.as_deref() == Some(session_id.as_str())
        }
    }
}

impl MemoryState {
    fn conversation(&self, id: &str) -> Result<&Conversation, RelayError> {
        self.conversations
            .get(id)
            .ok_or_else(|| RelayError::not_found("conversation", id))
    }

    fn conversation_mut(&mut self, id: &str) -> Result<&mut Conversation, RelayError> {
        self.conversations
            .get_mut(id)
            .ok_or_else(|| RelayError::not_found("conversation", id))
    }

    fn family_ids(&self, id: &str) -> Result<Vec<String>, RelayError> {
        let anchor = self.conversation(id)?;
        let mut ids = self
            .conversations
            .values()
            .filter(|other| anchor.same_family(other))
            .map(|c| c.id.clone())
            .collect::<Vec<_>>();
        ids.sort();
        Ok(ids)
    }

    fn family_messages(&self, ids: &[String]) -> Vec<Message> {
        let mut messages = self
            .messages
            .iter()
            .filter(|m| ids.contains(&m.conversation_id))
            .cloned()
            .collect::<Vec<_>>();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        messages
    }

    fn stored_message(&self, channel: ChannelOrigin, external_ref: &str) -> Option<&Message> {
        self.messages
            .iter()
            .find(|m| m.channel_origin == channel && m.external_ref.as_deref() == Some(external_ref))
    }

    fn recompute_unread(&mut self, ids: &[String]) {
        let state = unread::derive(&self.family_messages(ids));
        for id in ids {
            if let Some(conversation) = self.conversations.get_mut(id) {
                conversation.needs_response = state.needs_response;
                conversation.unread_count = state.unread_count;
            }
        }
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn create_conversation(&self, new: NewConversation) -> Result<Conversation, RelayError> {
        let conversation = conversation_from_new(new);
        let mut state = self.state.write().await;
        state
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, RelayError> {
        let state = self.state.read().await;
        Ok(state.conversations.get(id).cloned())
    }

    async fn find_or_create_for_identity(
        &self,
        new: NewConversation,
    ) -> Result<(Conversation, bool), RelayError> {
        let mut state = self.state.write().await;
        let existing = state
            .conversations
            .values()
            .filter(|c| {
                owned_by(c, &new.owner) && !c.is_deleted() && c.status != ConversationStatus::Closed
            })
            .max_by(|a, b| {
                let a_at = a.last_message_at.as_ref().unwrap_or(&a.created_at);
                let b_at = b.last_message_at.as_ref().unwrap_or(&b.created_at);
                a_at.cmp(b_at)
            })
            .map(|c| c.id.clone());

        if let Some(id) = existing {
            let conversation = state.conversation_mut(&id)?;
            let mut changed = conversation.contact.enrich(&new.contact);
            if conversation.link.is_none() && new.link.is_some() {
                conversation.link = new.link;
                changed = true;
            }
            if changed {
                conversation.updated_at = now_iso();
            }
            return Ok((conversation.clone(), false));
        }

        let conversation = conversation_from_new(new);
        state
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok((conversation, true))
    }

    async fn append_message(&self, new: NewMessage) -> Result<AppendOutcome, RelayError> {
        let body = validate_body(&new.body)?;
        let mut state = self.state.write().await;
        let conversation = state.conversation(&new.conversation_id)?.clone();

        if let Some(external_ref) = new.external_ref.as_deref() {
            if let Some(existing) = state.stored_message(new.channel_origin, external_ref).cloned() {
                let conversation = state.conversation(&existing.conversation_id)?.clone();
                let family_ids = state.family_ids(&conversation.id)?;
                return Ok(AppendOutcome {
                    message: existing,
                    conversation,
                    family_ids,
                    duplicate: true,
                });
            }
        }

        let created_at =
            next_message_timestamp(conversation.last_message_at.as_deref(), Utc::now());
        let message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation.id.clone(),
            body,
            from_customer: new.from_customer,
            channel_origin: new.channel_origin,
            external_ref: new.external_ref,
            status: new.status,
            authored_by: new.authored_by,
            created_at: created_at.clone(),
        };
        state.messages.push(message.clone());

        {
            let row = state.conversation_mut(&conversation.id)?;
            row.last_message_at = Some(created_at.clone());
            if message.from_customer {
                row.last_customer_message_at = Some(created_at.clone());
            }
            row.status = ConversationStatus::Open;
            row.deleted_at = None;
            row.updated_at = created_at;
        }

        let family_ids = state.family_ids(&conversation.id)?;
        state.recompute_unread(&family_ids);
        let conversation = state.conversation(&conversation.id)?.clone();

        Ok(AppendOutcome {
            message,
            conversation,
            family_ids,
            duplicate: false,
        })
    }

    async fn recompute_family(&self, conversation_id: &str) -> Result<Vec<String>, RelayError> {
        let mut state = self.state.write().await;
        let family_ids = state.family_ids(conversation_id)?;
        state.recompute_unread(&family_ids);
        Ok(family_ids)
    }

    async fn list_conversations(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Vec<Conversation>, RelayError> {
        let state = self.state.read().await;
        let search = filter.search_term();
        let mut list = state
            .conversations
            .values()
            .filter(|c| filter.include_deleted || !c.is_deleted())
            .filter(|c| filter.status.map_or(true, |status| c.status == status))
            .filter(|c| {
                let Some(term) = search.as_deref() else {
                    return true;
                };
                let contact_hit = [&c.contact.name, &c.contact.email, &c.contact.phone]
                    .into_iter()
                    .flatten()
                    .any(|field| field.to_lowercase().contains(term));
                contact_hit
                    || c.id.to_lowercase() == term
                    || state
                        .messages
                        .iter()
                        .any(|m| m.conversation_id == c.id && m.body.to_lowercase().contains(term))
            })
            .cloned()
            .collect::<Vec<_>>();
        list.sort_by(listing_order);
        Ok(list)
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, RelayError> {
        let state = self.state.read().await;
        let ids = state.family_ids(conversation_id)?;
        Ok(state.family_messages(&ids))
    }

    async fn family_ids(&self, conversation_id: &str) -> Result<Vec<String>, RelayError> {
        let state = self.state.read().await;
        state.family_ids(conversation_id)
    }

    async fn update_status(
        &self,
        id: &str,
        status: ConversationStatus,
    ) -> Result<Conversation, RelayError> {
        let mut state = self.state.write().await;
        let conversation = state.conversation_mut(id)?;
        if conversation.status != status {
            conversation.status = status;
            conversation.updated_at = now_iso();
        }
        Ok(conversation.clone())
    }

    async fn soft_delete(&self, id: &str) -> Result<Conversation, RelayError> {
        let mut state = self.state.write().await;
        let conversation = state.conversation_mut(id)?;
        if conversation.deleted_at.is_none() {
            let now = now_iso();
            conversation.deleted_at = Some(now.clone());
            conversation.updated_at = now;
        }
        Ok(conversation.clone())
    }

    async fn update_contact(&self, id: &str, contact: &Contact) -> Result<Conversation, RelayError> {
        let mut state = self.state.write().await;
        let conversation = state.conversation_mut(id)?;
        if conversation.contact.enrich(contact) {
            conversation.updated_at = now_iso();
        }
        Ok(conversation.clone())
    }

    async fn conversations_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<Conversation>, RelayError> {
        let state = self.state.read().await;
        let mut list = state
            .conversations
            .values()
            .filter(|c| c.session_id.as_deref() == Some(session_id))
            .cloned()
            .collect::<Vec<_>>();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(list)
    }

    async fn conversations_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<Conversation>, RelayError> {
        let state = self.state.read().await;
        let mut list = state
            .conversations
            .values()
            .filter(|c| c.user_id.as_deref() == Some(user_id) && !c.is_deleted())
            .cloned()
            .collect::<Vec<_>>();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(list)
    }

    async fn assign_user(&self, id: &str, user_id: &str) -> Result<bool, RelayError> {
        let mut state = self.state.write().await;
        let conversation = state.conversation_mut(id)?;
        match conversation.user_id.as_deref() {
            Some(existing) if existing == user_id => Ok(false),
            Some(existing) => Err(RelayError::MergeConflict {
                session_id: conversation.session_id.clone().unwrap_or_default(),
                existing_user_id: existing.to_string(),
                requested_user_id: user_id.to_string(),
            }),
            None => {
                conversation.user_id = Some(user_id.to_string());
                conversation.updated_at = now_iso();
                Ok(true)
            }
        }
    }

    async fn find_message_by_external_ref(
        &self,
        channel: ChannelOrigin,
        external_ref: &str,
    ) -> Result<Option<Message>, RelayError> {
        let state = self.state.read().await;
        let direct = state
            .messages
            .iter()
            .filter(|m| m.channel_origin == channel && m.external_ref.as_deref() == Some(external_ref))
            .max_by(|a, b| a.created_at.cmp(&b.created_at));
        if let Some(message) = direct {
            return Ok(Some(message.clone()));
        }

        let announced = state
            .deliveries
            .iter()
            .filter(|d| d.channel == channel && d.external_ref.as_deref() == Some(external_ref))
            .max_by(|a, b| a.attempted_at.cmp(&b.attempted_at))
            .and_then(|d| state.messages.iter().find(|m| m.id == d.message_id));
        Ok(announced.cloned())
    }

    async fn find_stored_message(
        &self,
        channel: ChannelOrigin,
        external_ref: &str,
    ) -> Result<Option<Message>, RelayError> {
        let state = self.state.read().await;
        Ok(state.stored_message(channel, external_ref).cloned())
    }

    async fn recent_customer_messages(&self, limit: usize) -> Result<Vec<Message>, RelayError> {
        let state = self.state.read().await;
        let mut list = state
            .messages
            .iter()
            .filter(|m| m.from_customer)
            .cloned()
            .collect::<Vec<_>>();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list.truncate(limit);
        Ok(list)
    }

    async fn update_message_status(
        &self,
        message_id: &str,
        status: MessageStatus,
        external_ref: Option<&str>,
    ) -> Result<Message, RelayError> {
        let mut state = self.state.write().await;
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| RelayError::not_found("message", message_id))?;
        if !message.status.is_terminal() && message.external_ref.is_none() {
            message.external_ref = external_ref.map(str::to_string);
        }
        message.status = status;
        Ok(message.clone())
    }

    async fn record_delivery(&self, delivery: &MessageDelivery) -> Result<(), RelayError> {
        let mut state = self.state.write().await;
        state.deliveries.push(delivery.clone());
        Ok(())
    }

    async fn claim_queued(
        &self,
        stale_before: &str,
        now: &str,
        limit: usize,
    ) -> Result<Vec<Message>, RelayError> {
        let mut state = self.state.write().await;
        let mut list = state
            .messages
            .iter()
            .filter(|m| {
                let claimed_at = state.claims.get(&m.id).unwrap_or(&m.created_at);
                m.status == MessageStatus::Queued && claimed_at.as_str() < stale_before
            })
            .cloned()
            .collect::<Vec<_>>();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list.truncate(limit);
        for message in &list {
            state.claims.insert(message.id.clone(), now.to_string());
        }
        Ok(list)
    }

    async fn claim_viewer(
        &self,
        id: &str,
        claim: &ViewerClaim,
    ) -> Result<Option<Viewer>, RelayError> {
        let mut state = self.state.write().await;
        let conversation = state.conversation_mut(id)?;
        let takeable = match &conversation.viewer {
            None => true,
            Some(viewer) => {
                viewer.admin_id == claim.admin_id
                    || viewer.last_heartbeat.as_str() < claim.stale_before.as_str()
            }
        };
        if takeable {
            let viewing_since = conversation
                .viewer
                .as_ref()
                .filter(|v| v.admin_id == claim.admin_id)
                .map(|v| v.viewing_since.clone())
                .unwrap_or_else(|| claim.now.clone());
            conversation.viewer = Some(Viewer {
                admin_id: claim.admin_id.clone(),
                admin_name: claim.admin_name.clone(),
                viewing_since,
                last_heartbeat: claim.now.clone(),
            });
        }
        Ok(conversation.viewer.clone())
    }

    async fn release_viewer(&self, id: &str, admin_id: &str) -> Result<bool, RelayError> {
        let mut state = self.state.write().await;
        let conversation = state.conversation_mut(id)?;
        if conversation
            .viewer
            .as_ref()
            .is_some_and(|v| v.admin_id == admin_id)
        {
            conversation.viewer = None;
            return Ok(true);
        }
        Ok(false)
    }
}
