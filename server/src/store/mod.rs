//! Durable conversations and messages.
//!
//! Every other component reads and writes through [`ConversationStore`].
//! Appends to one conversation family are serialized by the backend itself
//! (row locks in Postgres, the state lock in memory), never by callers.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::{
    error::RelayError,
    types::{
        AppendOutcome, ChannelOrigin, Contact, Conversation, ConversationFilter,
        ConversationStatus, Message, MessageDelivery, MessageStatus, NewConversation, NewMessage,
        Viewer,
    },
};

pub use memory::MemoryConversationStore;
pub use postgres::PgConversationStore;

pub const MAX_BODY_CHARS: usize = 4000;

/// Attempt by an admin to take or refresh the viewing lease.
#[derive(Debug, Clone)]
pub struct ViewerClaim {
    pub admin_id: String,
    pub admin_name: Option<String>,
    pub now: String,
    /// Leases whose last heartbeat is older than this are free to take.
    pub stale_before: String,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(&self, new: NewConversation) -> Result<Conversation, RelayError>;

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, RelayError>;

    /// Most recent conversation of the identity that is neither deleted nor
    /// closed, or a fresh one. Contact data on `new` enriches a found row.
    /// The flag is true when a conversation was created.
    async fn find_or_create_for_identity(
        &self,
        new: NewConversation,
    ) -> Result<(Conversation, bool), RelayError>;

    /// Persists a message, resurrects and reopens the conversation, and
    /// recomputes the unread state over the whole family. A message whose
    /// channel and external ref are already stored, in any conversation, is
    /// not written again; the outcome then points at the stored copy.
    async fn append_message(&self, new: NewMessage) -> Result<AppendOutcome, RelayError>;

    /// Re-derives `needs_response` and `unread_count` for every row of the
    /// conversation's family. Returns the family ids.
    async fn recompute_family(&self, conversation_id: &str) -> Result<Vec<String>, RelayError>;

    async fn list_conversations(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Vec<Conversation>, RelayError>;

    /// Messages across every conversation folded into the same identity,
    /// ordered by `created_at`.
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, RelayError>;

    async fn family_ids(&self, conversation_id: &str) -> Result<Vec<String>, RelayError>;

    async fn update_status(
        &self,
        id: &str,
        status: ConversationStatus,
    ) -> Result<Conversation, RelayError>;

    async fn soft_delete(&self, id: &str) -> Result<Conversation, RelayError>;

    async fn update_contact(&self, id: &str, contact: &Contact) -> Result<Conversation, RelayError>;

    /// Every conversation carrying the session id, deleted ones included.
    async fn conversations_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<Conversation>, RelayError>;

    /// Non-deleted conversations owned by the user.
    async fn conversations_for_user(&self, user_id: &str)
        -> Result<Vec<Conversation>, RelayError>;

    /// Tags the conversation with `user_id`. Returns false when it already
    /// carried that user, and `MergeConflict` when it carries another one.
    async fn assign_user(&self, id: &str, user_id: &str) -> Result<bool, RelayError>;

    /// Message that was stored with, or announced on `channel` under, the
    /// platform message id `external_ref`.
    async fn find_message_by_external_ref(
        &self,
        channel: ChannelOrigin,
        external_ref: &str,
    ) -> Result<Option<Message>, RelayError>;

    /// Message persisted from a webhook under `external_ref`. Unlike
    /// [`ConversationStore::find_message_by_external_ref`], delivery records
    /// are not consulted.
    async fn find_stored_message(
        &self,
        channel: ChannelOrigin,
        external_ref: &str,
    ) -> Result<Option<Message>, RelayError>;

    /// Customer-authored messages, newest first.
    async fn recent_customer_messages(&self, limit: usize) -> Result<Vec<Message>, RelayError>;

    /// Moves a message to `status`. The external ref is only filled in while
    /// the message is not yet terminal and has none.
    async fn update_message_status(
        &self,
        message_id: &str,
        status: MessageStatus,
        external_ref: Option<&str>,
    ) -> Result<Message, RelayError>;

    async fn record_delivery(&self, delivery: &MessageDelivery) -> Result<(), RelayError>;

    /// Atomically claims up to `limit` messages still `queued` whose last
    /// claim, or creation when never claimed, is older than `stale_before`,
    /// stamping them with `now`. Concurrent callers never get the same
    /// message until its claim goes stale again.
    async fn claim_queued(
        &self,
        stale_before: &str,
        now: &str,
        limit: usize,
    ) -> Result<Vec<Message>, RelayError>;

    /// Takes the lease if it is free, stale, or already held by the same
    /// admin. Returns whoever holds it afterwards.
    async fn claim_viewer(
        &self,
        id: &str,
        claim: &ViewerClaim,
    ) -> Result<Option<Viewer>, RelayError>;

    /// Clears the lease only if `admin_id` holds it.
    async fn release_viewer(&self, id: &str, admin_id: &str) -> Result<bool, RelayError>;
}

pub(crate) fn validate_body(body: &str) -> Result<String, RelayError> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(RelayError::Validation("message body is required".to_string()));
    }
    if trimmed.chars().count() > MAX_BODY_CHARS {
        return Err(RelayError::Validation(format!(
            "message body exceeds {MAX_BODY_CHARS} characters"
        )));
    }
    Ok(trimmed.to_string())
}
