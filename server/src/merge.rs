use std::sync::Arc;

use tracing::{info, warn};

use crate::{error::RelayError, store::ConversationStore, types::Contact};

/// Folds anonymous session conversations into an authenticated user.
#[derive(Clone)]
pub struct IdentityMerger {
    store: Arc<dyn ConversationStore>,
}

impl IdentityMerger {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self { store }
    }

    /// Tags every live conversation of `session_id` with `user_id`,
    /// re-derives the unread state over the user's whole history, and
    /// backfills the user's conversations from `profile`. Idempotent.
    /// Fails with `MergeConflict`, changing nothing, when any live session
    /// conversation already belongs to another user.
    ///
    /// Returns the ids of the session's conversations now owned by the user.
    pub async fn merge_guest_into_user(
        &self,
        session_id: &str,
        user_id: &str,
        profile: &Contact,
    ) -> Result<Vec<String>, RelayError> {
        let session_id = session_id.trim();
        let user_id = user_id.trim();
        if session_id.is_empty() || user_id.is_empty() {
            return Err(RelayError::Validation(
                "sessionId and userId are required to merge".to_string(),
            ));
        }

        let live = self
            .store
            .conversations_for_session(session_id)
            .await?
            .into_iter()
            .filter(|c| !c.is_deleted())
            .collect::<Vec<_>>();

        if let Some(existing) = live
            .iter()
            .filter_map(|c| c.user_id.as_deref())
            .find(|owner| *owner != user_id)
        {
            warn!(session_id, existing_user_id = existing, requested_user_id = user_id, "refusing merge across users");
            return Err(RelayError::MergeConflict {
                session_id: session_id.to_string(),
                existing_user_id: existing.to_string(),
                requested_user_id: user_id.to_string(),
            });
        }

        let mut merged = Vec::with_capacity(live.len());
        let mut newly_tagged = 0usize;
        for conversation in &live {
            if self.store.assign_user(&conversation.id, user_id).await? {
                newly_tagged += 1;
            }
            merged.push(conversation.id.clone());
        }

        // Folded rows carry flags computed over their old, smaller family.
        if let Some(anchor) = merged.first() {
            self.store.recompute_family(anchor).await?;
        }

        if !profile.is_empty() {
            for conversation in self.store.conversations_for_user(user_id).await? {
                self.store.update_contact(&conversation.id, profile).await?;
            }
        }

        if newly_tagged > 0 {
            info!(session_id, user_id, newly_tagged, "guest conversations merged into user");
        }
        Ok(merged)
    }
}
