//! Websocket fan-out of store mutations.
//!
//! Best effort and at most once: a client that misses an event re-reads the
//! store. Nothing here is consulted for correctness.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::types::{Conversation, Message, Viewer};

pub fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

#[derive(Default)]
struct RealtimeState {
    clients: HashMap<usize, mpsc::UnboundedSender<String>>,
    admins: HashSet<usize>,
    conversation_watchers: HashMap<String, HashSet<usize>>,
}

impl RealtimeState {
    fn watchers_of<'a>(&self, ids: impl IntoIterator<Item = &'a String>) -> HashSet<usize> {
        ids.into_iter()
            .filter_map(|id| self.conversation_watchers.get(id))
            .flatten()
            .copied()
            .collect()
    }

    fn send(&self, targets: impl IntoIterator<Item = usize>, payload: &str) -> usize {
        let mut sent = 0;
        for client_id in targets {
            if let Some(sender) = self.clients.get(&client_id) {
                if sender.send(payload.to_string()).is_ok() {
                    sent += 1;
                }
            }
        }
        sent
    }
}

/// Who a typing indicator comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TypingSide {
    Customer,
    Staff,
}

#[derive(Clone, Default)]
pub struct RealtimeNotifier {
    state: Arc<Mutex<RealtimeState>>,
    next_client_id: Arc<AtomicUsize>,
}

impl RealtimeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_client(&self, sender: mpsc::UnboundedSender<String>) -> usize {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.state.lock().await.clients.insert(client_id, sender);
        client_id
    }

    pub async fn unregister(&self, client_id: usize) {
        let mut rt = self.state.lock().await;
        rt.clients.remove(&client_id);
        rt.admins.remove(&client_id);
        rt.conversation_watchers.retain(|_, watchers| {
            watchers.remove(&client_id);
            !watchers.is_empty()
        });
    }

    pub async fn join_admin(&self, client_id: usize) {
        self.state.lock().await.admins.insert(client_id);
    }

    pub async fn is_admin(&self, client_id: usize) -> bool {
        self.state.lock().await.admins.contains(&client_id)
    }

    /// Subscribes a client to every conversation of a merged history.
    pub async fn watch_conversation(&self, client_id: usize, family_ids: &[String]) {
        let mut rt = self.state.lock().await;
        for id in family_ids {
            rt.conversation_watchers
                .entry(id.clone())
                .or_default()
                .insert(client_id);
        }
    }

    pub async fn send_to_client<T: Serialize>(&self, client_id: usize, event: &str, data: T) {
        let Some(payload) = event_payload(event, data) else {
            return;
        };
        self.state.lock().await.send([client_id], &payload);
    }

    async fn broadcast<T: Serialize>(&self, family_ids: &[String], event: &str, data: T) {
        let Some(payload) = event_payload(event, data) else {
            return;
        };
        let rt = self.state.lock().await;
        let mut targets = rt.watchers_of(family_ids);
        targets.extend(rt.admins.iter().copied());
        let sent = rt.send(targets, &payload);
        debug!(event, sent, "realtime event published");
    }

    pub async fn message_appended(&self, family_ids: &[String], message: &Message) {
        self.broadcast(family_ids, "message:new", message).await;
    }

    pub async fn message_status(&self, family_ids: &[String], message: &Message) {
        self.broadcast(
            family_ids,
            "message:status",
            json!({
                "conversationId": message.conversation_id,
                "messageId": message.id,
                "status": message.status,
            }),
        )
        .await;
    }

    pub async fn conversation_updated(&self, conversation: &Conversation) {
        let Some(payload) = event_payload("conversation:updated", conversation) else {
            return;
        };
        let rt = self.state.lock().await;
        rt.send(rt.admins.iter().copied().collect::<Vec<_>>(), &payload);
    }

    pub async fn presence_changed(&self, conversation_id: &str, viewer: Option<&Viewer>) {
        let Some(payload) = event_payload(
            "presence:updated",
            json!({ "conversationId": conversation_id, "viewer": viewer }),
        ) else {
            return;
        };
        let rt = self.state.lock().await;
        rt.send(rt.admins.iter().copied().collect::<Vec<_>>(), &payload);
    }

    /// Ephemeral typing signal. Customer typing goes to admins, staff typing
    /// to the widget; the sending client never gets its own echo.
    pub async fn typing(
        &self,
        from_client: usize,
        family_ids: &[String],
        side: TypingSide,
        active: bool,
    ) {
        let Some(conversation_id) = family_ids.first() else {
            return;
        };
        let Some(payload) = event_payload(
            "typing",
            json!({ "conversationId": conversation_id, "from": side, "active": active }),
        ) else {
            return;
        };
        let rt = self.state.lock().await;
        let targets = match side {
            TypingSide::Customer => rt.admins.clone(),
            TypingSide::Staff => rt
                .watchers_of(family_ids)
                .into_iter()
                .filter(|id| !rt.admins.contains(id))
                .collect(),
        };
        rt.send(targets.into_iter().filter(|id| *id != from_client), &payload);
    }

    pub async fn client_count(&self) -> usize {
        self.state.lock().await.clients.len()
    }
}
