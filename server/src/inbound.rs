//! Resolution of platform webhooks to conversations.
//!
//! Staff chats reply to customers; everyone else writing to the bot is a
//! customer. A staff message resolves, first match wins, by `/reply`
//! command, by the platform's reply context, then by the quoted text. An
//! unresolved message is acknowledged to the platform and dropped.

use std::{
    collections::HashMap,
    sync::{Arc, LazyLock},
};

use regex::Regex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    channels::{parse_quick_reply_payload, telegram, whatsapp, ChannelRegistry, InboundPayload},
    config::WebhookSecrets,
    error::RelayError,
    outbound::OutboundDispatcher,
    realtime::RealtimeNotifier,
    store::ConversationStore,
    types::{
        ChannelOrigin, Contact, Conversation, MessageStatus, NewConversation, NewMessage,
        Platform, QuickReply,
    },
};

/// How many recent customer messages the quoted-text fallback scans.
const QUOTE_SCAN_LIMIT: usize = 200;
const QUOTE_PREFIX_CHARS: usize = 50;

static REPLY_COMMAND: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)^/reply(?:@\w+)?\s+(\S+)\s+(.+)$").ok());

/// Splits `/reply <conversationId> <text>`. `/reply@BotName` is accepted
/// for group chats.
pub fn parse_reply_command(text: &str) -> Option<(String, String)> {
    let caps = REPLY_COMMAND.as_ref()?.captures(text.trim())?;
    let body = caps.get(2)?.as_str().trim();
    if body.is_empty() {
        return None;
    }
    Some((caps.get(1)?.as_str().to_string(), body.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Command,
    ReplyContext,
    QuotedText,
    QuickReply,
    Customer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RouteOutcome {
    #[serde(rename_all = "camelCase")]
    Appended {
        conversation_id: String,
        message_id: String,
        resolution: Resolution,
    },
    #[serde(rename_all = "camelCase")]
    Duplicate {
        conversation_id: String,
        message_id: String,
    },
    Unresolved { reason: String },
    Ignored { reason: String },
}

impl RouteOutcome {
    fn unresolved(reason: impl Into<String>) -> Self {
        Self::Unresolved {
            reason: reason.into(),
        }
    }

    fn ignored(reason: impl Into<String>) -> Self {
        Self::Ignored {
            reason: reason.into(),
        }
    }
}

/// Target of a staff message.
struct StaffTarget {
    conversation: Conversation,
    text: String,
    resolution: Resolution,
}

#[derive(Clone)]
pub struct InboundRouter {
    store: Arc<dyn ConversationStore>,
    dispatcher: OutboundDispatcher,
    notifier: RealtimeNotifier,
    channels: ChannelRegistry,
    secrets: WebhookSecrets,
    quick_replies: Vec<QuickReply>,
    whatsapp_phone_number_id: Option<String>,
}

fn normalize_for_match(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn prefix(text: &str, chars: usize) -> &str {
    match text.char_indices().nth(chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Best-effort match of quoted text against a stored customer message: the
/// quote contains the message's first 50 characters, or the message starts
/// with the quote's first 50 characters.
pub fn quote_matches(quoted: &str, body: &str) -> bool {
    let quoted = normalize_for_match(quoted);
    let body = normalize_for_match(body);
    if quoted.is_empty() || body.is_empty() {
        return false;
    }
    quoted.contains(prefix(&body, QUOTE_PREFIX_CHARS))
        || body.starts_with(prefix(&quoted, QUOTE_PREFIX_CHARS))
}

impl InboundRouter {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        dispatcher: OutboundDispatcher,
        notifier: RealtimeNotifier,
        channels: ChannelRegistry,
        secrets: WebhookSecrets,
        quick_replies: Vec<QuickReply>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            notifier,
            channels,
            secrets,
            quick_replies,
            whatsapp_phone_number_id: None,
        }
    }

    pub fn verify_telegram_secret(&self, header: Option<&str>) -> Result<(), RelayError> {
        if telegram::verify_secret(self.secrets.telegram_secret.as_deref(), header) {
            Ok(())
        } else {
            Err(RelayError::Unauthorized("invalid telegram webhook secret".to_string()))
        }
    }

    pub fn verify_whatsapp_signature(&self, header: Option<&str>, body: &[u8]) -> Result<(), RelayError> {
        let secret = self.secrets.whatsapp_app_secret.as_deref().unwrap_or("");
        if whatsapp::verify_whatsapp_signature(secret, header, body) {
            Ok(())
        } else {
            Err(RelayError::Unauthorized("invalid webhook signature".to_string()))
        }
    }

    pub fn verify_whatsapp_subscription(&self, params: &HashMap<String, String>) -> Option<String> {
        whatsapp::verify_subscription(params, self.secrets.whatsapp_verify_token.as_deref())
    }

    /// Phone number id this deployment answers for. Webhook changes for
    /// other numbers on the same app are dropped.
    pub fn with_whatsapp_phone_number_id(mut self, phone_number_id: Option<String>) -> Self {
        self.whatsapp_phone_number_id = phone_number_id.filter(|id| !id.trim().is_empty());
        self
    }

    pub async fn route_telegram(&self, update: telegram::TelegramUpdate) -> Result<RouteOutcome, RelayError> {
        match telegram::parse_update(update) {
            Some(payload) => self.route(payload).await,
            None => Ok(RouteOutcome::ignored("update carries no message")),
        }
    }

    /// Routes every message of one WhatsApp webhook delivery, in order.
    pub async fn route_whatsapp(&self, body: &serde_json::Value) -> Result<Vec<RouteOutcome>, RelayError> {
        let payloads = whatsapp::parse_webhook(body, self.whatsapp_phone_number_id.as_deref());
        let mut outcomes = Vec::with_capacity(payloads.len());
        for payload in payloads {
            outcomes.push(self.route(payload).await?);
        }
        Ok(outcomes)
    }

    pub async fn route(&self, payload: InboundPayload) -> Result<RouteOutcome, RelayError> {
        let Some(channel) = self.channels.get(payload.platform) else {
            warn!(platform = %payload.platform, "webhook for a platform that is not configured");
            return Ok(RouteOutcome::unresolved("platform not configured"));
        };

        // Redeliveries are matched before resolution: the conversation the
        // first delivery landed in may since have been closed or deleted.
        let origin = ChannelOrigin::from(payload.platform);
        if let Some(existing) = self
            .store
            .find_stored_message(origin, &payload.external_message_id)
            .await?
        {
            debug!(
                conversation_id = %existing.conversation_id,
                external_message_id = %payload.external_message_id,
                "webhook redelivery ignored"
            );
            return Ok(RouteOutcome::Duplicate {
                conversation_id: existing.conversation_id,
                message_id: existing.id,
            });
        }

        if !channel.is_staff_sender(&payload.sender_channel_id) {
            return self.route_customer(payload).await;
        }

        let target = match self.resolve_staff_target(&payload).await? {
            Ok(target) => target,
            Err(outcome) => {
                if let RouteOutcome::Unresolved { reason } = &outcome {
                    warn!(
                        platform = %payload.platform,
                        external_message_id = %payload.external_message_id,
                        reason,
                        "unresolved staff reply"
                    );
                    // Stop the platform from retrying a button press forever.
                    if payload.callback_id.is_some() {
                        if let Err(e) = channel.acknowledge(&payload).await {
                            debug!(error = %e, "acknowledging unresolved callback failed");
                        }
                    }
                }
                return Ok(outcome);
            }
        };

        let appended = self
            .store
            .append_message(
                NewMessage::staff(&target.conversation.id, &target.text, origin)
                    .external_ref(Some(payload.external_message_id.clone()))
                    .status(MessageStatus::Delivered)
                    .authored_by(payload.sender_name.clone()),
            )
            .await?;

        if appended.duplicate {
            debug!(
                conversation_id = %appended.conversation.id,
                external_message_id = %payload.external_message_id,
                "webhook redelivery ignored"
            );
            return Ok(RouteOutcome::Duplicate {
                conversation_id: appended.conversation.id,
                message_id: appended.message.id,
            });
        }

        info!(
            conversation_id = %appended.conversation.id,
            message_id = %appended.message.id,
            platform = %payload.platform,
            resolution = ?target.resolution,
            "staff reply received from platform"
        );
        self.publish_and_relay(&appended.family_ids, &appended.message, &appended.conversation)
            .await;

        if let Err(e) = channel.acknowledge(&payload).await {
            warn!(platform = %payload.platform, error = %e, "acknowledgement failed");
        }

        Ok(RouteOutcome::Appended {
            conversation_id: appended.conversation.id,
            message_id: appended.message.id,
            resolution: target.resolution,
        })
    }

    async fn publish_and_relay(
        &self,
        family_ids: &[String],
        message: &crate::types::Message,
        conversation: &Conversation,
    ) {
        self.notifier.message_appended(family_ids, message).await;
        self.notifier.conversation_updated(conversation).await;
        if let Err(e) = self.dispatcher.relay(message, conversation).await {
            error!(message_id = %message.id, error = %e, "relay after inbound message failed");
        }
    }

    async fn conversation(&self, id: &str) -> Result<Option<Conversation>, RelayError> {
        self.store.get_conversation(id).await
    }

    /// Outer error is a storage failure, inner error the outcome to report
    /// when nothing resolves.
    async fn resolve_staff_target(
        &self,
        payload: &InboundPayload,
    ) -> Result<Result<StaffTarget, RouteOutcome>, RelayError> {
        if let Some(data) = &payload.callback_data {
            let Some((reply_id, conversation_id)) = parse_quick_reply_payload(data) else {
                return Ok(Err(RouteOutcome::unresolved("unrecognised button payload")));
            };
            let Some(reply) = self.quick_replies.iter().find(|q| q.id == reply_id) else {
                return Ok(Err(RouteOutcome::unresolved(format!("unknown quick reply '{reply_id}'"))));
            };
            let Some(conversation) = self.conversation(&conversation_id).await? else {
                return Ok(Err(RouteOutcome::unresolved(format!(
                    "conversation {conversation_id} not found"
                ))));
            };
            return Ok(Ok(StaffTarget {
                conversation,
                text: reply.text.clone(),
                resolution: Resolution::QuickReply,
            }));
        }

        if payload.text.trim().is_empty() {
            return Ok(Err(RouteOutcome::ignored("empty message")));
        }

        if let Some((conversation_id, text)) = parse_reply_command(&payload.text) {
            return Ok(match self.conversation(&conversation_id).await? {
                Some(conversation) => Ok(StaffTarget {
                    conversation,
                    text,
                    resolution: Resolution::Command,
                }),
                None => Err(RouteOutcome::unresolved(format!(
                    "conversation {conversation_id} not found"
                ))),
            });
        }

        let has_context =
            payload.reply_to_external_message_id.is_some() || payload.quoted_text.is_some();
        if !has_context {
            return Ok(Err(RouteOutcome::unresolved("no reply context")));
        }

        if let Some(reply_to) = &payload.reply_to_external_message_id {
            let origin = ChannelOrigin::from(payload.platform);
            if let Some(message) = self.store.find_message_by_external_ref(origin, reply_to).await? {
                if let Some(conversation) = self.conversation(&message.conversation_id).await? {
                    return Ok(Ok(StaffTarget {
                        conversation,
                        text: payload.text.clone(),
                        resolution: Resolution::ReplyContext,
                    }));
                }
            }
        }

        if let Some(quoted) = &payload.quoted_text {
            let recent = self.store.recent_customer_messages(QUOTE_SCAN_LIMIT).await?;
            if let Some(hit) = recent.iter().find(|m| quote_matches(quoted, &m.body)) {
                if let Some(conversation) = self.conversation(&hit.conversation_id).await? {
                    return Ok(Ok(StaffTarget {
                        conversation,
                        text: payload.text.clone(),
                        resolution: Resolution::QuotedText,
                    }));
                }
            }
        }

        Ok(Err(RouteOutcome::unresolved("reply context did not match any message")))
    }

    async fn route_customer(&self, payload: InboundPayload) -> Result<RouteOutcome, RelayError> {
        if payload.text.trim().is_empty() {
            return Ok(RouteOutcome::ignored("empty message"));
        }
        let contact = Contact {
            name: payload.sender_name.clone(),
            phone: match payload.platform {
                Platform::WhatsApp => Some(format!("+{}", payload.sender_channel_id)),
                Platform::Telegram => None,
            },
            email: None,
        };
        let (conversation, created) = self
            .store
            .find_or_create_for_identity(NewConversation::for_platform_customer(
                payload.platform,
                &payload.sender_channel_id,
                contact,
            ))
            .await?;
        if created {
            info!(conversation_id = %conversation.id, platform = %payload.platform, "conversation opened from platform");
        }

        let appended = self
            .store
            .append_message(
                NewMessage::customer(&conversation.id, &payload.text, payload.platform.into())
                    .external_ref(Some(payload.external_message_id.clone()))
                    .status(MessageStatus::Delivered),
            )
            .await?;
        if appended.duplicate {
            return Ok(RouteOutcome::Duplicate {
                conversation_id: appended.conversation.id,
                message_id: appended.message.id,
            });
        }

        self.publish_and_relay(&appended.family_ids, &appended.message, &appended.conversation)
            .await;
        Ok(RouteOutcome::Appended {
            conversation_id: appended.conversation.id,
            message_id: appended.message.id,
            resolution: Resolution::Customer,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        channels::{testing::RecordingChannel, PlatformChannel},
        config::default_quick_replies,
        store::MemoryConversationStore,
        types::{CurrentIdentity, NewConversation},
    };

    struct Harness {
        store: Arc<MemoryConversationStore>,
        telegram: Arc<RecordingChannel>,
        whatsapp: Arc<RecordingChannel>,
        dispatcher: OutboundDispatcher,
        router: InboundRouter,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryConversationStore::new());
        let telegram = Arc::new(RecordingChannel::new(Platform::Telegram, &["-100"]));
        let whatsapp = Arc::new(RecordingChannel::new(Platform::WhatsApp, &["351900000001"]));
        let channels = ChannelRegistry::new(vec![
            telegram.clone() as Arc<dyn PlatformChannel>,
            whatsapp.clone(),
        ]);
        let notifier = RealtimeNotifier::new();
        let dispatcher = OutboundDispatcher::new(
            store.clone(),
            channels.clone(),
            notifier.clone(),
            default_quick_replies(),
            Duration::from_secs(2),
        );
        let router = InboundRouter::new(
            store.clone(),
            dispatcher.clone(),
            notifier,
            channels,
            WebhookSecrets::default(),
            default_quick_replies(),
        );
        Harness {
            store,
            telegram,
            whatsapp,
            dispatcher,
            router,
        }
    }

    async fn web_customer_message(h: &Harness, body: &str, relay: bool) -> Conversation {
        let (conversation, _) = h
            .store
            .find_or_create_for_identity(
                NewConversation::for_identity(&CurrentIdentity::anonymous("abc")).unwrap(),
            )
            .await
            .unwrap();
        let appended = h
            .store
            .append_message(NewMessage::customer(&conversation.id, body, ChannelOrigin::Web))
            .await
            .unwrap();
        if relay {
            h.dispatcher
                .relay(&appended.message, &appended.conversation)
                .await
                .unwrap();
        }
        appended.conversation
    }

    fn staff(text: &str, external_id: &str) -> InboundPayload {
        InboundPayload::text(Platform::Telegram, "-100", external_id, text)
            .with_sender_name(Some("Marta".to_string()))
    }

    #[test]
    fn reply_command_parsing() {
        assert_eq!(
            parse_reply_command("/reply c-1 On its way\nsecond line"),
            Some(("c-1".to_string(), "On its way\nsecond line".to_string()))
        );
        assert_eq!(
            parse_reply_command("/reply@relay_bot c-1 ok"),
            Some(("c-1".to_string(), "ok".to_string()))
        );
        assert_eq!(parse_reply_command("/reply c-1"), None);
        assert_eq!(parse_reply_command("please /reply c-1 hi"), None);
    }

    #[test]
    fn quoted_text_matches_by_prefix_either_way() {
        let body = "Where is my order 1234? It was due yesterday and nobody answers the phone";
        let notification = format!("💬 New message from Guest via web chat\n\n{body}\n\nReply with /reply x");
        assert!(quote_matches(&notification, body));
        assert!(quote_matches("where is my   order 1234?", body));
        assert!(!quote_matches("something else entirely", body));
        assert!(!quote_matches("", body));
    }

    #[tokio::test]
    async fn platform_customer_opens_conversation_and_redelivery_is_deduped() {
        let h = harness();
        let payload = InboundPayload::text(Platform::WhatsApp, "351911111111", "wamid.1", "Olá")
            .with_sender_name(Some("Rui".to_string()));

        let outcome = h.router.route(payload.clone()).await.unwrap();
        let RouteOutcome::Appended {
            conversation_id,
            resolution,
            ..
        } = outcome
        else {
            panic!("expected append, got {outcome:?}");
        };
        assert_eq!(resolution, Resolution::Customer);

        let conversation = h.store.get_conversation(&conversation_id).await.unwrap().unwrap();
        assert_eq!(conversation.session_id.as_deref(), Some("whatsapp:351911111111"));
        assert_eq!(conversation.contact.phone.as_deref(), Some("+351911111111"));
        let link = conversation.link.unwrap();
        assert_eq!(link.platform, Platform::WhatsApp);
        assert_eq!(link.channel_id, "351911111111");

        let messages = h.store.list_messages(&conversation_id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, MessageStatus::Delivered);
        assert_eq!(h.telegram.sent().await.len(), 1);

        let again = h.router.route(payload).await.unwrap();
        assert!(matches!(again, RouteOutcome::Duplicate { .. }));
        assert_eq!(h.store.list_messages(&conversation_id).await.unwrap().len(), 1);
        assert_eq!(h.telegram.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn reply_to_notification_resolves_and_is_acknowledged() {
        let h = harness();
        let conversation = web_customer_message(&h, "Where is my order?", true).await;

        let outcome = h
            .router
            .route(staff("On its way", "tg-9").replying_to(Some("telegram-out-1".to_string()), None))
            .await
            .unwrap();
        match outcome {
            RouteOutcome::Appended {
                conversation_id,
                resolution,
                ..
            } => {
                assert_eq!(conversation_id, conversation.id);
                assert_eq!(resolution, Resolution::ReplyContext);
            }
            other => panic!("expected append, got {other:?}"),
        }

        let messages = h.store.list_messages(&conversation.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert!(!messages[1].from_customer);
        assert_eq!(messages[1].body, "On its way");
        assert_eq!(messages[1].channel_origin, ChannelOrigin::Telegram);
        assert_eq!(messages[1].authored_by.as_deref(), Some("Marta"));
        assert_eq!(messages[1].status, MessageStatus::Delivered);
        assert_eq!(h.telegram.acknowledged.lock().await.len(), 1);

        // Mirrored to the other platform's staff, never back to Telegram.
        let wa = h.whatsapp.sent().await;
        assert_eq!(wa.len(), 2);
        assert!(wa[1].text.contains("On its way"));
        assert_eq!(h.telegram.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn reply_command_with_unknown_id_does_not_fall_through() {
        let h = harness();
        let conversation = web_customer_message(&h, "hello", true).await;

        let outcome = h
            .router
            .route(
                staff("/reply nope thanks", "tg-10")
                    .replying_to(Some("telegram-out-1".to_string()), None),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, RouteOutcome::Unresolved { .. }));
        assert_eq!(h.store.list_messages(&conversation.id).await.unwrap().len(), 1);

        let outcome = h
            .router
            .route(staff(&format!("/reply {} thanks", conversation.id), "tg-11"))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            RouteOutcome::Appended {
                resolution: Resolution::Command,
                ..
            }
        ));
        let messages = h.store.list_messages(&conversation.id).await.unwrap();
        assert_eq!(messages.last().unwrap().body, "thanks");
    }

    #[tokio::test]
    async fn quoted_text_is_the_fallback_when_reply_context_misses() {
        let h = harness();
        let conversation = web_customer_message(&h, "Where is my order 1234?", false).await;
        let quoted = "💬 New message from Guest via web chat\n\nWhere is my order 1234?";

        let outcome = h
            .router
            .route(
                staff("Shipped today", "tg-12")
                    .replying_to(Some("unknown-99".to_string()), Some(quoted.to_string())),
            )
            .await
            .unwrap();
        match outcome {
            RouteOutcome::Appended {
                conversation_id,
                resolution,
                ..
            } => {
                assert_eq!(conversation_id, conversation.id);
                assert_eq!(resolution, Resolution::QuotedText);
            }
            other => panic!("expected append, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn staff_message_without_context_is_unresolved() {
        let h = harness();
        web_customer_message(&h, "hello", true).await;
        let outcome = h.router.route(staff("good morning team", "tg-13")).await.unwrap();
        assert!(matches!(outcome, RouteOutcome::Unresolved { .. }));
        assert!(h.telegram.acknowledged.lock().await.is_empty());
    }

    #[tokio::test]
    async fn quick_reply_button_posts_canned_text() {
        let h = harness();
        let conversation = web_customer_message(&h, "hello", true).await;
        let canned = default_quick_replies();

        let outcome = h
            .router
            .route(staff("", "callback:77").with_callback(
                Some(format!("qr:{}:{}", canned[0].id, conversation.id)),
                Some("77".to_string()),
            ))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            RouteOutcome::Appended {
                resolution: Resolution::QuickReply,
                ..
            }
        ));
        let messages = h.store.list_messages(&conversation.id).await.unwrap();
        assert_eq!(messages.last().unwrap().body, canned[0].text);
        assert_eq!(h.telegram.acknowledged.lock().await.len(), 1);

        let stale = h
            .router
            .route(staff("", "callback:78").with_callback(
                Some(format!("qr:{}:gone", canned[0].id)),
                Some("78".to_string()),
            ))
            .await
            .unwrap();
        assert!(matches!(stale, RouteOutcome::Unresolved { .. }));
        assert_eq!(h.telegram.acknowledged.lock().await.len(), 2);
    }
}
