use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{InboundPayload, PlatformChannel, QuickReplyButton, SentMessage};
use crate::{config::TelegramConfig, error::RelayError, types::{ChannelOrigin, Platform}};

pub const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

/// Telegram Update object (the fields the relay reads).
#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    pub message: Option<TelegramMessage>,
    pub callback_query: Option<TelegramCallbackQuery>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub chat: TelegramChat,
    pub from: Option<TelegramUser>,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub reply_to_message: Option<Box<TelegramMessage>>,
    /// Part of the replied-to message the user explicitly quoted.
    pub quote: Option<TelegramTextQuote>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramTextQuote {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    pub title: Option<String>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    pub first_name: String,
    pub last_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramCallbackQuery {
    pub id: String,
    pub from: TelegramUser,
    pub message: Option<TelegramMessage>,
    pub data: Option<String>,
}

impl TelegramUser {
    fn full_name(&self) -> String {
        match &self.last_name {
            Some(last) => format!("{} {}", self.first_name, last),
            None => self.first_name.clone(),
        }
    }
}

impl TelegramMessage {
    fn body(&self) -> Option<&str> {
        self.text
            .as_deref()
            .or(self.caption.as_deref())
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    fn sender_name(&self) -> Option<String> {
        self.from.as_ref().map(TelegramUser::full_name).or_else(|| {
            let chat = &self.chat;
            match (&chat.first_name, &chat.last_name) {
                (Some(first), Some(last)) => Some(format!("{first} {last}")),
                (Some(first), None) => Some(first.clone()),
                _ => chat.title.clone().or_else(|| chat.username.clone()),
            }
        })
    }
}

/// Telegram message ids are only unique within a chat, so stored refs carry
/// both: `<chat id>:<message id>`.
pub fn message_ref(chat_id: impl std::fmt::Display, message_id: i64) -> String {
    format!("{chat_id}:{message_id}")
}

fn split_message_ref(value: &str) -> Option<(&str, i64)> {
    let (chat, message) = value.rsplit_once(':')?;
    Some((chat, message.parse().ok()?))
}

/// Normalises an update. Returns `None` for updates the relay ignores
/// (edits, joins, media without caption, messages from bots).
pub fn parse_update(update: TelegramUpdate) -> Option<InboundPayload> {
    if let Some(query) = update.callback_query {
        let message = query.message?;
        let data = query.data.filter(|d| !d.trim().is_empty())?;
        return Some(
            InboundPayload::text(
                Platform::Telegram,
                &message.chat.id.to_string(),
                &format!("callback:{}", query.id),
                "",
            )
            .replying_to(Some(message_ref(message.chat.id, message.message_id)), None)
            .with_callback(Some(data), Some(query.id))
            .with_sender_name(Some(query.from.full_name())),
        );
    }

    let message = update.message?;
    if message.from.as_ref().is_some_and(|u| u.is_bot) {
        return None;
    }
    let body = message.body()?;
    let reply = message.reply_to_message.as_deref();
    let quoted = message
        .quote
        .as_ref()
        .map(|q| q.text.clone())
        .or_else(|| reply.and_then(|r| r.body().map(str::to_string)));

    Some(
        InboundPayload::text(
            Platform::Telegram,
            &message.chat.id.to_string(),
            &message_ref(message.chat.id, message.message_id),
            body,
        )
        .replying_to(reply.map(|r| message_ref(r.chat.id, r.message_id)), quoted)
        .with_sender_name(message.sender_name()),
    )
}

/// Checks `X-Telegram-Bot-Api-Secret-Token` when a secret is configured.
pub fn verify_secret(expected: Option<&str>, header: Option<&str>) -> bool {
    match expected.filter(|s| !s.is_empty()) {
        None => true,
        Some(expected) => header.map(str::trim) == Some(expected),
    }
}

pub struct TelegramChannel {
    client: reqwest::Client,
    config: TelegramConfig,
}

impl TelegramChannel {
    pub fn new(client: reqwest::Client, config: TelegramConfig) -> Self {
        Self { client, config }
    }

    async fn call(&self, method: &str, payload: Value) -> Result<Value, RelayError> {
        let url = format!("{}/bot{}/{}", self.config.api_base, self.config.bot_token, method);
        let response = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| RelayError::delivery(ChannelOrigin::Telegram, e.to_string()))?;

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();
        let body = serde_json::from_str::<Value>(&raw_body)
            .unwrap_or_else(|_| json!({ "raw": raw_body }));

        if status.is_success() && body.get("ok").and_then(Value::as_bool) == Some(true) {
            return Ok(body.get("result").cloned().unwrap_or(Value::Null));
        }
        let reason = body
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{method} returned {status}"));
        Err(RelayError::delivery(ChannelOrigin::Telegram, reason))
    }
}

fn inline_keyboard(buttons: &[QuickReplyButton]) -> Value {
    let rows = buttons
        .iter()
        .map(|b| json!([{ "text": b.label, "callback_data": b.payload }]))
        .collect::<Vec<_>>();
    json!({ "inline_keyboard": rows })
}

#[async_trait]
impl PlatformChannel for TelegramChannel {
    fn platform(&self) -> Platform {
        Platform::Telegram
    }

    fn supports_quick_replies(&self) -> bool {
        true
    }

    fn staff_recipients(&self) -> Vec<String> {
        vec![self.config.staff_chat_id.clone()]
    }

    async fn send(
        &self,
        recipient: &str,
        text: &str,
        quick_replies: &[QuickReplyButton],
    ) -> Result<SentMessage, RelayError> {
        let mut payload = json!({ "chat_id": recipient, "text": text });
        if !quick_replies.is_empty() {
            payload["reply_markup"] = inline_keyboard(quick_replies);
        }
        let result = self.call("sendMessage", payload).await?;
        let message_id = result
            .get("message_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                RelayError::delivery(ChannelOrigin::Telegram, "sendMessage returned no message_id")
            })?;
        debug!(recipient, message_id, "telegram message sent");
        Ok(SentMessage {
            external_message_id: message_ref(recipient, message_id),
        })
    }

    async fn acknowledge(&self, payload: &InboundPayload) -> Result<(), RelayError> {
        if let Some(callback_id) = &payload.callback_id {
            self.call(
                "answerCallbackQuery",
                json!({ "callback_query_id": callback_id, "text": "Reply sent" }),
            )
            .await?;
            return Ok(());
        }
        let Some((chat_id, message_id)) = split_message_ref(&payload.external_message_id) else {
            return Ok(());
        };
        self.call(
            "setMessageReaction",
            json!({
                "chat_id": chat_id,
                "message_id": message_id,
                "reaction": [{ "type": "emoji", "emoji": "👍" }],
            }),
        )
        .await?;
        Ok(())
    }
}
