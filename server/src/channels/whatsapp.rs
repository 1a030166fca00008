use std::collections::HashMap;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::debug;

use super::{InboundPayload, PlatformChannel, QuickReplyButton, SentMessage};
use crate::{
    config::WhatsAppConfig,
    error::RelayError,
    types::{ChannelOrigin, Platform},
};

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const MAX_REPLY_BUTTONS: usize = 3;
const MAX_BUTTON_TITLE_CHARS: usize = 20;
const MAX_INTERACTIVE_BODY_CHARS: usize = 1024;

pub fn normalize_whatsapp_phone(raw: &str) -> Option<String> {
    let digits = raw
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

pub fn verify_whatsapp_signature(
    app_secret: &str,
    signature_header: Option<&str>,
    body: &[u8],
) -> bool {
    if app_secret.is_empty() {
        return true;
    }
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature
        .strip_prefix("sha256=")
        .unwrap_or(signature)
        .trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

/// Subscription handshake. Returns the challenge to echo when the verify
/// token matches; a missing configured token refuses every handshake.
pub fn verify_subscription(
    params: &HashMap<String, String>,
    expected_verify_token: Option<&str>,
) -> Option<String> {
    let expected = expected_verify_token.filter(|t| !t.is_empty())?;
    let mode = params.get("hub.mode").map(String::as_str).unwrap_or("");
    let verify_token = params
        .get("hub.verify_token")
        .map(String::as_str)
        .unwrap_or("");
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();
    (mode == "subscribe" && !challenge.is_empty() && verify_token == expected).then_some(challenge)
}

fn contact_profile_names(value: &Value) -> HashMap<String, String> {
    let contacts = value
        .get("contacts")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut map = HashMap::new();
    for contact in contacts {
        let wa_id = contact
            .get("wa_id")
            .and_then(Value::as_str)
            .or_else(|| contact.get("input").and_then(Value::as_str))
            .unwrap_or("");
        let Some(digits) = normalize_whatsapp_phone(wa_id) else {
            continue;
        };
        let name = contact
            .get("profile")
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        map.insert(digits, name);
    }
    map
}

/// Text and button payload of one inbound message. Media without a caption
/// and unsupported types yield `None`.
fn inbound_content(message: &Value) -> Option<(String, Option<String>)> {
    let msg_type = message
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_ascii_lowercase();
    let text_at = |pointer: &str| {
        message
            .pointer(pointer)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    };

    match msg_type.as_str() {
        "text" => Some((text_at("/text/body")?, None)),
        "button" => {
            let payload = text_at("/button/payload");
            Some((text_at("/button/text").unwrap_or_default(), payload))
        }
        "interactive" => {
            let (title, id) = match text_at("/interactive/button_reply/id") {
                Some(id) => (text_at("/interactive/button_reply/title"), Some(id)),
                None => (
                    text_at("/interactive/list_reply/title"),
                    text_at("/interactive/list_reply/id"),
                ),
            };
            if title.is_none() && id.is_none() {
                return None;
            }
            Some((title.unwrap_or_default(), id))
        }
        "image" | "video" | "document" => {
            let caption = text_at(&format!("/{msg_type}/caption"))?;
            Some((caption, None))
        }
        _ => None,
    }
}

/// Flattens a webhook body into one payload per inbound message, skipping
/// changes addressed to another phone number id.
pub fn parse_webhook(payload: &Value, expected_phone_number_id: Option<&str>) -> Vec<InboundPayload> {
    let mut out = Vec::new();
    let entries = payload
        .get("entry")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for entry in entries {
        let changes = entry
            .get("changes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for change in changes {
            let value = change.get("value").cloned().unwrap_or_else(|| json!({}));
            let metadata_phone_id = value
                .pointer("/metadata/phone_number_id")
                .and_then(Value::as_str)
                .unwrap_or("");
            if let Some(expected) = expected_phone_number_id {
                if !metadata_phone_id.is_empty() && expected != metadata_phone_id {
                    continue;
                }
            }
            let profile_names = contact_profile_names(&value);
            let messages = value
                .get("messages")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            for message in messages {
                let Some(from) = message
                    .get("from")
                    .and_then(Value::as_str)
                    .and_then(normalize_whatsapp_phone)
                else {
                    continue;
                };
                let Some(id) = message.get("id").and_then(Value::as_str) else {
                    continue;
                };
                let Some((text, button_payload)) = inbound_content(&message) else {
                    continue;
                };
                let reply_to = message
                    .pointer("/context/id")
                    .and_then(Value::as_str)
                    .map(str::to_string);

                out.push(
                    InboundPayload::text(Platform::WhatsApp, &from, id, &text)
                        .replying_to(reply_to, None)
                        .with_callback(button_payload, None)
                        .with_sender_name(profile_names.get(&from).cloned()),
                );
            }
        }
    }
    out
}

fn clip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let clipped = text.chars().take(max.saturating_sub(1)).collect::<String>();
    format!("{}…", clipped.trim_end())
}

pub struct WhatsAppChannel {
    client: reqwest::Client,
    config: WhatsAppConfig,
}

impl WhatsAppChannel {
    pub fn new(client: reqwest::Client, config: WhatsAppConfig) -> Self {
        Self { client, config }
    }

    async fn post_messages(&self, payload: &Value) -> Result<Value, RelayError> {
        let response = self
            .client
            .post(format!(
                "{}/{}/messages",
                self.config.api_base, self.config.phone_number_id
            ))
            .bearer_auth(&self.config.access_token)
            .json(payload)
            .send()
            .await
            .map_err(|e| RelayError::delivery(ChannelOrigin::WhatsApp, e.to_string()))?;

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();
        let body = serde_json::from_str::<Value>(&raw_body)
            .unwrap_or_else(|_| json!({ "raw": raw_body }));
        if status.is_success() {
            return Ok(body);
        }
        let reason = body
            .pointer("/error/message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("graph api returned {status}"));
        Err(RelayError::delivery(ChannelOrigin::WhatsApp, reason))
    }
}

fn message_payload(to: &str, text: &str, quick_replies: &[QuickReplyButton]) -> Value {
    let mut payload = json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
    });
    if quick_replies.is_empty() {
        payload["type"] = json!("text");
        payload["text"] = json!({ "preview_url": false, "body": text });
        return payload;
    }

    let buttons = quick_replies
        .iter()
        .take(MAX_REPLY_BUTTONS)
        .map(|b| {
            json!({
                "type": "reply",
                "reply": { "id": b.payload, "title": clip(&b.label, MAX_BUTTON_TITLE_CHARS) }
            })
        })
        .collect::<Vec<_>>();
    payload["type"] = json!("interactive");
    payload["interactive"] = json!({
        "type": "button",
        "body": { "text": clip(text, MAX_INTERACTIVE_BODY_CHARS) },
        "action": { "buttons": buttons },
    });
    payload
}

#[async_trait]
impl PlatformChannel for WhatsAppChannel {
    fn platform(&self) -> Platform {
        Platform::WhatsApp
    }

    fn supports_quick_replies(&self) -> bool {
        true
    }

    fn staff_recipients(&self) -> Vec<String> {
        self.config.staff_numbers.clone()
    }

    fn is_staff_sender(&self, channel_id: &str) -> bool {
        let Some(digits) = normalize_whatsapp_phone(channel_id) else {
            return false;
        };
        self.config.staff_numbers.iter().any(|n| *n == digits)
    }

    async fn send(
        &self,
        recipient: &str,
        text: &str,
        quick_replies: &[QuickReplyButton],
    ) -> Result<SentMessage, RelayError> {
        let to = normalize_whatsapp_phone(recipient).ok_or_else(|| {
            RelayError::delivery(ChannelOrigin::WhatsApp, format!("invalid recipient '{recipient}'"))
        })?;
        let body = self
            .post_messages(&message_payload(&to, text, quick_replies))
            .await?;
        let id = body
            .pointer("/messages/0/id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                RelayError::delivery(ChannelOrigin::WhatsApp, "graph api returned no message id")
            })?;
        debug!(recipient = %to, message_id = id, "whatsapp message sent");
        Ok(SentMessage {
            external_message_id: id.to_string(),
        })
    }

    async fn acknowledge(&self, payload: &InboundPayload) -> Result<(), RelayError> {
        self.post_messages(&json!({
            "messaging_product": "whatsapp",
            "status": "read",
            "message_id": payload.external_message_id,
        }))
        .await?;
        Ok(())
    }
}
