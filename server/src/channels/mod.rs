//! External messaging platforms.
//!
//! Each adapter parses its webhook into an [`InboundPayload`] and exposes the
//! abstract send contract `send(channelId, text, quickReplies?)`.

pub mod telegram;
pub mod whatsapp;

use std::sync::Arc;

use async_trait::async_trait;

use crate::{config::RelayConfig, error::RelayError, types::Platform};

pub use telegram::TelegramChannel;
pub use whatsapp::WhatsAppChannel;

const QUICK_REPLY_PREFIX: &str = "qr:";

/// Normalised inbound webhook event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPayload {
    pub platform: Platform,
    pub text: String,
    pub external_message_id: String,
    pub reply_to_external_message_id: Option<String>,
    /// Text of the message being replied to, when the platform quotes it.
    pub quoted_text: Option<String>,
    pub sender_channel_id: String,
    pub sender_name: Option<String>,
    pub callback_data: Option<String>,
    /// Platform handle needed to answer a button press.
    pub callback_id: Option<String>,
}

impl InboundPayload {
    pub fn text(platform: Platform, sender: &str, external_id: &str, text: &str) -> Self {
        Self {
            platform,
            text: text.trim().to_string(),
            external_message_id: external_id.to_string(),
            reply_to_external_message_id: None,
            quoted_text: None,
            sender_channel_id: sender.to_string(),
            sender_name: None,
            callback_data: None,
            callback_id: None,
        }
    }

    pub fn replying_to(mut self, external_id: Option<String>, quoted: Option<String>) -> Self {
        self.reply_to_external_message_id = external_id.filter(|v| !v.trim().is_empty());
        self.quoted_text = quoted
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty());
        self
    }

    pub fn with_callback(mut self, data: Option<String>, callback_id: Option<String>) -> Self {
        self.callback_data = data.filter(|v| !v.trim().is_empty());
        self.callback_id = callback_id;
        self
    }

    pub fn with_sender_name(mut self, name: Option<String>) -> Self {
        self.sender_name = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        self
    }
}

/// Button attached to an outbound staff notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuickReplyButton {
    pub label: String,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub external_message_id: String,
}

pub fn quick_reply_payload(reply_id: &str, conversation_id: &str) -> String {
    format!("{QUICK_REPLY_PREFIX}{reply_id}:{conversation_id}")
}

/// Splits `qr:<replyId>:<conversationId>`.
pub fn parse_quick_reply_payload(data: &str) -> Option<(String, String)> {
    let rest = data.trim().strip_prefix(QUICK_REPLY_PREFIX)?;
    let (reply_id, conversation_id) = rest.split_once(':')?;
    if reply_id.is_empty() || conversation_id.is_empty() {
        return None;
    }
    Some((reply_id.to_string(), conversation_id.to_string()))
}

#[async_trait]
pub trait PlatformChannel: Send + Sync {
    fn platform(&self) -> Platform;

    fn supports_quick_replies(&self) -> bool;

    /// Chats that receive staff notifications on this platform.
    fn staff_recipients(&self) -> Vec<String>;

    fn is_staff_sender(&self, channel_id: &str) -> bool {
        self.staff_recipients().iter().any(|r| r == channel_id)
    }

    async fn send(
        &self,
        recipient: &str,
        text: &str,
        quick_replies: &[QuickReplyButton],
    ) -> Result<SentMessage, RelayError>;

    /// Tells the platform the inbound message was handled.
    async fn acknowledge(&self, payload: &InboundPayload) -> Result<(), RelayError>;
}

/// The platform adapters that are configured for this deployment.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    channels: Vec<Arc<dyn PlatformChannel>>,
}

impl ChannelRegistry {
    pub fn new(channels: Vec<Arc<dyn PlatformChannel>>) -> Self {
        Self { channels }
    }

    pub fn from_config(config: &RelayConfig, client: reqwest::Client) -> Self {
        let mut channels: Vec<Arc<dyn PlatformChannel>> = Vec::new();
        if let Some(telegram) = &config.telegram {
            channels.push(Arc::new(TelegramChannel::new(client.clone(), telegram.clone())));
        }
        if let Some(whatsapp) = &config.whatsapp {
            channels.push(Arc::new(WhatsAppChannel::new(client, whatsapp.clone())));
        }
        Self::new(channels)
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn PlatformChannel>> {
        self.channels
            .iter()
            .find(|c| c.platform() == platform)
            .cloned()
    }

    pub fn all(&self) -> &[Arc<dyn PlatformChannel>] {
        &self.channels
    }

    pub fn platforms(&self) -> Vec<Platform> {
        self.channels.iter().map(|c| c.platform()).collect()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quick_reply_payload_round_trips_conversation_ids_with_colons() {
        let data = quick_reply_payload("ack", "c-1");
        assert_eq!(data, "qr:ack:c-1");
        assert_eq!(
            parse_quick_reply_payload(&data),
            Some(("ack".to_string(), "c-1".to_string()))
        );
        assert_eq!(
            parse_quick_reply_payload("qr:later:urn:x"),
            Some(("later".to_string(), "urn:x".to_string()))
        );
        assert_eq!(parse_quick_reply_payload("qr::c-1"), None);
        assert_eq!(parse_quick_reply_payload("reply:ack:c-1"), None);
    }

    #[test]
    fn registry_only_holds_configured_platforms() {
        let registry = ChannelRegistry::from_config(&RelayConfig::default(), reqwest::Client::new());
        assert!(registry.all().is_empty());
        assert!(registry.get(Platform::Telegram).is_none());
    }
}
