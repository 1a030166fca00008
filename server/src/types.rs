use std::{cmp::Ordering, fmt, str::FromStr};

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Fixed-precision RFC 3339 so that string order equals time order.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now_iso() -> String {
    format_timestamp(Utc::now())
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Timestamp for a message appended after `previous`. Always strictly later
/// than `previous`, even if the wall clock stalled or stepped backwards.
pub fn next_message_timestamp(previous: Option<&str>, now: DateTime<Utc>) -> String {
    let floor = previous
        .and_then(parse_timestamp)
        .map(|prev| prev + ChronoDuration::microseconds(1));
    match floor {
        Some(floor) if floor > now => format_timestamp(floor),
        _ => format_timestamp(now),
    }
}

macro_rules! string_enum {
    ($name:ident, $label:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = RelayError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(RelayError::Validation(format!(
                        "unknown {} '{}'",
                        $label, other
                    ))),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Open,
    Waiting,
    Closed,
}

string_enum!(ConversationStatus, "conversation status" {
    Open => "open",
    Waiting => "waiting",
    Closed => "closed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Queued,
    SentToPlatform,
    Delivered,
    Failed,
}

string_enum!(MessageStatus, "message status" {
    Queued => "queued",
    SentToPlatform => "sent_to_platform",
    Delivered => "delivered",
    Failed => "failed",
});

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }
}

/// Surface that produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelOrigin {
    Web,
    Telegram,
    #[serde(rename = "whatsapp")]
    WhatsApp,
    AdminConsole,
}

string_enum!(ChannelOrigin, "channel" {
    Web => "web",
    Telegram => "telegram",
    WhatsApp => "whatsapp",
    AdminConsole => "admin_console",
});

impl ChannelOrigin {
    pub fn platform(&self) -> Option<Platform> {
        match self {
            Self::Telegram => Some(Platform::Telegram),
            Self::WhatsApp => Some(Platform::WhatsApp),
            Self::Web | Self::AdminConsole => None,
        }
    }
}

/// External messaging platform with a webhook and a send API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Telegram,
    #[serde(rename = "whatsapp")]
    WhatsApp,
}

string_enum!(Platform, "platform" {
    Telegram => "telegram",
    WhatsApp => "whatsapp",
});

impl From<Platform> for ChannelOrigin {
    fn from(platform: Platform) -> Self {
        match platform {
            Platform::Telegram => ChannelOrigin::Telegram,
            Platform::WhatsApp => ChannelOrigin::WhatsApp,
        }
    }
}

impl Platform {
    /// Identity key used for customers who write in through this platform.
    pub fn customer_session_id(&self, channel_id: &str) -> String {
        format!("{}:{}", self.as_str(), channel_id.trim())
    }
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl Contact {
    pub fn normalized(self) -> Self {
        Self {
            name: clean(self.name),
            phone: clean(self.phone),
            email: clean(self.email).map(|e| e.to_ascii_lowercase()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.phone.is_none() && self.email.is_none()
    }

    /// Takes every non-empty field of `fresher`. Empty fields never clobber
    /// populated ones. Returns whether anything changed.
    pub fn enrich(&mut self, fresher: &Contact) -> bool {
        let fresher = fresher.clone().normalized();
        let mut changed = false;
        for (slot, value) in [
            (&mut self.name, fresher.name),
            (&mut self.phone, fresher.phone),
            (&mut self.email, fresher.email),
        ] {
            if let Some(value) = value {
                if slot.as_deref() != Some(value.as_str()) {
                    *slot = Some(value);
                    changed = true;
                }
            }
        }
        changed
    }

    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.email.as_deref())
            .or(self.phone.as_deref())
            .unwrap_or("Guest")
    }
}

/// Platform chat a customer conversation is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformLink {
    pub platform: Platform,
    pub channel_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewer {
    pub admin_id: String,
    #[serde(default)]
    pub admin_name: Option<String>,
    pub viewing_since: String,
    pub last_heartbeat: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub contact: Contact,
    pub status: ConversationStatus,
    pub needs_response: bool,
    pub unread_count: u32,
    pub last_message_at: Option<String>,
    pub last_customer_message_at: Option<String>,
    pub link: Option<PlatformLink>,
    pub viewer: Option<Viewer>,
    pub deleted_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Conversation {
    /// Owning identity; the user id wins once the conversation was merged.
    pub fn owner(&self) -> Option<IdentityKey> {
        self.user_id
            .clone()
            .map(IdentityKey::User)
            .or_else(|| self.session_id.clone().map(IdentityKey::Session))
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Whether `other` belongs to the same merged history as `self`.
    pub fn same_family(&self, other: &Conversation) -> bool {
        if self.id == other.id {
            return true;
        }
        if other.is_deleted() {
            return false;
        }
        match self.owner() {
            Some(IdentityKey::User(user_id)) => other.user_id.as_deref() == Some(user_id.as_str()),
            Some(IdentityKey::Session(session_id)) => {
                other.user_id.is_none() && other.session_id.as_deref() == Some(session_id.as_str())
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub body: String,
    pub from_customer: bool,
    pub channel_origin: ChannelOrigin,
    pub external_ref: Option<String>,
    pub status: MessageStatus,
    pub authored_by: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryRole {
    /// Counts toward the message status.
    Primary,
    /// Best-effort copy; never reflected in the message status.
    Mirror,
}

string_enum!(DeliveryRole, "delivery role" {
    Primary => "primary",
    Mirror => "mirror",
});

/// One send attempt of a message to one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDelivery {
    pub id: String,
    pub message_id: String,
    pub conversation_id: String,
    pub channel: ChannelOrigin,
    pub recipient: String,
    pub role: DeliveryRole,
    pub external_ref: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub attempted_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdentityKey {
    Session(String),
    User(String),
}

impl IdentityKey {
    pub fn lock_key(&self) -> String {
        match self {
            Self::Session(id) => format!("session:{id}"),
            Self::User(id) => format!("user:{id}"),
        }
    }
}

/// Identity handed over by the authentication collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentIdentity {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub profile: Option<Contact>,
}

impl CurrentIdentity {
    pub fn anonymous(session_id: &str) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            ..Self::default()
        }
    }

    pub fn authenticated(user_id: &str, session_id: Option<&str>, profile: Contact) -> Self {
        Self {
            session_id: session_id.map(str::to_string),
            user_id: Some(user_id.to_string()),
            profile: Some(profile),
        }
    }

    pub fn normalized(self) -> Self {
        Self {
            session_id: clean(self.session_id),
            user_id: clean(self.user_id),
            profile: self.profile.map(Contact::normalized),
        }
    }

    pub fn key(&self) -> Result<IdentityKey, RelayError> {
        let identity = self.clone().normalized();
        identity
            .user_id
            .map(IdentityKey::User)
            .or_else(|| identity.session_id.map(IdentityKey::Session))
            .ok_or_else(|| RelayError::Validation("sessionId or userId is required".to_string()))
    }

    /// Session and user pair that still needs folding together.
    pub fn pending_merge(&self) -> Option<(String, String)> {
        let identity = self.clone().normalized();
        Some((identity.session_id?, identity.user_id?))
    }
}

#[derive(Debug, Clone)]
pub struct NewConversation {
    pub owner: IdentityKey,
    pub session_id: Option<String>,
    pub contact: Contact,
    pub link: Option<PlatformLink>,
}

impl NewConversation {
    pub fn for_identity(identity: &CurrentIdentity) -> Result<Self, RelayError> {
        let identity = identity.clone().normalized();
        Ok(Self {
            owner: identity.key()?,
            session_id: identity.session_id.clone(),
            contact: identity.profile.clone().unwrap_or_default(),
            link: None,
        })
    }

    pub fn for_platform_customer(platform: Platform, channel_id: &str, contact: Contact) -> Self {
        let session_id = platform.customer_session_id(channel_id);
        Self {
            owner: IdentityKey::Session(session_id.clone()),
            session_id: Some(session_id),
            contact: contact.normalized(),
            link: Some(PlatformLink {
                platform,
                channel_id: channel_id.trim().to_string(),
            }),
        }
    }

    pub fn with_contact(mut self, contact: Contact) -> Self {
        self.contact.enrich(&contact);
        self
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub body: String,
    pub from_customer: bool,
    pub channel_origin: ChannelOrigin,
    pub external_ref: Option<String>,
    pub status: MessageStatus,
    pub authored_by: Option<String>,
}

impl NewMessage {
    pub fn customer(conversation_id: &str, body: &str, origin: ChannelOrigin) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            body: body.to_string(),
            from_customer: true,
            channel_origin: origin,
            external_ref: None,
            status: MessageStatus::Queued,
            authored_by: None,
        }
    }

    pub fn staff(conversation_id: &str, body: &str, origin: ChannelOrigin) -> Self {
        Self {
            from_customer: false,
            ..Self::customer(conversation_id, body, origin)
        }
    }

    pub fn external_ref(mut self, external_ref: Option<String>) -> Self {
        self.external_ref = clean(external_ref);
        self
    }

    pub fn status(mut self, status: MessageStatus) -> Self {
        self.status = status;
        self
    }

    pub fn authored_by(mut self, author: Option<String>) -> Self {
        self.authored_by = clean(author);
        self
    }
}

/// Result of an append. `duplicate` is set when the external ref had already
/// been stored for this conversation and nothing was written.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub message: Message,
    pub conversation: Conversation,
    pub family_ids: Vec<String>,
    pub duplicate: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationFilter {
    #[serde(default)]
    pub status: Option<ConversationStatus>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub include_deleted: bool,
}

impl ConversationFilter {
    pub fn search_term(&self) -> Option<String> {
        clean(self.search.clone()).map(|s| s.to_lowercase())
    }
}

/// Admin listing order: conversations waiting on staff first, then by the
/// latest customer message (not the latest message overall).
pub fn listing_order(a: &Conversation, b: &Conversation) -> Ordering {
    b.needs_response
        .cmp(&a.needs_response)
        .then_with(|| {
            desc_nulls_last(
                a.last_customer_message_at.as_deref(),
                b.last_customer_message_at.as_deref(),
            )
        })
        .then_with(|| desc_nulls_last(a.last_message_at.as_deref(), b.last_message_at.as_deref()))
        .then_with(|| b.created_at.cmp(&a.created_at))
}

fn desc_nulls_last(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.cmp(a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickReply {
    pub id: String,
    pub label: String,
    pub text: String,
}
