//! Service configuration loaded from environment variables.
//!
//! Every setting has a default so the relay starts with zero configuration
//! for local development; platform adapters switch on only when their
//! credentials are present.

use std::{env, time::Duration};

use crate::{channels::whatsapp::normalize_whatsapp_phone, error::RelayError, types::QuickReply};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

/// Secrets checked on every inbound webhook request.
#[derive(Debug, Clone, Default)]
pub struct WebhookSecrets {
    /// Env: `TELEGRAM_WEBHOOK_SECRET`
    pub telegram_secret: Option<String>,
    /// Env: `WHATSAPP_VERIFY_TOKEN`
    pub whatsapp_verify_token: Option<String>,
    /// Env: `WHATSAPP_APP_SECRET`
    pub whatsapp_app_secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Chat (group or private) where staff receive notifications and reply.
    pub staff_chat_id: String,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    pub access_token: String,
    pub phone_number_id: String,
    /// Digits-only numbers of staff members who receive notifications.
    pub staff_numbers: Vec<String>,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Env: `PORT`, default `4000`.
    pub port: u16,
    /// Env: `STORE_BACKEND` (`postgres` | `memory`), default `postgres`.
    pub store_backend: StoreBackend,
    pub database_url: String,
    /// Env: `ADMIN_TOKEN`. Admin routes are open when unset.
    pub admin_token: Option<String>,
    /// Env: `IDENTITY_SECRET`. Key the host application signs `userToken`s
    /// with; without it the widget only accepts anonymous sessions.
    pub identity_secret: Option<String>,
    /// Env: `IDENTITY_SERVICE_TOKEN`. Bearer token for server-to-server
    /// identity merges.
    pub service_token: Option<String>,
    pub telegram: Option<TelegramConfig>,
    pub whatsapp: Option<WhatsAppConfig>,
    pub webhook_secrets: WebhookSecrets,
    /// Env: `PRESENCE_HEARTBEAT_SECS`, default 15. Leases expire after twice this.
    pub presence_heartbeat: Duration,
    /// Env: `OUTBOUND_TIMEOUT_SECS`, default 5.
    pub outbound_timeout: Duration,
    /// Env: `RETRY_SWEEP_SECS`, default 60, `0` disables the sweep.
    pub retry_sweep_interval: Option<Duration>,
    /// Env: `QUICK_REPLIES` (JSON array of `{id,label,text}`).
    pub quick_replies: Vec<QuickReply>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 4000,
            store_backend: StoreBackend::Memory,
            database_url: String::new(),
            admin_token: None,
            identity_secret: None,
            service_token: None,
            telegram: None,
            whatsapp: None,
            webhook_secrets: WebhookSecrets::default(),
            presence_heartbeat: Duration::from_secs(15),
            outbound_timeout: Duration::from_secs(5),
            retry_sweep_interval: None,
            quick_replies: default_quick_replies(),
        }
    }
}

pub fn default_quick_replies() -> Vec<QuickReply> {
    [
        (
            "ack",
            "On it",
            "Thanks for reaching out! A member of our team is looking into this now.",
        ),
        (
            "later",
            "Back soon",
            "Thanks for your message. We're away right now and will reply as soon as we're back.",
        ),
        (
            "order",
            "Order number?",
            "Could you share your order number so we can check on it for you?",
        ),
    ]
    .into_iter()
    .map(|(id, label, text)| QuickReply {
        id: id.to_string(),
        label: label.to_string(),
        text: text.to_string(),
    })
    .collect()
}

impl RelayConfig {
    /// Age after which the retry sweep takes over a `queued` message. Well
    /// past the send timeout so a relay still in flight keeps it.
    pub fn retry_stale_after(&self) -> Duration {
        (self.outbound_timeout * 6).max(Duration::from_secs(60))
    }

    pub fn from_env() -> Result<Self, RelayError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, RelayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let secs = |key: &str, default: u64| {
            get(key)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(default)
        };

        let store_backend = match get("STORE_BACKEND").as_deref() {
            None | Some("postgres") | Some("pg") => StoreBackend::Postgres,
            Some("memory") => StoreBackend::Memory,
            Some(other) => {
                return Err(RelayError::Validation(format!(
                    "STORE_BACKEND must be 'postgres' or 'memory', got '{other}'"
                )))
            }
        };

        let telegram = match (get("TELEGRAM_BOT_TOKEN"), get("TELEGRAM_STAFF_CHAT_ID")) {
            (Some(bot_token), Some(staff_chat_id)) => Some(TelegramConfig {
                bot_token,
                staff_chat_id,
                api_base: get("TELEGRAM_API_BASE")
                    .unwrap_or_else(|| "https://api.telegram.org".to_string())
                    .trim_end_matches('/')
                    .to_string(),
            }),
            _ => None,
        };

        let whatsapp = match (get("WHATSAPP_ACCESS_TOKEN"), get("WHATSAPP_PHONE_NUMBER_ID")) {
            (Some(access_token), Some(phone_number_id)) => Some(WhatsAppConfig {
                access_token,
                phone_number_id,
                staff_numbers: get("WHATSAPP_STAFF_NUMBERS")
                    .unwrap_or_default()
                    .split(',')
                    .filter_map(normalize_whatsapp_phone)
                    .collect(),
                api_base: get("WHATSAPP_API_BASE")
                    .unwrap_or_else(|| "https://graph.facebook.com/v21.0".to_string())
                    .trim_end_matches('/')
                    .to_string(),
            }),
            _ => None,
        };

        let quick_replies = match get("QUICK_REPLIES") {
            Some(raw) => serde_json::from_str::<Vec<QuickReply>>(&raw)
                .map_err(|e| RelayError::Validation(format!("QUICK_REPLIES is not valid: {e}")))?,
            None => default_quick_replies(),
        };

        let sweep = secs("RETRY_SWEEP_SECS", 60);

        Ok(Self {
            port: get("PORT")
                .and_then(|v| v.parse::<u16>().ok())
                .unwrap_or(4000),
            store_backend,
            database_url: resolve_database_url(&get),
            admin_token: get("ADMIN_TOKEN"),
            identity_secret: get("IDENTITY_SECRET"),
            service_token: get("IDENTITY_SERVICE_TOKEN"),
            telegram,
            whatsapp,
            webhook_secrets: WebhookSecrets {
                telegram_secret: get("TELEGRAM_WEBHOOK_SECRET"),
                whatsapp_verify_token: get("WHATSAPP_VERIFY_TOKEN"),
                whatsapp_app_secret: get("WHATSAPP_APP_SECRET"),
            },
            presence_heartbeat: Duration::from_secs(secs("PRESENCE_HEARTBEAT_SECS", 15).max(1)),
            outbound_timeout: Duration::from_secs(secs("OUTBOUND_TIMEOUT_SECS", 5).max(1)),
            retry_sweep_interval: (sweep > 0).then(|| Duration::from_secs(sweep)),
            quick_replies,
        })
    }
}

fn resolve_database_url(get: &dyn Fn(&str) -> Option<String>) -> String {
    if let Some(url) = get("DATABASE_URL") {
        return url;
    }
    let pick = |primary: &str, fallback: &str, default: &str| {
        get(primary)
            .or_else(|| get(fallback))
            .unwrap_or_else(|| default.to_string())
    };
    let host = pick("POSTGRES_HOST", "PGHOST", "localhost");
    let port = pick("POSTGRES_PORT", "PGPORT", "5432");
    let user = pick("POSTGRES_USER", "PGUSER", "postgres");
    let password = pick("POSTGRES_PASSWORD", "PGPASSWORD", "postgres");
    let db = pick("POSTGRES_DB", "PGDATABASE", "chat_relay");
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}
