#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use chat_relay::{
    channels::{ChannelRegistry, InboundPayload, PlatformChannel, QuickReplyButton, SentMessage},
    config::RelayConfig,
    error::RelayError,
    store::MemoryConversationStore,
    types::Platform,
    ChatRelay,
};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct Sent {
    pub recipient: String,
    pub text: String,
    pub buttons: usize,
}

/// Platform adapter that keeps what it was asked to send.
pub struct FakePlatform {
    platform: Platform,
    staff: Vec<String>,
    counter: AtomicUsize,
    pub sent: Mutex<Vec<Sent>>,
    pub acknowledged: Mutex<Vec<String>>,
}

impl FakePlatform {
    pub fn new(platform: Platform, staff: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            platform,
            staff: staff.iter().map(|s| s.to_string()).collect(),
            counter: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            acknowledged: Mutex::new(Vec::new()),
        })
    }

    pub async fn sent(&self) -> Vec<Sent> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl PlatformChannel for FakePlatform {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn supports_quick_replies(&self) -> bool {
        self.platform == Platform::Telegram
    }

    fn staff_recipients(&self) -> Vec<String> {
        self.staff.clone()
    }

    async fn send(
        &self,
        recipient: &str,
        text: &str,
        quick_replies: &[QuickReplyButton],
    ) -> Result<SentMessage, RelayError> {
        self.sent.lock().await.push(Sent {
            recipient: recipient.to_string(),
            text: text.to_string(),
            buttons: quick_replies.len(),
        });
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(SentMessage {
            external_message_id: format!("{}-{n}", self.platform),
        })
    }

    async fn acknowledge(&self, payload: &InboundPayload) -> Result<(), RelayError> {
        self.acknowledged
            .lock()
            .await
            .push(payload.external_message_id.clone());
        Ok(())
    }
}

pub struct TestRelay {
    pub relay: ChatRelay,
    pub telegram: Arc<FakePlatform>,
    pub whatsapp: Arc<FakePlatform>,
}

pub const TELEGRAM_STAFF: &str = "-1001";
pub const WHATSAPP_STAFF: &str = "351900000001";

pub fn test_relay(config: RelayConfig) -> TestRelay {
    let telegram = FakePlatform::new(Platform::Telegram, &[TELEGRAM_STAFF]);
    let whatsapp = FakePlatform::new(Platform::WhatsApp, &[WHATSAPP_STAFF]);
    let channels = ChannelRegistry::new(vec![
        telegram.clone() as Arc<dyn PlatformChannel>,
        whatsapp.clone(),
    ]);
    let relay = ChatRelay::new(config, Arc::new(MemoryConversationStore::new()), channels);
    TestRelay {
        relay,
        telegram,
        whatsapp,
    }
}
