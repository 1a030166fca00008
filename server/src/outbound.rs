//! Fan-out of a persisted message to the channels that should see it.
//!
//! Sends run concurrently and are collected without short-circuiting. Only
//! primary targets decide the message status; mirrors are best effort.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use futures_util::future::join_all;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    channels::{quick_reply_payload, ChannelRegistry, PlatformChannel, QuickReplyButton},
    error::RelayError,
    realtime::RealtimeNotifier,
    store::ConversationStore,
    templates::{
        render_staff_mirror, render_staff_notification, StaffMirrorContext,
        StaffNotificationContext,
    },
    types::{
        format_timestamp, now_iso, ChannelOrigin, Conversation, DeliveryRole, Message,
        MessageDelivery, MessageStatus, QuickReply,
    },
};

const SWEEP_BATCH: usize = 100;

/// Result of one send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub channel: ChannelOrigin,
    pub recipient: String,
    pub role: DeliveryRole,
    pub external_ref: Option<String>,
    pub error: Option<String>,
}

impl DeliveryOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct RelayReport {
    /// The message as stored after the status update.
    pub message: Message,
    pub outcomes: Vec<DeliveryOutcome>,
}

impl RelayReport {
    pub fn primary(&self) -> impl Iterator<Item = &DeliveryOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.role == DeliveryRole::Primary)
    }
}

struct SendPlan {
    channel: Arc<dyn PlatformChannel>,
    recipient: String,
    role: DeliveryRole,
    text: String,
    buttons: Vec<QuickReplyButton>,
}

#[derive(Clone)]
pub struct OutboundDispatcher {
    store: Arc<dyn ConversationStore>,
    channels: ChannelRegistry,
    notifier: RealtimeNotifier,
    quick_replies: Vec<QuickReply>,
    timeout: Duration,
}

impl OutboundDispatcher {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        channels: ChannelRegistry,
        notifier: RealtimeNotifier,
        quick_replies: Vec<QuickReply>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            channels,
            notifier,
            quick_replies,
            timeout,
        }
    }

    fn buttons_for(&self, channel: &dyn PlatformChannel, conversation_id: &str) -> Vec<QuickReplyButton> {
        if !channel.supports_quick_replies() {
            return Vec::new();
        }
        self.quick_replies
            .iter()
            .map(|q| QuickReplyButton {
                label: q.label.clone(),
                payload: quick_reply_payload(&q.id, conversation_id),
            })
            .collect()
    }

    fn plan(&self, message: &Message, conversation: &Conversation) -> Vec<SendPlan> {
        let mut plans = Vec::new();

        if message.from_customer {
            let text = render_staff_notification(&StaffNotificationContext {
                conversation_id: &conversation.id,
                contact: &conversation.contact,
                channel: message.channel_origin,
                body: &message.body,
            });
            for channel in self.channels.all() {
                let buttons = self.buttons_for(channel.as_ref(), &conversation.id);
                for recipient in channel.staff_recipients() {
                    plans.push(SendPlan {
                        channel: channel.clone(),
                        recipient,
                        role: DeliveryRole::Primary,
                        text: text.clone(),
                        buttons: buttons.clone(),
                    });
                }
            }
            return plans;
        }

        if let Some(link) = &conversation.link {
            match self.channels.get(link.platform) {
                Some(channel) => plans.push(SendPlan {
                    channel,
                    recipient: link.channel_id.clone(),
                    role: DeliveryRole::Primary,
                    text: message.body.clone(),
                    buttons: Vec::new(),
                }),
                None => warn!(
                    conversation_id = %conversation.id,
                    platform = %link.platform,
                    "customer platform is not configured, reply stays in the store"
                ),
            }
        }

        let origin_platform = message.channel_origin.platform();
        let mirror = render_staff_mirror(&StaffMirrorContext {
            contact: &conversation.contact,
            author: message.authored_by.as_deref(),
            channel: message.channel_origin,
            body: &message.body,
        });
        for channel in self.channels.all() {
            if Some(channel.platform()) == origin_platform {
                continue;
            }
            for recipient in channel.staff_recipients() {
                plans.push(SendPlan {
                    channel: channel.clone(),
                    recipient,
                    role: DeliveryRole::Mirror,
                    text: mirror.clone(),
                    buttons: Vec::new(),
                });
            }
        }
        plans
    }

    async fn execute(&self, plan: SendPlan) -> DeliveryOutcome {
        let channel_origin = ChannelOrigin::from(plan.channel.platform());
        let attempt = tokio::time::timeout(
            self.timeout,
            plan.channel.send(&plan.recipient, &plan.text, &plan.buttons),
        )
        .await;
        let result = match attempt {
            Ok(result) => result,
            Err(_) => Err(RelayError::delivery(
                channel_origin,
                format!("timed out after {}s", self.timeout.as_secs()),
            )),
        };
        match result {
            Ok(sent) => DeliveryOutcome {
                channel: channel_origin,
                recipient: plan.recipient,
                role: plan.role,
                external_ref: Some(sent.external_message_id),
                error: None,
            },
            Err(err) => DeliveryOutcome {
                channel: channel_origin,
                recipient: plan.recipient,
                role: plan.role,
                external_ref: None,
                error: Some(err.to_string()),
            },
        }
    }

    /// Sends `message` to every target, records each attempt, and moves the
    /// message status according to the primary outcomes. Messages that are
    /// already terminal (inbound platform messages) keep their status.
    pub async fn relay(
        &self,
        message: &Message,
        conversation: &Conversation,
    ) -> Result<RelayReport, RelayError> {
        let plans = self.plan(message, conversation);
        let has_primary = plans.iter().any(|p| p.role == DeliveryRole::Primary);
        let outcomes = join_all(plans.into_iter().map(|plan| self.execute(plan))).await;

        for outcome in &outcomes {
            if let Some(error) = &outcome.error {
                match outcome.role {
                    DeliveryRole::Primary => warn!(
                        message_id = %message.id,
                        channel = %outcome.channel,
                        recipient = %outcome.recipient,
                        %error,
                        "primary delivery failed"
                    ),
                    DeliveryRole::Mirror => warn!(
                        message_id = %message.id,
                        channel = %outcome.channel,
                        recipient = %outcome.recipient,
                        %error,
                        "mirror delivery failed"
                    ),
                }
            }
            self.store
                .record_delivery(&MessageDelivery {
                    id: Uuid::new_v4().to_string(),
                    message_id: message.id.clone(),
                    conversation_id: message.conversation_id.clone(),
                    channel: outcome.channel,
                    recipient: outcome.recipient.clone(),
                    role: outcome.role,
                    external_ref: outcome.external_ref.clone(),
                    success: outcome.succeeded(),
                    error: outcome.error.clone(),
                    attempted_at: now_iso(),
                })
                .await
                .inspect_err(|e| error!(message_id = %message.id, error = %e, "failed to record delivery"))?;
        }

        if message.status.is_terminal() {
            return Ok(RelayReport {
                message: message.clone(),
                outcomes,
            });
        }

        let primary = outcomes
            .iter()
            .filter(|o| o.role == DeliveryRole::Primary)
            .collect::<Vec<_>>();
        let status = if !has_primary {
            // Web widget customers get staff replies over the realtime channel.
            MessageStatus::Delivered
        } else if primary.iter().any(|o| o.succeeded()) {
            MessageStatus::SentToPlatform
        } else {
            MessageStatus::Failed
        };
        let external_ref = primary.iter().find_map(|o| o.external_ref.as_deref());

        let updated = self
            .store
            .update_message_status(&message.id, status, external_ref)
            .await?;
        let family_ids = self.store.family_ids(&message.conversation_id).await?;
        self.notifier.message_status(&family_ids, &updated).await;
        debug!(message_id = %message.id, status = %updated.status, "relay finished");

        Ok(RelayReport {
            message: updated,
            outcomes,
        })
    }

    /// Re-drives messages left `queued` for longer than `stale_after`,
    /// typically after a crash between persisting and sending. Each message
    /// is claimed first, so instances sweeping at once never send it twice;
    /// a claim expires after another `stale_after`.
    pub async fn sweep_queued(&self, stale_after: Duration) -> Result<usize, RelayError> {
        let now = Utc::now();
        let cutoff =
            now - chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::zero());
        let queued = self
            .store
            .claim_queued(&format_timestamp(cutoff), &format_timestamp(now), SWEEP_BATCH)
            .await?;

        let mut relayed = 0;
        for message in queued {
            let Some(conversation) = self.store.get_conversation(&message.conversation_id).await?
            else {
                continue;
            };
            self.relay(&message, &conversation).await?;
            relayed += 1;
        }
        if relayed > 0 {
            info!(relayed, "retry sweep re-drove queued messages");
        }
        Ok(relayed)
    }
}
