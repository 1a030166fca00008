mod common;

use chat_relay::{
    channels::InboundPayload,
    config::RelayConfig,
    inbound::{Resolution, RouteOutcome},
    types::{ChannelOrigin, Contact, ConversationStatus, CurrentIdentity, MessageStatus, Platform},
};
use common::{test_relay, TELEGRAM_STAFF, WHATSAPP_STAFF};
use serde_json::Value;
use tokio::sync::mpsc;

fn guest(session: &str) -> CurrentIdentity {
    CurrentIdentity::anonymous(session)
}

#[tokio::test]
async fn unread_state_follows_who_spoke_last() {
    let t = test_relay(RelayConfig::default());
    for body in ["hi", "anyone there?"] {
        let posted = t.relay.post_customer_message(&guest("abc"), body).await.unwrap();
        posted.relay.await.unwrap();
    }
    let id = t
        .relay
        .widget_history(&guest("abc"))
        .await
        .unwrap()
        .unwrap()
        .conversation
        .id;

    let before = t.relay.conversation_history(&id).await.unwrap().conversation;
    assert!(before.needs_response);
    assert_eq!(before.unread_count, 2);

    let reply = t.relay.post_staff_reply(&id, "yes!", Some("Marta".into())).await.unwrap();
    assert!(!reply.conversation.needs_response);
    assert_eq!(reply.conversation.unread_count, 0);
    reply.relay.await.unwrap();

    // A web customer hears back over the websocket, so nothing primary failed.
    let history = t.relay.conversation_history(&id).await.unwrap();
    assert_eq!(history.messages.last().unwrap().status, MessageStatus::Delivered);
}

#[tokio::test]
async fn messages_are_ordered_and_last_message_at_tracks_the_newest() {
    let t = test_relay(RelayConfig::default());
    let mut handles = Vec::new();
    for i in 0..10 {
        let relay = t.relay.clone();
        handles.push(tokio::spawn(async move {
            relay
                .post_customer_message(&CurrentIdentity::anonymous("abc"), &format!("message {i}"))
                .await
                .map(|p| p.conversation.id)
        }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1, "concurrent first messages share one conversation");

    let history = t.relay.conversation_history(&ids[0]).await.unwrap();
    assert_eq!(history.messages.len(), 10);
    assert!(history
        .messages
        .windows(2)
        .all(|w| w[0].created_at <= w[1].created_at));
    assert_eq!(
        history.conversation.last_message_at.as_deref(),
        history.messages.iter().map(|m| m.created_at.as_str()).max()
    );
}

#[tokio::test]
async fn guest_history_follows_the_customer_after_login() {
    let t = test_relay(RelayConfig::default());
    for body in ["hi", "anyone there?", "hello?"] {
        t.relay.post_customer_message(&guest("abc"), body).await.unwrap();
    }

    let profile = Contact {
        name: Some("Ana".into()),
        email: Some("ana@example.com".into()),
        phone: None,
    };
    let merged = t.relay.merge("abc", "U", &profile).await.unwrap();
    let again = t.relay.merge("abc", "U", &profile).await.unwrap();
    assert_eq!(merged, again);

    let user = CurrentIdentity::authenticated("U", None, Contact::default());
    let resumed = t.relay.resume_conversation(&user).await.unwrap();
    assert_eq!(resumed.messages.len(), 3);
    assert_eq!(resumed.conversation.contact.name.as_deref(), Some("Ana"));

    t.relay.post_customer_message(&user, "it's Ana").await.unwrap();
    let history = t.relay.widget_history(&user).await.unwrap().unwrap();
    assert_eq!(history.messages.len(), 4);
}

#[tokio::test]
async fn merging_a_session_owned_by_someone_else_is_refused() {
    let t = test_relay(RelayConfig::default());
    t.relay.post_customer_message(&guest("abc"), "hi").await.unwrap();
    t.relay.merge("abc", "U", &Contact::default()).await.unwrap();

    let err = t.relay.merge("abc", "V", &Contact::default()).await.unwrap_err();
    assert!(matches!(err, chat_relay::RelayError::MergeConflict { .. }));
    let history = t
        .relay
        .widget_history(&CurrentIdentity::authenticated("U", None, Contact::default()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(history.conversation.user_id.as_deref(), Some("U"));
}

#[tokio::test]
async fn telegram_reply_reaches_the_widget_subscriber() {
    let t = test_relay(RelayConfig::default());
    let posted = t
        .relay
        .post_customer_message(&guest("abc"), "Where is my order?")
        .await
        .unwrap();
    posted.relay.await.unwrap();

    let notification = &t.telegram.sent().await[0];
    assert_eq!(notification.recipient, TELEGRAM_STAFF);
    assert!(notification.text.contains("Where is my order?"));
    assert_eq!(notification.buttons, 3);
    assert_eq!(t.whatsapp.sent().await[0].recipient, WHATSAPP_STAFF);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let notifier = t.relay.notifier();
    let widget = notifier.register_client(tx).await;
    notifier
        .watch_conversation(widget, &[posted.conversation.id.clone()])
        .await;

    let outcome = t
        .relay
        .inbound()
        .route(
            InboundPayload::text(Platform::Telegram, TELEGRAM_STAFF, "tg-501", "Shipped this morning")
                .replying_to(Some("telegram-1".into()), None),
        )
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        RouteOutcome::Appended {
            resolution: Resolution::ReplyContext,
            ..
        }
    ));

    let history = t.relay.conversation_history(&posted.conversation.id).await.unwrap();
    let reply = history.messages.last().unwrap();
    assert_eq!(reply.channel_origin, ChannelOrigin::Telegram);
    assert_eq!(reply.body, "Shipped this morning");
    assert!(!history.conversation.needs_response);

    let event: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(event["event"], "message:new");
    assert_eq!(event["data"]["body"], "Shipped this morning");
    assert_eq!(t.telegram.acknowledged.lock().await.as_slice(), ["tg-501"]);
}

#[tokio::test]
async fn webhook_redelivery_never_duplicates() {
    let t = test_relay(RelayConfig::default());
    let payload = InboundPayload::text(Platform::Telegram, "4242", "tg-7", "hello from telegram");

    let first = t.relay.inbound().route(payload.clone()).await.unwrap();
    let second = t.relay.inbound().route(payload).await.unwrap();

    let RouteOutcome::Appended { conversation_id, .. } = first else {
        panic!("first delivery should append");
    };
    assert!(matches!(second, RouteOutcome::Duplicate { .. }));
    let history = t.relay.conversation_history(&conversation_id).await.unwrap();
    assert_eq!(history.messages.len(), 1);
    // Staff were notified once, on WhatsApp and on Telegram.
    assert_eq!(t.telegram.sent().await.len(), 1);
    assert_eq!(t.whatsapp.sent().await.len(), 1);
}

#[tokio::test]
async fn redelivery_after_close_or_delete_is_still_a_duplicate() {
    let t = test_relay(RelayConfig::default());
    let payload = InboundPayload::text(Platform::Telegram, "4242", "4242:7", "is anyone there?");

    let first = t.relay.inbound().route(payload.clone()).await.unwrap();
    let RouteOutcome::Appended { conversation_id, message_id, .. } = first else {
        panic!("first delivery should append");
    };

    t.relay
        .update_status(&conversation_id, ConversationStatus::Closed)
        .await
        .unwrap();
    let after_close = t.relay.inbound().route(payload.clone()).await.unwrap();
    assert_eq!(
        after_close,
        RouteOutcome::Duplicate {
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
        }
    );

    t.relay.delete_conversation(&conversation_id).await.unwrap();
    let after_delete = t.relay.inbound().route(payload).await.unwrap();
    assert!(matches!(after_delete, RouteOutcome::Duplicate { .. }));

    let everything = t
        .relay
        .list_conversations(&chat_relay::types::ConversationFilter {
            include_deleted: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(everything.len(), 1, "no second conversation was opened");
    let history = t.relay.conversation_history(&conversation_id).await.unwrap();
    assert_eq!(
        history
            .messages
            .iter()
            .filter(|m| m.external_ref.as_deref() == Some("4242:7"))
            .count(),
        1
    );
    assert_eq!(t.telegram.sent().await.len(), 1, "staff were notified once");
}

#[tokio::test]
async fn console_reply_to_telegram_customer_goes_to_their_chat() {
    let t = test_relay(RelayConfig::default());
    let first = t
        .relay
        .inbound()
        .route(InboundPayload::text(Platform::Telegram, "4242", "tg-8", "hi"))
        .await
        .unwrap();
    let RouteOutcome::Appended { conversation_id, .. } = first else {
        panic!("customer message should append");
    };

    let reply = t
        .relay
        .post_staff_reply(&conversation_id, "Hello! How can we help?", Some("Marta".into()))
        .await
        .unwrap();
    reply.relay.await.unwrap();

    let sent = t.telegram.sent().await;
    let to_customer = sent.iter().find(|s| s.recipient == "4242").unwrap();
    assert_eq!(to_customer.text, "Hello! How can we help?");
    assert_eq!(to_customer.buttons, 0);

    let history = t.relay.conversation_history(&conversation_id).await.unwrap();
    let stored = history.messages.last().unwrap();
    assert_eq!(stored.status, MessageStatus::SentToPlatform);
    assert!(stored.external_ref.is_some());
}

#[tokio::test]
async fn two_admins_viewing_are_both_free_to_reply() {
    let t = test_relay(RelayConfig::default());
    let posted = t.relay.post_customer_message(&guest("abc"), "hi").await.unwrap();
    let id = posted.conversation.id;

    let first = t.relay.presence().start_viewing(&id, "a1", Some("Ana")).await.unwrap();
    let second = t.relay.presence().start_viewing(&id, "a2", Some("Rui")).await.unwrap();
    assert!(!first.viewed_by_other);
    assert!(second.viewed_by_other);
    assert_eq!(second.viewer.unwrap().admin_id, "a1");

    t.relay.post_staff_reply(&id, "from a1", None).await.unwrap();
    t.relay.post_staff_reply(&id, "from a2", None).await.unwrap();
    assert_eq!(t.relay.conversation_history(&id).await.unwrap().messages.len(), 3);
}

#[tokio::test]
async fn deleted_conversation_comes_back_on_new_message() {
    let t = test_relay(RelayConfig::default());
    let posted = t.relay.post_customer_message(&guest("abc"), "hi").await.unwrap();
    let id = posted.conversation.id;
    let deleted = t.relay.delete_conversation(&id).await.unwrap();
    assert!(deleted.deleted_at.is_some());

    let reply = t.relay.post_staff_reply(&id, "still here", None).await.unwrap();
    assert!(reply.conversation.deleted_at.is_none());
}
