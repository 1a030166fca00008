mod common;

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chat_relay::{
    app::{build_router, AppState},
    auth::sign_user_token,
    config::{RelayConfig, WebhookSecrets},
};
use common::{test_relay, TestRelay};
use serde_json::{json, Value};
use tower::ServiceExt;

fn router(t: &TestRelay) -> Router {
    build_router(Arc::new(AppState {
        relay: t.relay.clone(),
    }))
}

fn secured() -> RelayConfig {
    RelayConfig {
        admin_token: Some("s3cret".to_string()),
        identity_secret: Some("id-key".to_string()),
        service_token: Some("svc".to_string()),
        webhook_secrets: WebhookSecrets {
            telegram_secret: Some("tg-secret".to_string()),
            whatsapp_verify_token: Some("verify-me".to_string()),
            whatsapp_app_secret: None,
        },
        ..RelayConfig::default()
    }
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn read_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

#[tokio::test]
async fn health_reports_ok() {
    let t = test_relay(RelayConfig::default());
    let response = router(&t)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["ok"], true);
}

#[tokio::test]
async fn widget_posts_and_reads_back_its_history() {
    let t = test_relay(RelayConfig::default());
    let app = router(&t);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/widget/messages",
            json!({ "sessionId": "abc", "text": "hello there" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let message = read_json(response).await;
    assert_eq!(message["body"], "hello there");
    assert_eq!(message["fromCustomer"], true);

    let response = app
        .oneshot(
            Request::get("/api/widget/messages?sessionId=abc")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let history = read_json(response).await;
    assert_eq!(history["messages"].as_array().unwrap().len(), 1);
    assert_eq!(history["conversation"]["needsResponse"], true);
}

#[tokio::test]
async fn empty_widget_message_is_rejected() {
    let t = test_relay(RelayConfig::default());
    let response = router(&t)
        .oneshot(json_request(
            "POST",
            "/api/widget/messages",
            json!({ "sessionId": "abc", "text": "   " }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(t
        .relay
        .widget_history(&chat_relay::types::CurrentIdentity::anonymous("abc"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn admin_routes_require_the_bearer_token() {
    let t = test_relay(secured());
    let app = router(&t);

    let response = app
        .clone()
        .oneshot(Request::get("/api/admin/conversations").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(
            Request::get("/api/admin/conversations")
                .header("authorization", "Bearer s3cret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(read_json(response).await.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn reply_status_and_viewing_over_http() {
    let t = test_relay(RelayConfig::default());
    let posted = t
        .relay
        .post_customer_message(&chat_relay::types::CurrentIdentity::anonymous("abc"), "hi")
        .await
        .unwrap();
    let id = posted.conversation.id;
    let app = router(&t);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/api/admin/conversations/{id}/reply"),
            json!({ "text": "hello!", "author": "Marta" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(read_json(response).await["authoredBy"], "Marta");

    let response = app
        .clone()
        .oneshot(json_request(
            "PATCH",
            &format!("/api/admin/conversations/{id}/status"),
            json!({ "status": "closed" }),
        ))
        .await
        .unwrap();
    assert_eq!(read_json(response).await["status"], "closed");

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/api/admin/conversations/{id}/viewing/start"),
            json!({ "adminId": "a1" }),
        ))
        .await
        .unwrap();
    assert_eq!(read_json(response).await["viewer"]["adminId"], "a1");

    let response = app
        .oneshot(json_request(
            "POST",
            &format!("/api/admin/conversations/{id}/viewing/start"),
            json!({ "adminId": "a2" }),
        ))
        .await
        .unwrap();
    assert_eq!(read_json(response).await["viewedByOther"], true);
}

#[tokio::test]
async fn reply_to_unknown_conversation_is_404() {
    let t = test_relay(RelayConfig::default());
    let response = router(&t)
        .oneshot(json_request(
            "POST",
            "/api/admin/conversations/nope/reply",
            json!({ "text": "hello" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

fn user_token(user_id: &str) -> String {
    let exp = chrono::Utc::now().timestamp() + 3600;
    sign_user_token("id-key", user_id, exp).unwrap()
}

fn with_bearer(mut request: Request<Body>, token: &str) -> Request<Body> {
    request
        .headers_mut()
        .insert("authorization", format!("Bearer {token}").parse().unwrap());
    request
}

#[tokio::test]
async fn conflicting_merge_is_409() {
    let t = test_relay(secured());
    let app = router(&t);
    t.relay
        .post_customer_message(&chat_relay::types::CurrentIdentity::anonymous("abc"), "hi")
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(with_bearer(
            json_request(
                "POST",
                "/api/identity/merge",
                json!({ "sessionId": "abc", "userId": "U", "profile": { "name": "Ana" } }),
            ),
            "svc",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        read_json(response).await["mergedConversationIds"]
            .as_array()
            .unwrap()
            .len(),
        1
    );

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/identity/merge",
            json!({ "sessionId": "abc", "userId": "V", "userToken": user_token("V") }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn merge_without_credentials_is_refused() {
    let t = test_relay(secured());
    let app = router(&t);
    t.relay
        .post_customer_message(&chat_relay::types::CurrentIdentity::anonymous("abc"), "hi")
        .await
        .unwrap();

    for request in [
        json_request("POST", "/api/identity/merge", json!({ "sessionId": "abc", "userId": "U" })),
        with_bearer(
            json_request("POST", "/api/identity/merge", json!({ "sessionId": "abc", "userId": "U" })),
            "s3cret",
        ),
        json_request(
            "POST",
            "/api/identity/merge",
            json!({ "sessionId": "abc", "userId": "U", "userToken": user_token("V") }),
        ),
    ] {
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
    let history = t
        .relay
        .widget_history(&chat_relay::types::CurrentIdentity::anonymous("abc"))
        .await
        .unwrap()
        .unwrap();
    assert!(history.conversation.user_id.is_none());
}

#[tokio::test]
async fn widget_user_id_needs_a_signed_token() {
    let t = test_relay(secured());
    let app = router(&t);
    t.relay
        .post_customer_message(
            &chat_relay::types::CurrentIdentity::authenticated("U", None, Default::default()),
            "my private order",
        )
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::get("/api/widget/messages?userId=U")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(
            Request::get(format!("/api/widget/messages?userId=U&userToken={}", user_token("V")))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/widget/messages",
            json!({ "sessionId": "abc", "userId": "U", "text": "it's me" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(
            Request::get(format!("/api/widget/messages?userId=U&userToken={}", user_token("U")))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let history = read_json(response).await;
    assert_eq!(history["messages"][0]["body"], "my private order");
}

#[tokio::test]
async fn widget_user_id_is_refused_without_an_identity_secret() {
    let t = test_relay(RelayConfig::default());
    let response = router(&t)
        .oneshot(json_request(
            "POST",
            "/api/widget/conversation",
            json!({ "userId": "U", "userToken": "4102444800.00" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn telegram_webhook_checks_the_secret_and_acks_unresolved_updates() {
    let t = test_relay(secured());
    let app = router(&t);
    let update = json!({
        "update_id": 1,
        "message": {
            "message_id": 10,
            "chat": { "id": -1001, "type": "supergroup" },
            "from": { "id": 7, "is_bot": false, "first_name": "Marta" },
            "text": "/reply missing-id hello"
        }
    });

    let response = app
        .clone()
        .oneshot(json_request("POST", "/api/webhooks/telegram", update.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let mut request = json_request("POST", "/api/webhooks/telegram", update);
    request
        .headers_mut()
        .insert("x-telegram-bot-api-secret-token", "tg-secret".parse().unwrap());
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["result"]["outcome"], "unresolved");
}

#[tokio::test]
async fn whatsapp_subscription_handshake() {
    let t = test_relay(secured());
    let app = router(&t);

    let response = app
        .clone()
        .oneshot(
            Request::get(
                "/api/webhooks/whatsapp?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=1234",
            )
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"1234");

    let response = app
        .oneshot(
            Request::get(
                "/api/webhooks/whatsapp?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=1234",
            )
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn whatsapp_customer_message_opens_a_conversation() {
    let t = test_relay(RelayConfig::default());
    let payload = json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "changes": [{
                "field": "messages",
                "value": {
                    "metadata": { "phone_number_id": "PN1" },
                    "contacts": [{ "wa_id": "351911111111", "profile": { "name": "Rui" } }],
                    "messages": [{
                        "from": "351911111111",
                        "id": "wamid.A",
                        "type": "text",
                        "text": { "body": "Olá, preciso de ajuda" }
                    }]
                }
            }]
        }]
    });
    let response = router(&t)
        .oneshot(json_request("POST", "/api/webhooks/whatsapp", payload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["result"][0]["outcome"], "appended");
    assert_eq!(body["result"][0]["resolution"], "customer");

    let conversations = t
        .relay
        .list_conversations(&Default::default())
        .await
        .unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].contact.name.as_deref(), Some("Rui"));
    assert_eq!(t.telegram.sent().await.len(), 1);
}
