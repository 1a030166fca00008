use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Json, Router,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    auth,
    channels::{telegram, whatsapp, ChannelRegistry},
    config::{RelayConfig, StoreBackend},
    error::RelayError,
    presence::PresenceView,
    realtime::TypingSide,
    relay::ChatRelay,
    store::{ConversationStore, MemoryConversationStore, PgConversationStore},
    types::{now_iso, Contact, ConversationFilter, ConversationStatus, CurrentIdentity},
};

pub struct AppState {
    pub relay: ChatRelay,
}

type SharedState = Arc<AppState>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityQuery {
    session_id: Option<String>,
    user_id: Option<String>,
    user_token: Option<String>,
}

/// Identity as sent by the widget. A `userId` only counts with a
/// `userToken` signed for it.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WidgetIdentity {
    #[serde(flatten)]
    identity: CurrentIdentity,
    #[serde(default)]
    user_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WidgetMessageBody {
    #[serde(flatten)]
    identity: WidgetIdentity,
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MergeBody {
    session_id: String,
    user_id: String,
    #[serde(default)]
    profile: Contact,
    #[serde(default)]
    user_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplyBody {
    text: String,
    author: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: ConversationStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ViewingBody {
    admin_id: String,
    admin_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventEnvelopeIn {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WidgetHistory {
    conversation: Option<crate::types::Conversation>,
    messages: Vec<crate::types::Message>,
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?;
    Some(token.trim().to_string())
}

fn admin_token_matches(state: &AppState, token: Option<&str>) -> bool {
    match state.relay.config().admin_token.as_deref() {
        None => true,
        Some(expected) => token == Some(expected),
    }
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), RelayError> {
    let token = bearer_token(headers);
    if admin_token_matches(state, token.as_deref()) {
        Ok(())
    } else if token.is_none() {
        Err(RelayError::Unauthorized("missing bearer token".to_string()))
    } else {
        Err(RelayError::Unauthorized("invalid token".to_string()))
    }
}

fn user_token_valid(state: &AppState, user_id: &str, token: Option<&str>) -> bool {
    let secret = state.relay.config().identity_secret.as_deref().unwrap_or("");
    token.is_some_and(|token| auth::verify_user_token(secret, user_id, token))
}

fn verified_identity(state: &AppState, widget: WidgetIdentity) -> Result<CurrentIdentity, RelayError> {
    let identity = widget.identity.normalized();
    let verified = match identity.user_id.as_deref() {
        Some(user_id) => user_token_valid(state, user_id, widget.user_token.as_deref()),
        None => true,
    };
    if verified {
        Ok(identity)
    } else {
        Err(RelayError::Unauthorized("userId requires a valid userToken".to_string()))
    }
}

/// Merges come from the backend holding the service token, or from a
/// widget proving the user with its signed token.
fn require_merge_authority(
    state: &AppState,
    headers: &HeaderMap,
    body: &MergeBody,
) -> Result<(), RelayError> {
    let service_ok = match (state.relay.config().service_token.as_deref(), bearer_token(headers)) {
        (Some(expected), Some(token)) => token == expected,
        _ => false,
    };
    if service_ok || user_token_valid(state, body.user_id.trim(), body.user_token.as_deref()) {
        Ok(())
    } else {
        Err(RelayError::Unauthorized(
            "merge requires the service token or a valid userToken".to_string(),
        ))
    }
}

/// Webhook replies: anything short of a storage failure is a 200 so the
/// platform stops retrying. Storage failures return 500 and the platform
/// re-drives the (idempotent) webhook.
fn webhook_response<T: Serialize>(platform: &str, result: Result<T, RelayError>) -> Response {
    match result {
        Ok(result) => Json(json!({ "ok": true, "result": result })).into_response(),
        Err(err @ (RelayError::NotFound { .. } | RelayError::Validation(_))) => {
            warn!(platform, error = %err, "webhook not processed");
            Json(json!({ "ok": true, "result": "unresolved" })).into_response()
        }
        Err(err) => {
            error!(platform, error = %err, "webhook processing failed");
            err.into_response()
        }
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

async fn widget_conversation(
    State(state): State<SharedState>,
    Json(widget): Json<WidgetIdentity>,
) -> Result<impl IntoResponse, RelayError> {
    let identity = verified_identity(&state, widget)?;
    let history = state.relay.resume_conversation(&identity).await?;
    Ok(Json(history))
}

async fn widget_messages(
    State(state): State<SharedState>,
    Query(query): Query<IdentityQuery>,
) -> Result<impl IntoResponse, RelayError> {
    let identity = verified_identity(
        &state,
        WidgetIdentity {
            identity: CurrentIdentity {
                session_id: query.session_id,
                user_id: query.user_id,
                profile: None,
            },
            user_token: query.user_token,
        },
    )?;
    let history = state.relay.widget_history(&identity).await?;
    Ok(Json(match history {
        Some(history) => WidgetHistory {
            conversation: Some(history.conversation),
            messages: history.messages,
        },
        None => WidgetHistory {
            conversation: None,
            messages: Vec::new(),
        },
    }))
}

async fn post_widget_message(
    State(state): State<SharedState>,
    Json(body): Json<WidgetMessageBody>,
) -> Result<impl IntoResponse, RelayError> {
    let identity = verified_identity(&state, body.identity)?;
    let posted = state
        .relay
        .post_customer_message(&identity, &body.text)
        .await?;
    Ok((StatusCode::CREATED, Json(posted.message)))
}

async fn merge_identity(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<MergeBody>,
) -> Result<impl IntoResponse, RelayError> {
    require_merge_authority(&state, &headers, &body)?;
    let merged = state
        .relay
        .merge(&body.session_id, &body.user_id, &body.profile)
        .await?;
    Ok(Json(json!({ "mergedConversationIds": merged })))
}

async fn list_conversations(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(filter): Query<ConversationFilter>,
) -> Result<impl IntoResponse, RelayError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.relay.list_conversations(&filter).await?))
}

async fn conversation_messages(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Result<impl IntoResponse, RelayError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.relay.conversation_history(&conversation_id).await?))
}

async fn post_reply(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Json(body): Json<ReplyBody>,
) -> Result<impl IntoResponse, RelayError> {
    require_admin(&state, &headers)?;
    let posted = state
        .relay
        .post_staff_reply(&conversation_id, &body.text, body.author)
        .await?;
    Ok((StatusCode::CREATED, Json(posted.message)))
}

async fn patch_status(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Json(body): Json<StatusBody>,
) -> Result<impl IntoResponse, RelayError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.relay.update_status(&conversation_id, body.status).await?))
}

async fn delete_conversation(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Result<impl IntoResponse, RelayError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.relay.delete_conversation(&conversation_id).await?))
}

async fn viewing(
    state: &AppState,
    headers: &HeaderMap,
    conversation_id: &str,
    body: ViewingBody,
    action: &str,
) -> Result<Json<PresenceView>, RelayError> {
    require_admin(state, headers)?;
    let presence = state.relay.presence();
    let name = body.admin_name.as_deref();
    let view = match action {
        "start" => presence.start_viewing(conversation_id, &body.admin_id, name).await?,
        "heartbeat" => presence.heartbeat(conversation_id, &body.admin_id, name).await?,
        _ => presence.stop_viewing(conversation_id, &body.admin_id).await?,
    };
    Ok(Json(view))
}

async fn viewing_start(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Json(body): Json<ViewingBody>,
) -> Result<Json<PresenceView>, RelayError> {
    viewing(&state, &headers, &conversation_id, body, "start").await
}

async fn viewing_heartbeat(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Json(body): Json<ViewingBody>,
) -> Result<Json<PresenceView>, RelayError> {
    viewing(&state, &headers, &conversation_id, body, "heartbeat").await
}

async fn viewing_stop(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Json(body): Json<ViewingBody>,
) -> Result<Json<PresenceView>, RelayError> {
    viewing(&state, &headers, &conversation_id, body, "stop").await
}

async fn telegram_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let inbound = state.relay.inbound();
    let secret = headers
        .get(telegram::SECRET_HEADER)
        .and_then(|v| v.to_str().ok());
    if let Err(err) = inbound.verify_telegram_secret(secret) {
        return err.into_response();
    }
    let Ok(update) = serde_json::from_slice::<telegram::TelegramUpdate>(&body) else {
        debug!("telegram update did not parse; ignoring");
        return Json(json!({ "ok": true, "result": "ignored" })).into_response();
    };
    webhook_response("telegram", inbound.route_telegram(update).await)
}

async fn whatsapp_webhook_verify(
    State(state): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    match state.relay.inbound().verify_whatsapp_subscription(&params) {
        Some(challenge) => (StatusCode::OK, challenge).into_response(),
        None => (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "invalid webhook verification token" })),
        )
            .into_response(),
    }
}

async fn whatsapp_webhook_event(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let inbound = state.relay.inbound();
    let signature = headers
        .get(whatsapp::SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    if let Err(err) = inbound.verify_whatsapp_signature(signature, &body) {
        return err.into_response();
    }
    let payload = serde_json::from_slice::<Value>(&body).unwrap_or_else(|_| json!({}));
    webhook_response("whatsapp", inbound.route_whatsapp(&payload).await)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn identity_from_event(data: &Value) -> WidgetIdentity {
    serde_json::from_value::<WidgetIdentity>(data.clone()).unwrap_or_default()
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let notifier = state.relay.notifier().clone();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let client_id = notifier.register_client(tx).await;

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(WsMessage::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    // Family of the conversation this socket currently shows.
    let mut watched: Vec<String> = Vec::new();

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            WsMessage::Text(text) => text.to_string(),
            WsMessage::Close(_) => break,
            _ => continue,
        };

        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
            continue;
        };

        match envelope.event.as_str() {
            "widget:join" => {
                let identity = match verified_identity(&state, identity_from_event(&envelope.data)) {
                    Ok(identity) => identity,
                    Err(e) => {
                        notifier
                            .send_to_client(client_id, "auth:error", json!({ "message": e.to_string() }))
                            .await;
                        continue;
                    }
                };
                match state.relay.resume_conversation(&identity).await {
                    Ok(history) => {
                        match state.relay.store().family_ids(&history.conversation.id).await {
                            Ok(family) => watched = family,
                            Err(e) => {
                                error!(client_id, error = %e, "family lookup failed");
                                watched = vec![history.conversation.id.clone()];
                            }
                        }
                        notifier.watch_conversation(client_id, &watched).await;
                        notifier
                            .send_to_client(client_id, "conversation:history", &history)
                            .await;
                    }
                    Err(e) => {
                        notifier
                            .send_to_client(client_id, "error", json!({ "message": e.to_string() }))
                            .await;
                    }
                }
            }
            "admin:join" => {
                let token = envelope.data.get("token").and_then(Value::as_str);
                if admin_token_matches(&state, token) {
                    notifier.join_admin(client_id).await;
                    debug!(client_id, "admin joined realtime");
                    let snapshot = state
                        .relay
                        .list_conversations(&ConversationFilter::default())
                        .await
                        .unwrap_or_default();
                    notifier
                        .send_to_client(client_id, "conversations:snapshot", snapshot)
                        .await;
                } else {
                    notifier
                        .send_to_client(
                            client_id,
                            "auth:error",
                            json!({ "message": "invalid admin token" }),
                        )
                        .await;
                }
            }
            "admin:watch" => {
                if !notifier.is_admin(client_id).await {
                    continue;
                }
                let Some(conversation_id) = envelope.data.get("conversationId").and_then(Value::as_str)
                else {
                    continue;
                };
                match state.relay.conversation_history(conversation_id).await {
                    Ok(history) => {
                        watched = state
                            .relay
                            .store()
                            .family_ids(conversation_id)
                            .await
                            .unwrap_or_else(|_| vec![conversation_id.to_string()]);
                        notifier.watch_conversation(client_id, &watched).await;
                        notifier
                            .send_to_client(client_id, "conversation:history", &history)
                            .await;
                    }
                    Err(e) => {
                        notifier
                            .send_to_client(client_id, "error", json!({ "message": e.to_string() }))
                            .await;
                    }
                }
            }
            "typing" => {
                let active = envelope
                    .data
                    .get("active")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let side = if notifier.is_admin(client_id).await {
                    TypingSide::Staff
                } else {
                    TypingSide::Customer
                };
                notifier.typing(client_id, &watched, side, active).await;
            }
            other => debug!(client_id, event = other, "unknown websocket event"),
        }
    }

    notifier.unregister(client_id).await;
    send_task.abort();
}

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/widget/conversation", post(widget_conversation))
        .route(
            "/api/widget/messages",
            get(widget_messages).post(post_widget_message),
        )
        .route("/api/identity/merge", post(merge_identity))
        .route("/api/admin/conversations", get(list_conversations))
        .route(
            "/api/admin/conversations/{conversation_id}",
            delete(delete_conversation),
        )
        .route(
            "/api/admin/conversations/{conversation_id}/messages",
            get(conversation_messages),
        )
        .route(
            "/api/admin/conversations/{conversation_id}/reply",
            post(post_reply),
        )
        .route(
            "/api/admin/conversations/{conversation_id}/status",
            patch(patch_status),
        )
        .route(
            "/api/admin/conversations/{conversation_id}/viewing/start",
            post(viewing_start),
        )
        .route(
            "/api/admin/conversations/{conversation_id}/viewing/heartbeat",
            post(viewing_heartbeat),
        )
        .route(
            "/api/admin/conversations/{conversation_id}/viewing/stop",
            post(viewing_stop),
        )
        .route("/api/webhooks/telegram", post(telegram_webhook))
        .route(
            "/api/webhooks/whatsapp",
            get(whatsapp_webhook_verify).post(whatsapp_webhook_event),
        )
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn open_store(config: &RelayConfig) -> Result<Arc<dyn ConversationStore>, RelayError> {
    match config.store_backend {
        StoreBackend::Postgres => {
            let store = PgConversationStore::connect(&config.database_url).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            warn!("using in-memory store; conversations are lost on restart");
            Ok(Arc::new(MemoryConversationStore::new()))
        }
    }
}

fn spawn_retry_sweep(relay: ChatRelay, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = relay.sweep_queued().await {
                error!(error = %e, "retry sweep failed");
            }
        }
    });
}

pub async fn run() -> Result<(), RelayError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,chat_relay=debug")),
        )
        .init();

    let config = RelayConfig::from_env()?;
    if config.identity_secret.is_none() {
        warn!("IDENTITY_SECRET unset; widget accepts anonymous sessions only");
    }
    let port = config.port;
    let store = open_store(&config).await?;
    let channels = ChannelRegistry::from_config(&config, reqwest::Client::new());
    info!(platforms = ?channels.platforms(), "platform adapters configured");

    let sweep_interval = config.retry_sweep_interval;
    let relay = ChatRelay::new(config, store, channels);
    if let Some(interval) = sweep_interval {
        spawn_retry_sweep(relay.clone(), interval);
    }

    let app = build_router(Arc::new(AppState { relay }));

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayError::Internal(format!("failed to bind {addr}: {e}")))?;

    info!("chat relay running at http://localhost:{port}");
    axum::serve(listener, app)
        .await
        .map_err(|e| RelayError::Internal(format!("server runtime failure: {e}")))
}
