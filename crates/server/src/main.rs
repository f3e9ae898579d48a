use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use server_api::{
    create_conversation, list_conversations, list_messages, list_users, mark_read, post_message,
    publish_presence, register_user, ApiContext,
};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{MessageRecord, NewConversation, PresenceUpdate, ServerEvent, UserRecord},
};
use storage::SqliteStore;
use tracing::{info, warn};

mod config;

use config::{load_settings, prepare_database_url};

#[derive(Clone)]
struct AppState {
    api: ApiContext,
}

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: String,
}

type Rejection = (StatusCode, Json<ApiError>);

fn reject(error: ApiError) -> Rejection {
    let status = match error.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(error))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let store = SqliteStore::new(&database_url).await.map_err(|error| {
        tracing::error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = AppState {
        api: ApiContext {
            store: Arc::new(store),
        },
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/users", post(http_register_user).get(http_list_users))
        .route("/users/:user_id/presence", post(http_publish_presence))
        .route(
            "/conversations",
            post(http_create_conversation).get(http_list_conversations),
        )
        .route("/conversations/:conversation_id/messages", get(http_list_messages))
        .route(
            "/conversations/:conversation_id/messages/:message_id",
            put(http_put_message),
        )
        .route("/conversations/:conversation_id/read", post(http_mark_read))
        .route("/conversations/:conversation_id/ws", get(messages_ws_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn http_register_user(
    State(state): State<Arc<AppState>>,
    Json(user): Json<UserRecord>,
) -> Result<Json<UserRecord>, Rejection> {
    let user = register_user(&state.api, user).await.map_err(reject)?;
    Ok(Json(user))
}

async fn http_list_users(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<UserRecord>>, Rejection> {
    let users = list_users(&state.api).await.map_err(reject)?;
    Ok(Json(users))
}

async fn http_publish_presence(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(update): Json<PresenceUpdate>,
) -> Result<StatusCode, Rejection> {
    publish_presence(&state.api, &UserId(user_id), update)
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_create_conversation(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
    Json(conversation): Json<NewConversation>,
) -> Result<Json<serde_json::Value>, Rejection> {
    let conversation_id = create_conversation(&state.api, &UserId(q.user_id), conversation)
        .await
        .map_err(reject)?;
    Ok(Json(serde_json::json!({ "id": conversation_id })))
}

async fn http_list_conversations(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> Result<Json<Vec<shared::protocol::ConversationRecord>>, Rejection> {
    let conversations = list_conversations(&state.api, &UserId(q.user_id))
        .await
        .map_err(reject)?;
    Ok(Json(conversations))
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    Query(q): Query<UserQuery>,
) -> Result<Json<Vec<MessageRecord>>, Rejection> {
    let messages = list_messages(
        &state.api,
        &UserId(q.user_id),
        &ConversationId(conversation_id),
    )
    .await
    .map_err(reject)?;
    Ok(Json(messages))
}

/// Message writes are keyed by the client-chosen id in the path, so a
/// retried request replaces rather than duplicates.
async fn http_put_message(
    State(state): State<Arc<AppState>>,
    Path((conversation_id, message_id)): Path<(String, String)>,
    Query(q): Query<UserQuery>,
    Json(message): Json<MessageRecord>,
) -> Result<StatusCode, Rejection> {
    if message.id != MessageId(message_id) {
        return Err(reject(ApiError::new(
            ErrorCode::Validation,
            "message id in path and body must match",
        )));
    }
    post_message(
        &state.api,
        &UserId(q.user_id),
        &ConversationId(conversation_id),
        message,
    )
    .await
    .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_mark_read(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    Query(q): Query<UserQuery>,
) -> Result<StatusCode, Rejection> {
    mark_read(&state.api, &UserId(q.user_id), &ConversationId(conversation_id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket, UserId(q.user_id)))
}

/// Pushes full-snapshot events (users feed plus the caller's
/// membership-filtered conversations feed) for the lifetime of the
/// socket. Listeners die with the connection.
async fn ws_connection(
    state: Arc<AppState>,
    socket: axum::extract::ws::WebSocket,
    user_id: UserId,
) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();

    let mut users_feed = match state.api.store.subscribe_users().await {
        Ok(feed) => feed,
        Err(error) => {
            warn!(%error, "failed to open users feed for websocket");
            return;
        }
    };
    let mut conversations_feed = match state.api.store.subscribe_conversations(&user_id).await {
        Ok(feed) => feed,
        Err(error) => {
            warn!(%user_id, %error, "failed to open conversations feed for websocket");
            return;
        }
    };

    let send_task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                Some(users) = users_feed.next() => ServerEvent::UsersUpdated { users },
                Some(conversations) = conversations_feed.next() => {
                    ServerEvent::ConversationsUpdated { conversations }
                }
                else => break,
            };
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
}

async fn messages_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    Query(q): Query<UserQuery>,
) -> Result<impl IntoResponse, Rejection> {
    let conversation_id = ConversationId(conversation_id);
    let user_id = UserId(q.user_id);
    // Reuse the membership guard before upgrading.
    list_messages(&state.api, &user_id, &conversation_id)
        .await
        .map_err(reject)?;
    Ok(ws.on_upgrade(move |socket| messages_ws_connection(state, socket, conversation_id)))
}

async fn messages_ws_connection(
    state: Arc<AppState>,
    socket: axum::extract::ws::WebSocket,
    conversation_id: ConversationId,
) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();

    let mut messages_feed = match state.api.store.subscribe_messages(&conversation_id).await {
        Ok(feed) => feed,
        Err(error) => {
            warn!(%conversation_id, %error, "failed to open messages feed for websocket");
            return;
        }
    };

    let send_task = tokio::spawn(async move {
        while let Some(messages) = messages_feed.next().await {
            let event = ServerEvent::MessagesUpdated {
                conversation_id: conversation_id.clone(),
                messages,
            };
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
}
