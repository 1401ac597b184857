use std::sync::Arc;

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, Path, Query, Request, State},
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderValue, Method, StatusCode,
    },
    routing::{delete, get, patch, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use huddle_shared::clock::Clock;
use huddle_shared::crypto::EncryptionGateway;
use huddle_shared::types::{ChatId, MessageId, UserId};
use huddle_shared::{ChatError, ChatResult};
use huddle_store::{Chat, Database};

use crate::auth::AuthUser;
use crate::config::ServerConfig;
use crate::directory::ChatDirectory;
use crate::dispatcher::Dispatcher;
use crate::error::{ApiError, ApiResult};
use crate::hub::PresenceHub;
use crate::messaging::{MessageService, SendMessage};
use crate::ws::ws_handler;

#[derive(Clone)]
pub struct AppState {
    pub directory: Arc<ChatDirectory>,
    pub messages: Arc<MessageService>,
    pub dispatcher: Arc<Dispatcher>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        db: Arc<Database>,
        clock: Arc<dyn Clock>,
        gateway: Arc<dyn EncryptionGateway>,
    ) -> Self {
        let directory = Arc::new(ChatDirectory::new(db.clone(), clock.clone(), gateway.clone()));
        let messages = Arc::new(MessageService::new(
            db,
            clock.clone(),
            gateway,
            chrono::Duration::seconds(config.delete_for_all_window_secs),
        ));
        let hub = PresenceHub::new(config.connection_buffer);
        let dispatcher = Arc::new(Dispatcher::new(directory.clone(), messages.clone(), hub));

        Self {
            directory,
            messages,
            dispatcher,
            clock,
            config: Arc::new(config),
        }
    }

    /// Verify a raw identity token against the configured issuer key.
    pub fn authenticate(&self, token: &str) -> ChatResult<UserId> {
        huddle_shared::auth::authenticate(token, &self.config.auth_server_pubkey, self.clock.now())
    }

    /// Run store-backed work on the blocking pool. SQLite calls hold a
    /// connection lock and may wait on `busy_timeout`.
    pub async fn run_blocking<T, F>(&self, f: F) -> ApiResult<T>
    where
        F: FnOnce(&AppState) -> ChatResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let state = self.clone();
        let result = tokio::task::spawn_blocking(move || f(&state))
            .await
            .map_err(|e| ChatError::Internal(format!("blocking task failed: {e}")))?;
        Ok(result?)
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .route("/chats", get(list_chats).post(create_direct_chat))
        .route("/chats/group", post(create_group_chat))
        .route("/chats/groups", get(list_groups))
        .route("/chats/:id", patch(rename_chat))
        .route("/chats/:id/participants", get(group_details).post(add_participant))
        .route("/chats/:id/participants/:user_id", delete(remove_participant))
        .route("/chats/:id/join-request", post(request_join))
        .route("/chats/:id/join-requests/:user_id/approve", post(approve_request))
        .route("/chats/:id/join-requests/:user_id/reject", post(reject_request))
        .route("/chats/:id/read", post(mark_read))
        .route("/chats/:id/block", post(block_chat).delete(unblock_chat))
        .route("/chats/:id/mute", put(set_mute))
        .route("/chats/:id/rate-limit", put(set_rate_limit))
        .route("/chats/:id/audit", get(audit_log))
        .route("/messages", get(list_messages).post(send_message))
        .route("/messages/:id/reactions", post(toggle_reaction))
        .route("/messages/:id/delete-for-me", post(delete_for_me))
        .route("/messages/:id/delete-for-all", post(delete_for_all))
        .route("/messages/:id/pin", post(pin_message).delete(unpin_message))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let base = CorsLayer::new().allow_methods([
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::PATCH,
        Method::DELETE,
        Method::OPTIONS,
    ]);

    // Cookies only flow to an explicitly configured origin.
    match config
        .cors_origin
        .as_deref()
        .and_then(|origin| HeaderValue::from_str(origin).ok())
    {
        Some(origin) => base
            .allow_origin(origin)
            .allow_headers([AUTHORIZATION, CONTENT_TYPE])
            .allow_credentials(true),
        None => base.allow_origin(Any).allow_headers(Any),
    }
}

/// `Json<T>` whose rejection is reported like every other error.
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError(json_rejection(rejection))),
        }
    }
}

fn json_rejection(rejection: JsonRejection) -> ChatError {
    ChatError::invalid(rejection.body_text())
}

fn chat_path(raw: &str) -> ChatResult<ChatId> {
    raw.parse()
}

fn message_path(raw: &str) -> ChatResult<MessageId> {
    raw.parse()
}

fn user_path(raw: &str) -> ChatResult<UserId> {
    raw.parse()
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DirectChatRequest {
    other_user_id: Option<UserId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupChatRequest {
    #[serde(default)]
    title: String,
    #[serde(default)]
    participant_ids: Vec<UserId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddParticipantRequest {
    user_id: UserId,
}

#[derive(Deserialize)]
struct RenameRequest {
    title: String,
}

#[derive(Deserialize)]
struct MuteRequest {
    until: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitRequest {
    per_minute: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagesQuery {
    chat_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostMessageRequest {
    chat_id: ChatId,
    #[serde(flatten)]
    message: SendMessage,
}

#[derive(Deserialize)]
struct ReactionRequest {
    emoji: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// Chats
// ---------------------------------------------------------------------------

/// The chat as the caller sees it.
fn chat_json(state: &AppState, chat: &Chat, user: &UserId) -> ChatResult<Value> {
    let view = state.directory.view(chat, user)?;
    Ok(json!({ "chat": view }))
}

async fn list_chats(State(state): State<AppState>, AuthUser(user): AuthUser) -> ApiResult<Json<Value>> {
    state
        .run_blocking(move |state| {
            let chats = state.directory.list_chats(&user)?;
            Ok(Json(json!({ "chats": chats })))
        })
        .await
}

async fn create_direct_chat(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    JsonBody(body): JsonBody<DirectChatRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    state
        .run_blocking(move |state| {
            let (chat, created) = state
                .directory
                .get_or_create_direct_chat(user, body.other_user_id)?;
            if !created {
                return Ok((StatusCode::OK, Json(chat_json(state, &chat, &user)?)));
            }
            for participant in &chat.participants {
                state.dispatcher.participant_added(&chat, participant);
            }
            Ok((StatusCode::CREATED, Json(chat_json(state, &chat, &user)?)))
        })
        .await
}

async fn create_group_chat(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    JsonBody(body): JsonBody<GroupChatRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    state
        .run_blocking(move |state| {
            let chat = state
                .directory
                .create_group_chat(user, &body.title, &body.participant_ids)?;
            for participant in &chat.participants {
                state.dispatcher.participant_added(&chat, participant);
            }
            Ok((StatusCode::CREATED, Json(chat_json(state, &chat, &user)?)))
        })
        .await
}

async fn list_groups(State(state): State<AppState>, AuthUser(user): AuthUser) -> ApiResult<Json<Value>> {
    state
        .run_blocking(move |state| {
            let groups = state.directory.list_groups(&user)?;
            Ok(Json(json!({ "groups": groups })))
        })
        .await
}

async fn group_details(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let chat_id = chat_path(&id)?;
    state
        .run_blocking(move |state| {
            let view = state.directory.group_details(&chat_id, &user)?;
            Ok(Json(json!({ "chat": view })))
        })
        .await
}

async fn add_participant(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    JsonBody(body): JsonBody<AddParticipantRequest>,
) -> ApiResult<Json<Value>> {
    let chat_id = chat_path(&id)?;
    state
        .run_blocking(move |state| {
            let chat = state.directory.add_participant(&chat_id, user, body.user_id)?;
            state.dispatcher.participant_added(&chat, &body.user_id);
            Ok(Json(chat_json(state, &chat, &user)?))
        })
        .await
}

async fn remove_participant(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((id, target)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let chat_id = chat_path(&id)?;
    let target = user_path(&target)?;
    state
        .run_blocking(move |state| {
            let chat = state.directory.remove_participant(&chat_id, user, target)?;
            state.dispatcher.participant_removed(&chat, &target);
            Ok(Json(chat_json(state, &chat, &user)?))
        })
        .await
}

async fn rename_chat(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    JsonBody(body): JsonBody<RenameRequest>,
) -> ApiResult<Json<Value>> {
    let chat_id = chat_path(&id)?;
    state
        .run_blocking(move |state| {
            let chat = state.directory.rename(&chat_id, user, &body.title)?;
            state.dispatcher.chat_updated(&chat);
            Ok(Json(chat_json(state, &chat, &user)?))
        })
        .await
}

async fn request_join(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let chat_id = chat_path(&id)?;
    state
        .run_blocking(move |state| {
            let requested = state.directory.request_join(&chat_id, user)?;
            if requested {
                state.dispatcher.chat_updated(&state.directory.load(&chat_id)?);
            }
            Ok(Json(json!({ "requested": requested })))
        })
        .await
}

async fn approve_request(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((id, requester)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let chat_id = chat_path(&id)?;
    let requester = user_path(&requester)?;
    state
        .run_blocking(move |state| {
            let chat = state.directory.approve_request(&chat_id, user, requester)?;
            state.dispatcher.participant_added(&chat, &requester);
            Ok(Json(chat_json(state, &chat, &user)?))
        })
        .await
}

async fn reject_request(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((id, requester)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let chat_id = chat_path(&id)?;
    let requester = user_path(&requester)?;
    state
        .run_blocking(move |state| {
            let chat = state.directory.reject_request(&chat_id, user, requester)?;
            state.dispatcher.chat_updated(&chat);
            Ok(Json(chat_json(state, &chat, &user)?))
        })
        .await
}

async fn mark_read(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let chat_id = chat_path(&id)?;
    state
        .run_blocking(move |state| {
            let at = state.directory.mark_read(&chat_id, user)?;
            Ok(Json(json!({ "lastReadAt": at })))
        })
        .await
}

async fn block_chat(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let chat_id = chat_path(&id)?;
    state
        .run_blocking(move |state| {
            let chat = state.directory.block_user(&chat_id, user)?;
            state.dispatcher.chat_updated(&chat);
            Ok(Json(chat_json(state, &chat, &user)?))
        })
        .await
}

async fn unblock_chat(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let chat_id = chat_path(&id)?;
    state
        .run_blocking(move |state| {
            let chat = state.directory.unblock_user(&chat_id, user)?;
            state.dispatcher.chat_updated(&chat);
            Ok(Json(chat_json(state, &chat, &user)?))
        })
        .await
}

async fn set_mute(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    JsonBody(body): JsonBody<MuteRequest>,
) -> ApiResult<Json<Value>> {
    let chat_id = chat_path(&id)?;
    state
        .run_blocking(move |state| {
            let chat = state.directory.set_mute(&chat_id, user, body.until)?;
            state.dispatcher.chat_updated(&chat);
            Ok(Json(chat_json(state, &chat, &user)?))
        })
        .await
}

async fn set_rate_limit(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    JsonBody(body): JsonBody<RateLimitRequest>,
) -> ApiResult<Json<Value>> {
    let chat_id = chat_path(&id)?;
    state
        .run_blocking(move |state| {
            let chat = state.directory.set_rate_limit(&chat_id, user, body.per_minute)?;
            state.dispatcher.chat_updated(&chat);
            Ok(Json(chat_json(state, &chat, &user)?))
        })
        .await
}

async fn audit_log(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let chat_id = chat_path(&id)?;
    state
        .run_blocking(move |state| {
            let events = state.directory.audit_log(&chat_id, &user)?;
            Ok(Json(json!({ "events": events })))
        })
        .await
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

async fn list_messages(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<Json<Value>> {
    let raw = query
        .chat_id
        .ok_or_else(|| ChatError::invalid("chatId is required"))?;
    let chat_id = chat_path(&raw)?;
    state
        .run_blocking(move |state| {
            let history = state.messages.get_messages_for_chat(&chat_id, user)?;
            Ok(Json(json!(history)))
        })
        .await
}

async fn send_message(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    JsonBody(body): JsonBody<PostMessageRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    state
        .run_blocking(move |state| {
            let message = state
                .dispatcher
                .send_message(&body.chat_id, user, &body.message)?;
            Ok((StatusCode::CREATED, Json(json!({ "message": message }))))
        })
        .await
}

async fn toggle_reaction(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    JsonBody(body): JsonBody<ReactionRequest>,
) -> ApiResult<Json<Value>> {
    let message_id = message_path(&id)?;
    state
        .run_blocking(move |state| {
            let update = state.dispatcher.toggle_reaction(&message_id, user, &body.emoji)?;
            Ok(Json(json!(update)))
        })
        .await
}

async fn delete_for_me(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let message_id = message_path(&id)?;
    state
        .run_blocking(move |state| {
            let chat_id = state.messages.delete_for_me(&message_id, user)?;
            Ok(Json(json!({ "chatId": chat_id, "messageId": message_id })))
        })
        .await
}

async fn delete_for_all(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let message_id = message_path(&id)?;
    state
        .run_blocking(move |state| {
            let deletion = state.dispatcher.delete_for_all(&message_id, user)?;
            Ok(Json(json!(deletion)))
        })
        .await
}

async fn pin_message(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let message_id = message_path(&id)?;
    state
        .run_blocking(move |state| {
            let chat = state.messages.pin(&message_id, user)?;
            state.dispatcher.chat_updated(&chat);
            Ok(Json(chat_json(state, &chat, &user)?))
        })
        .await
}

async fn unpin_message(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let message_id = message_path(&id)?;
    state
        .run_blocking(move |state| {
            let chat = state.messages.unpin(&message_id, user)?;
            state.dispatcher.chat_updated(&chat);
            Ok(Json(chat_json(state, &chat, &user)?))
        })
        .await
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
