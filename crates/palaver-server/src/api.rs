//! REST surface: CRUD over conversations, messages and notifications.
//!
//! Every route except `/health` requires a bearer credential resolved
//! through the same verification path as the WebSocket handshake. The send
//! route here only persists; live fan-out happens exclusively on the
//! WebSocket path.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header::HeaderValue, HeaderMap, Method, StatusCode};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use palaver_shared::events::ServerEvent;
use palaver_shared::model::{
    Conversation, ConversationKind, CreatorRef, Message, MessageKind, Notification, Participant,
    ReplyRef,
};
use palaver_shared::{Identity, UserKind};
use palaver_store::Database;

use crate::auth::{self, AuthService};
use crate::chat;
use crate::config::ServerConfig;
use crate::error::{or_not_found, ServerError};
use crate::registry::ConnectionRegistry;
use crate::rooms::RoomRegistry;

/// Shared state injected into every handler. Built once in `main`; tests
/// build isolated instances of their own.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<tokio::sync::Mutex<Database>>,
    pub auth: Arc<AuthService>,
    pub registry: Arc<ConnectionRegistry>,
    pub rooms: Arc<RoomRegistry>,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let mut cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);
    if state.config.allowed_origins.is_empty() {
        cors = cors.allow_origin(Any);
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        cors = cors.allow_origin(AllowOrigin::list(origins));
    }

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(chat::ws_handler))
        .route("/api/auth/verify", post(verify_identity))
        .route("/api/auth/me", get(current_user))
        .route("/api/auth/online", get(online_users))
        .route(
            "/api/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route(
            "/api/conversations/:id",
            get(get_conversation).delete(delete_conversation),
        )
        .route("/api/conversations/:id/participants", post(add_participant))
        .route(
            "/api/conversations/:id/participants/:user_id/:user_kind",
            axum::routing::delete(remove_participant),
        )
        .route("/api/messages", post(send_message))
        .route(
            "/api/messages/:id",
            get(list_messages).put(edit_message).delete(delete_message),
        )
        .route("/api/messages/:id/read", post(mark_read))
        .route("/api/messages/:id/unread-count", get(unread_count))
        .route("/api/notifications", get(list_notifications))
        .route("/api/notifications/unread", get(unread_notifications))
        .route("/api/notifications/read-all", put(read_all_notifications))
        .route(
            "/api/notifications/:id",
            axum::routing::delete(delete_notification),
        )
        .route("/api/notifications/:id/read", put(read_notification))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn current_identity(state: &AppState, headers: &HeaderMap) -> Result<Identity, ServerError> {
    let token = auth::bearer_token(headers)?;
    Ok(state.auth.authenticate(&token).await?)
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct VerifyResponse {
    success: bool,
    user: Identity,
    message: &'static str,
}

/// Resolve the caller's credential and echo the canonical identity back.
async fn verify_identity(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<VerifyResponse>, ServerError> {
    let identity = current_identity(&state, &headers).await?;

    Ok(Json(VerifyResponse {
        success: true,
        user: identity,
        message: "Token verified successfully",
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IdentityWithPresence {
    #[serde(flatten)]
    identity: Identity,
    is_online: bool,
    last_seen: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct MeResponse {
    success: bool,
    user: IdentityWithPresence,
}

async fn current_user(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<MeResponse>, ServerError> {
    let identity = current_identity(&state, &headers).await?;

    let presence = {
        let db = state.db.lock().await;
        db.get_presence(&identity.id, identity.kind)?
    };

    Ok(Json(MeResponse {
        success: true,
        user: IdentityWithPresence {
            is_online: presence.as_ref().map(|p| p.is_online).unwrap_or(false),
            last_seen: presence.map(|p| p.last_seen),
            identity,
        },
    }))
}

#[derive(Deserialize)]
struct OnlineUsersQuery {
    #[serde(rename = "type")]
    kind: Option<UserKind>,
}

#[derive(Serialize)]
struct OnlineUsersResponse {
    success: bool,
    users: Vec<Identity>,
    count: usize,
}

/// Who is online right now, straight from the connection registry.
async fn online_users(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<OnlineUsersQuery>,
) -> Result<Json<OnlineUsersResponse>, ServerError> {
    current_identity(&state, &headers).await?;

    let mut users = state.registry.online_identities().await;
    if let Some(kind) = query.kind {
        users.retain(|u| u.kind == kind);
    }
    users.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(Json(OnlineUsersResponse {
        success: true,
        count: users.len(),
        users,
    }))
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ListConversationsQuery {
    #[serde(rename = "type")]
    kind: Option<ConversationKind>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConversationWithUnread {
    #[serde(flatten)]
    conversation: Conversation,
    unread_count: u64,
}

#[derive(Serialize)]
struct ConversationsResponse {
    success: bool,
    conversations: Vec<ConversationWithUnread>,
    count: usize,
}

async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListConversationsQuery>,
) -> Result<Json<ConversationsResponse>, ServerError> {
    let identity = current_identity(&state, &headers).await?;

    let db = state.db.lock().await;
    let conversations = db.conversations_for(&identity.id, identity.kind, query.kind)?;

    let mut with_unread = Vec::with_capacity(conversations.len());
    for conversation in conversations {
        let unread_count = db.unread_count(conversation.id, &identity.id, identity.kind)?;
        with_unread.push(ConversationWithUnread {
            conversation,
            unread_count,
        });
    }

    Ok(Json(ConversationsResponse {
        success: true,
        count: with_unread.len(),
        conversations: with_unread,
    }))
}

#[derive(Serialize)]
struct ConversationResponse {
    success: bool,
    conversation: ConversationWithUnread,
}

async fn get_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<ConversationResponse>, ServerError> {
    let identity = current_identity(&state, &headers).await?;

    let db = state.db.lock().await;
    let conversation = db.get_conversation(id).map_err(or_not_found("Conversation"))?;

    if !conversation.is_participant(&identity.id, identity.kind) {
        return Err(ServerError::Forbidden("Access denied".to_string()));
    }

    let unread_count = db.unread_count(id, &identity.id, identity.kind)?;

    Ok(Json(ConversationResponse {
        success: true,
        conversation: ConversationWithUnread {
            conversation,
            unread_count,
        },
    }))
}

#[derive(Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct ParticipantInput {
    id: String,
    kind: UserKind,
    name: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    profile: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversationRequest {
    #[serde(rename = "type")]
    kind: ConversationKind,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    participants: Vec<ParticipantInput>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversationResponse {
    success: bool,
    conversation: Conversation,
    message: &'static str,
    is_new: bool,
}

/// Conversation shape invariants: direct kinds take exactly two
/// participants, groups need a name and at least three.
fn validate_participants(
    kind: ConversationKind,
    name: Option<&str>,
    participants: &[Participant],
) -> Result<(), ServerError> {
    if kind.is_direct() {
        if participants.len() != 2 {
            return Err(ServerError::Validation(
                "One-on-one chat requires exactly 2 participants".to_string(),
            ));
        }
    } else {
        if name.map(str::trim).filter(|n| !n.is_empty()).is_none() {
            return Err(ServerError::Validation(
                "Group name is required".to_string(),
            ));
        }
        if participants.len() < 3 {
            return Err(ServerError::Validation(
                "Group chat requires at least 3 participants".to_string(),
            ));
        }
    }
    Ok(())
}

async fn create_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateConversationRequest>,
) -> Result<(StatusCode, Json<CreateConversationResponse>), ServerError> {
    let identity = current_identity(&state, &headers).await?;

    if request.participants.is_empty() {
        return Err(ServerError::Validation(
            "At least one participant is required".to_string(),
        ));
    }

    let now = Utc::now();
    let mut participants = Vec::with_capacity(request.participants.len() + 1);
    // The caller is always a member, listed first when absent.
    let caller_included = request
        .participants
        .iter()
        .any(|p| p.id == identity.id && p.kind == identity.kind);
    if !caller_included {
        participants.push(Participant::from_identity(&identity, now));
    }
    participants.extend(request.participants.iter().cloned().map(|p| Participant {
        id: p.id,
        kind: p.kind,
        name: p.name,
        email: p.email,
        profile: p.profile,
        joined_at: now,
    }));

    validate_participants(request.kind, request.name.as_deref(), &participants)?;

    if request.kind.is_direct() {
        let existing = {
            let db = state.db.lock().await;
            db.find_active_direct(request.kind, &participants[0].id, &participants[1].id)?
        };
        if let Some(existing) = existing {
            return Ok((
                StatusCode::OK,
                Json(CreateConversationResponse {
                    success: true,
                    conversation: existing,
                    message: "Conversation already exists",
                    is_new: false,
                }),
            ));
        }
    }

    let conversation = Conversation::new(
        request.kind,
        request.name,
        request.description,
        participants,
        CreatorRef {
            id: identity.id.clone(),
            kind: identity.kind,
            name: identity.name.clone(),
        },
    );

    {
        let db = state.db.lock().await;
        db.insert_conversation(&conversation)?;
    }

    info!(
        conversation = %conversation.id,
        kind = conversation.kind.as_str(),
        "conversation created"
    );

    notify_new_conversation(&state, &conversation).await;

    Ok((
        StatusCode::CREATED,
        Json(CreateConversationResponse {
            success: true,
            conversation,
            message: "Conversation created successfully",
            is_new: true,
        }),
    ))
}

/// Queue a `new_conversation` notification for each participant other than
/// the creator who has no live connection right now; connected participants
/// get the row pushed immediately instead of queued silently.
async fn notify_new_conversation(state: &AppState, conversation: &Conversation) {
    for participant in &conversation.participants {
        if participant.id == conversation.created_by.id
            && participant.kind == conversation.created_by.kind
        {
            continue;
        }

        let notification = Notification::new_conversation(&participant.key(), conversation);
        let created = {
            let db = state.db.lock().await;
            db.insert_notification(&notification)
        };
        if let Err(e) = created {
            warn!(
                error = %e,
                recipient = %participant.key(),
                "failed to queue conversation notification"
            );
            continue;
        }

        if let Some(handle) = state.registry.lookup(&participant.key()).await {
            let pushed = handle.send(ServerEvent::PendingNotifications {
                notifications: vec![notification.clone()],
                count: 1,
            });
            if pushed {
                let stamped = {
                    let db = state.db.lock().await;
                    db.stamp_delivered(&[notification.id], Utc::now())
                };
                if let Err(e) = stamped {
                    warn!(error = %e, "failed to stamp pushed notification");
                }
            }
        }
    }
}

#[derive(Deserialize)]
struct AddParticipantRequest {
    participant: ParticipantInput,
}

#[derive(Serialize)]
struct MutateConversationResponse {
    success: bool,
    conversation: Conversation,
    message: &'static str,
}

async fn add_participant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(request): Json<AddParticipantRequest>,
) -> Result<Json<MutateConversationResponse>, ServerError> {
    let identity = current_identity(&state, &headers).await?;

    let db = state.db.lock().await;
    let conversation = db.get_conversation(id).map_err(or_not_found("Conversation"))?;

    if conversation.kind != ConversationKind::Group {
        return Err(ServerError::Validation(
            "Can only add participants to group conversations".to_string(),
        ));
    }
    let is_creator =
        conversation.created_by.id == identity.id && conversation.created_by.kind == identity.kind;
    if !is_creator && identity.kind != UserKind::Admin {
        return Err(ServerError::Forbidden(
            "Only the creator can add participants".to_string(),
        ));
    }

    let input = request.participant;
    db.add_participant(
        id,
        &Participant {
            id: input.id,
            kind: input.kind,
            name: input.name,
            email: input.email,
            profile: input.profile,
            joined_at: Utc::now(),
        },
    )?;

    let conversation = db.get_conversation(id)?;
    Ok(Json(MutateConversationResponse {
        success: true,
        conversation,
        message: "Participant added successfully",
    }))
}

async fn remove_participant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, user_id, user_kind)): Path<(Uuid, String, String)>,
) -> Result<Json<MutateConversationResponse>, ServerError> {
    let identity = current_identity(&state, &headers).await?;

    let kind = UserKind::parse(&user_kind)
        .ok_or_else(|| ServerError::Validation(format!("Unknown user kind: {user_kind}")))?;

    let db = state.db.lock().await;
    let conversation = db.get_conversation(id).map_err(or_not_found("Conversation"))?;

    if conversation.kind != ConversationKind::Group {
        return Err(ServerError::Validation(
            "Can only remove participants from group conversations".to_string(),
        ));
    }
    let is_self = user_id == identity.id && kind == identity.kind;
    let is_creator =
        conversation.created_by.id == identity.id && conversation.created_by.kind == identity.kind;
    if !is_self && !is_creator {
        return Err(ServerError::Forbidden("Access denied".to_string()));
    }

    db.remove_participant(id, &user_id, kind)?;

    let conversation = db.get_conversation(id)?;
    Ok(Json(MutateConversationResponse {
        success: true,
        conversation,
        message: "Participant removed successfully",
    }))
}

#[derive(Serialize)]
struct SimpleResponse {
    success: bool,
    message: &'static str,
}

async fn delete_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<SimpleResponse>, ServerError> {
    let identity = current_identity(&state, &headers).await?;

    let db = state.db.lock().await;
    let conversation = db.get_conversation(id).map_err(or_not_found("Conversation"))?;

    if conversation.created_by.id != identity.id || conversation.created_by.kind != identity.kind {
        return Err(ServerError::Forbidden(
            "Only the creator can delete a conversation".to_string(),
        ));
    }

    db.archive_conversation(id, Utc::now())?;
    info!(conversation = %id, "conversation archived");

    Ok(Json(SimpleResponse {
        success: true,
        message: "Conversation deleted successfully",
    }))
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMessagesQuery {
    limit: Option<u32>,
    before: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MessagesPagination {
    limit: u32,
    total: u64,
    has_more: bool,
    oldest: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct MessagesResponse {
    success: bool,
    messages: Vec<Message>,
    pagination: MessagesPagination,
}

async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Json<MessagesResponse>, ServerError> {
    let identity = current_identity(&state, &headers).await?;
    let limit = query.limit.unwrap_or(50).clamp(1, 200);

    let db = state.db.lock().await;
    let conversation = db.get_conversation(id).map_err(or_not_found("Conversation"))?;
    if !conversation.is_participant(&identity.id, identity.kind) {
        return Err(ServerError::Forbidden("Access denied".to_string()));
    }

    let messages = db.list_messages(id, limit, query.before)?;
    let total = db.message_count(id)?;
    let has_more = messages.len() as u32 == limit;
    let oldest = messages.first().map(|m| m.created_at);

    Ok(Json(MessagesResponse {
        success: true,
        messages,
        pagination: MessagesPagination {
            limit,
            total,
            has_more,
            oldest,
        },
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    conversation_id: Uuid,
    message: String,
    #[serde(default)]
    message_type: MessageKind,
    #[serde(default)]
    reply_to: Option<ReplyRef>,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    success: bool,
    message: Message,
}

/// Persist a message without any live broadcast; clients polling over REST
/// pick it up from the listing. The WebSocket path is the fan-out engine.
async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), ServerError> {
    let identity = current_identity(&state, &headers).await?;

    let body = request.message.trim().to_string();
    if body.is_empty() {
        return Err(ServerError::Validation(
            "conversationId and message are required".to_string(),
        ));
    }

    let db = state.db.lock().await;
    let conversation = db
        .get_conversation(request.conversation_id)
        .map_err(or_not_found("Conversation"))?;
    if !conversation.is_participant(&identity.id, identity.kind) {
        return Err(ServerError::Forbidden("Access denied".to_string()));
    }

    let message = Message::new(
        request.conversation_id,
        &identity,
        body,
        request.message_type,
        request.reply_to,
    );
    db.insert_message(&message)?;

    if let Err(e) = db.touch_last_message(
        request.conversation_id,
        &message.summary(),
        message.created_at,
    ) {
        warn!(error = %e, conversation = %request.conversation_id, "failed to update conversation summary");
    }

    info!(message = %message.id, conversation = %request.conversation_id, "message stored via REST");

    Ok((
        StatusCode::CREATED,
        Json(MessageResponse {
            success: true,
            message,
        }),
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarkReadRequest {
    #[serde(default)]
    message_ids: Option<Vec<Uuid>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MarkReadResponse {
    success: bool,
    marked_count: usize,
}

async fn mark_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(request): Json<MarkReadRequest>,
) -> Result<Json<MarkReadResponse>, ServerError> {
    let identity = current_identity(&state, &headers).await?;

    let marked = {
        let db = state.db.lock().await;
        db.mark_read(
            id,
            &identity.id,
            identity.kind,
            &identity.name,
            request.message_ids.as_deref(),
            Utc::now(),
        )?
    };

    Ok(Json(MarkReadResponse {
        success: true,
        marked_count: marked.len(),
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UnreadCountResponse {
    success: bool,
    conversation_id: Uuid,
    unread_count: u64,
}

async fn unread_count(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<UnreadCountResponse>, ServerError> {
    let identity = current_identity(&state, &headers).await?;

    let count = {
        let db = state.db.lock().await;
        db.unread_count(id, &identity.id, identity.kind)?
    };

    Ok(Json(UnreadCountResponse {
        success: true,
        conversation_id: id,
        unread_count: count,
    }))
}

#[derive(Deserialize)]
struct EditMessageRequest {
    message: String,
}

async fn edit_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(request): Json<EditMessageRequest>,
) -> Result<Json<MessageResponse>, ServerError> {
    let identity = current_identity(&state, &headers).await?;

    let body = request.message.trim().to_string();
    if body.is_empty() {
        return Err(ServerError::Validation(
            "Message cannot be empty".to_string(),
        ));
    }

    let db = state.db.lock().await;
    let message = db.get_message(id).map_err(or_not_found("Message"))?;

    if message.sender_id != identity.id || message.sender_kind != identity.kind {
        return Err(ServerError::Forbidden(
            "You can only edit your own messages".to_string(),
        ));
    }
    if message.kind == MessageKind::System {
        return Err(ServerError::Validation(
            "Cannot edit system messages".to_string(),
        ));
    }

    let message = db.edit_message(id, &body, Utc::now())?;

    Ok(Json(MessageResponse {
        success: true,
        message,
    }))
}

async fn delete_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<SimpleResponse>, ServerError> {
    let identity = current_identity(&state, &headers).await?;

    let db = state.db.lock().await;
    let message = db.get_message(id).map_err(or_not_found("Message"))?;

    if message.sender_id != identity.id || message.sender_kind != identity.kind {
        return Err(ServerError::Forbidden(
            "You can only delete your own messages".to_string(),
        ));
    }

    db.soft_delete_message(id, Utc::now())?;

    Ok(Json(SimpleResponse {
        success: true,
        message: "Message deleted successfully",
    }))
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct NotificationsResponse {
    success: bool,
    notifications: Vec<Notification>,
    count: usize,
}

async fn unread_notifications(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<NotificationsResponse>, ServerError> {
    let identity = current_identity(&state, &headers).await?;

    let notifications = {
        let db = state.db.lock().await;
        db.unread_notifications(&identity.id, identity.kind, 50)?
    };

    Ok(Json(NotificationsResponse {
        success: true,
        count: notifications.len(),
        notifications,
    }))
}

#[derive(Deserialize)]
struct ListNotificationsQuery {
    page: Option<u32>,
    limit: Option<u32>,
}

#[derive(Serialize)]
struct NotificationsPagination {
    page: u32,
    limit: u32,
    total: u64,
    pages: u64,
}

#[derive(Serialize)]
struct PagedNotificationsResponse {
    success: bool,
    notifications: Vec<Notification>,
    pagination: NotificationsPagination,
}

async fn list_notifications(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListNotificationsQuery>,
) -> Result<Json<PagedNotificationsResponse>, ServerError> {
    let identity = current_identity(&state, &headers).await?;
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let offset = (page - 1) * limit;

    let db = state.db.lock().await;
    let notifications = db.list_notifications(&identity.id, identity.kind, limit, offset)?;
    let total = db.notification_count(&identity.id, identity.kind)?;

    Ok(Json(PagedNotificationsResponse {
        success: true,
        notifications,
        pagination: NotificationsPagination {
            page,
            limit,
            total,
            pages: total.div_ceil(limit as u64),
        },
    }))
}

#[derive(Serialize)]
struct NotificationResponse {
    success: bool,
    notification: Notification,
}

async fn read_notification(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<NotificationResponse>, ServerError> {
    let identity = current_identity(&state, &headers).await?;

    let notification = {
        let db = state.db.lock().await;
        db.mark_notification_read(id, &identity.id, identity.kind, Utc::now())
            .map_err(or_not_found("Notification"))?
    };

    Ok(Json(NotificationResponse {
        success: true,
        notification,
    }))
}

#[derive(Serialize)]
struct ReadAllResponse {
    success: bool,
    count: usize,
}

async fn read_all_notifications(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ReadAllResponse>, ServerError> {
    let identity = current_identity(&state, &headers).await?;

    let count = {
        let db = state.db.lock().await;
        db.mark_all_notifications_read(&identity.id, identity.kind, Utc::now())?
    };

    Ok(Json(ReadAllResponse {
        success: true,
        count,
    }))
}

async fn delete_notification(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<SimpleResponse>, ServerError> {
    let identity = current_identity(&state, &headers).await?;

    {
        let db = state.db.lock().await;
        db.delete_notification(id, &identity.id, identity.kind)
            .map_err(or_not_found("Notification"))?;
    }

    Ok(Json(SimpleResponse {
        success: true,
        message: "Notification deleted",
    }))
}
