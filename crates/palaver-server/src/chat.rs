//! WebSocket connection handling: the live-delivery core.
//!
//! Each accepted socket runs one event-loop task that processes its inbound
//! events to completion, one at a time, while handlers for different
//! connections interleave freely. Outbound events flow through an unbounded
//! per-connection queue so a broadcast never blocks on a slow socket.
//!
//! Per-event failures emit a scoped `error` event back to the offending
//! connection only; the connection stays open and usable.

use std::collections::HashMap;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use palaver_shared::events::{ClientEvent, ConversationRef, ServerEvent};
use palaver_shared::model::{Conversation, Message, MessageKind, Notification, ReplyRef};
use palaver_shared::Identity;

use crate::api::AppState;
use crate::auth;
use crate::error::{or_not_found, ServerError};
use crate::registry::{ConnectionHandle, ConnectionId};

/// Cap on how many queued notifications are pushed on reconnect.
const PENDING_NOTIFICATIONS_LIMIT: u32 = 50;

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

/// Upgrade handler for `GET /ws`. The bearer credential (query parameter or
/// `Authorization` header) is resolved before the upgrade completes; a bad
/// credential rejects the handshake with a descriptive error.
pub async fn ws_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    let token = match params.get("token") {
        Some(token) if !token.is_empty() => token.clone(),
        _ => auth::bearer_token(&headers)?,
    };
    let identity = state.auth.authenticate(&token).await?;

    Ok(ws.on_upgrade(move |socket| handle_connection(state, socket, identity)))
}

/// Per-connection event loop.
async fn handle_connection(state: AppState, socket: WebSocket, identity: Identity) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = ConnectionHandle::new(identity, tx);

    on_connect(&state, &conn).await;

    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(WsMessage::Text(text))) => dispatch(&state, &conn, &text).await,
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection = %conn.id, error = %e, "socket error");
                    break;
                }
            },
            outbound = rx.recv() => match outbound {
                Some(event) => match serde_json::to_string(&event) {
                    Ok(json) => {
                        if sink.send(WsMessage::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => error!(error = %e, "failed to serialize outbound event"),
                },
                None => break,
            },
        }
    }

    on_disconnect(&state, &conn).await;
}

/// Register the connection, transition presence online, and drain any
/// queued notifications to the fresh socket.
async fn on_connect(state: &AppState, conn: &ConnectionHandle) {
    info!(
        connection = %conn.id,
        user = %conn.identity.name,
        kind = %conn.identity.kind,
        "connection established"
    );

    if let Some(previous) = state.registry.register(conn.clone()).await {
        // Reconnect or second tab: replace, don't merge, and emit no
        // intervening offline transition.
        debug!(
            connection = %conn.id,
            superseded = %previous.id,
            user = %conn.identity.name,
            "replaced previous connection for identity"
        );
    }

    let now = Utc::now();
    let online = {
        let db = state.db.lock().await;
        db.set_online(&conn.identity.id, conn.identity.kind, conn.id.as_uuid(), now)
    };
    match online {
        Ok(()) => {
            state
                .registry
                .broadcast_all(&ServerEvent::UserStatus {
                    user_id: conn.identity.id.clone(),
                    user_kind: conn.identity.kind,
                    user_name: conn.identity.name.clone(),
                    is_online: true,
                    last_seen: None,
                })
                .await;
        }
        Err(e) => warn!(error = %e, user = %conn.key(), "failed to update online presence"),
    }

    deliver_pending_notifications(state, conn).await;
}

/// Tear the connection down. Room membership always goes; the presence
/// transition and registry entry only when this connection still owns them.
async fn on_disconnect(state: &AppState, conn: &ConnectionHandle) {
    info!(connection = %conn.id, user = %conn.identity.name, "connection closed");

    state.rooms.leave_all(conn.id).await;

    if !state.registry.unregister(&conn.key(), conn.id).await {
        debug!(
            connection = %conn.id,
            user = %conn.identity.name,
            "stale disconnect; a newer connection is live"
        );
        return;
    }

    let now = Utc::now();
    let offline = {
        let db = state.db.lock().await;
        db.set_offline(&conn.identity.id, conn.identity.kind, now)
    };
    match offline {
        Ok(()) => {
            state
                .registry
                .broadcast_all(&ServerEvent::UserStatus {
                    user_id: conn.identity.id.clone(),
                    user_kind: conn.identity.kind,
                    user_name: conn.identity.name.clone(),
                    is_online: false,
                    last_seen: Some(now),
                })
                .await;
        }
        Err(e) => warn!(error = %e, user = %conn.key(), "failed to update offline presence"),
    }
}

/// Push all unacknowledged notifications as one batch, then stamp them
/// delivered. Stamping happens only after the push is queued; a stamping
/// failure just means re-delivery on the next reconnect, which clients
/// de-duplicate by notification id.
async fn deliver_pending_notifications(state: &AppState, conn: &ConnectionHandle) {
    let pending = {
        let db = state.db.lock().await;
        db.unread_notifications(
            &conn.identity.id,
            conn.identity.kind,
            PENDING_NOTIFICATIONS_LIMIT,
        )
    };
    let pending = match pending {
        Ok(pending) => pending,
        Err(e) => {
            warn!(error = %e, user = %conn.key(), "failed to load pending notifications");
            return;
        }
    };
    if pending.is_empty() {
        return;
    }

    let ids: Vec<Uuid> = pending.iter().map(|n| n.id).collect();
    let count = pending.len();
    info!(connection = %conn.id, count, "delivering pending notifications");

    if !conn.send(ServerEvent::PendingNotifications {
        notifications: pending,
        count,
    }) {
        return;
    }

    let stamped = {
        let db = state.db.lock().await;
        db.stamp_delivered(&ids, Utc::now())
    };
    if let Err(e) = stamped {
        warn!(error = %e, "failed to stamp notification delivery");
    }
}

// ---------------------------------------------------------------------------
// Event dispatch
// ---------------------------------------------------------------------------

async fn dispatch(state: &AppState, conn: &ConnectionHandle, raw: &str) {
    let event = match serde_json::from_str::<ClientEvent>(raw) {
        Ok(event) => event,
        Err(e) => {
            debug!(connection = %conn.id, error = %e, "unparseable client event");
            conn.send(ServerEvent::Error {
                message: "Invalid event payload".to_string(),
            });
            return;
        }
    };

    let outcome = match event {
        ClientEvent::JoinConversations => join_conversations(state, conn)
            .await
            .map_err(|e| scrub(e, "Failed to join conversations")),
        ClientEvent::JoinConversation { conversation_id } => {
            join_conversation(state, conn, conversation_id)
                .await
                .map_err(|e| scrub(e, "Failed to join conversation"))
        }
        ClientEvent::LeaveConversation { conversation_id } => {
            leave_conversation(state, conn, conversation_id).await;
            Ok(())
        }
        ClientEvent::SendMessage {
            conversation_id,
            message,
            message_type,
            reply_to,
        } => send_message(state, conn, conversation_id, message, message_type, reply_to)
            .await
            .map(|_| ())
            .map_err(|e| scrub(e, "Failed to send message")),
        ClientEvent::TypingStart { conversation_id } => {
            typing(state, conn, conversation_id, true).await;
            Ok(())
        }
        ClientEvent::TypingStop { conversation_id } => {
            typing(state, conn, conversation_id, false).await;
            Ok(())
        }
        ClientEvent::MarkRead {
            conversation_id,
            message_ids,
        } => mark_read(state, conn, conversation_id, message_ids)
            .await
            .map_err(|e| scrub(e, "Failed to mark messages as read")),
    };

    if let Err(message) = outcome {
        conn.send(ServerEvent::Error { message });
    }
}

/// Storage and internal failures are logged server-side and replaced with a
/// generic per-event message; everything else is already user-facing.
fn scrub(err: ServerError, fallback: &str) -> String {
    match err {
        ServerError::Storage(_) | ServerError::Internal(_) => {
            error!(error = %err, "event handler failed");
            fallback.to_string()
        }
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Event handlers
// ---------------------------------------------------------------------------

/// Join one room per active conversation the identity participates in.
async fn join_conversations(state: &AppState, conn: &ConnectionHandle) -> Result<(), ServerError> {
    let conversations = {
        let db = state.db.lock().await;
        db.conversations_for(&conn.identity.id, conn.identity.kind, None)?
    };

    for conversation in &conversations {
        state.rooms.join(conversation.id, conn.id).await;
    }

    info!(
        user = %conn.identity.name,
        count = conversations.len(),
        "joined conversation rooms"
    );
    conn.send(ServerEvent::ConversationsJoined {
        success: true,
        count: conversations.len(),
    });
    Ok(())
}

async fn join_conversation(
    state: &AppState,
    conn: &ConnectionHandle,
    conversation_id: Uuid,
) -> Result<(), ServerError> {
    let conversation = {
        let db = state.db.lock().await;
        db.get_conversation(conversation_id)
    }
    .map_err(or_not_found("Conversation"))?;

    if !conversation.is_participant(&conn.identity.id, conn.identity.kind) {
        return Err(ServerError::Forbidden("Access denied".to_string()));
    }

    state.rooms.join(conversation_id, conn.id).await;

    debug!(
        conversation = %conversation_id,
        user = %conn.identity.name,
        "joined conversation room"
    );
    conn.send(ServerEvent::ConversationJoined {
        success: true,
        conversation_id,
    });
    Ok(())
}

async fn leave_conversation(state: &AppState, conn: &ConnectionHandle, conversation_id: Uuid) {
    state.rooms.leave(conversation_id, conn.id).await;
    debug!(
        conversation = %conversation_id,
        user = %conn.identity.name,
        "left conversation room"
    );
}

/// The fan-out engine: persist, update the summary cache, broadcast to the
/// room (sender included), queue notifications for everyone unreachable,
/// and acknowledge the sender.
pub(crate) async fn send_message(
    state: &AppState,
    conn: &ConnectionHandle,
    conversation_id: Uuid,
    body: String,
    kind: MessageKind,
    reply_to: Option<ReplyRef>,
) -> Result<Message, ServerError> {
    let body = body.trim().to_string();
    if body.is_empty() {
        return Err(ServerError::Validation("Invalid message data".to_string()));
    }

    let conversation = {
        let db = state.db.lock().await;
        db.get_conversation(conversation_id)
    }
    .map_err(or_not_found("Conversation"))?;

    if !conversation.is_participant(&conn.identity.id, conn.identity.kind) {
        return Err(ServerError::Forbidden("Access denied".to_string()));
    }

    let message = Message::new(conversation_id, &conn.identity, body, kind, reply_to);

    // Primary write. A failure here surfaces to the sender and nothing is
    // broadcast.
    {
        let db = state.db.lock().await;
        db.insert_message(&message)?;
    }

    info!(
        message = %message.id,
        conversation = %conversation_id,
        sender = %conn.identity.name,
        "message sent"
    );

    // Secondary write. The summary is a cache over the message collection;
    // the message stays correct even when this write lags behind.
    let summary = message.summary();
    let touched = {
        let db = state.db.lock().await;
        db.touch_last_message(conversation_id, &summary, message.created_at)
    };
    if let Err(e) = touched {
        warn!(
            error = %e,
            conversation = %conversation_id,
            "failed to update conversation summary"
        );
    }

    // The sender observes its own message through the same room broadcast
    // as its peers; join it into the room first if a join never happened.
    if !state.rooms.contains(conversation_id, conn.id).await {
        state.rooms.join(conversation_id, conn.id).await;
    }

    let members = state.rooms.members(conversation_id).await;
    let event = ServerEvent::NewMessage {
        message: message.clone(),
        conversation: ConversationRef {
            id: conversation.id,
            kind: conversation.kind,
            last_message_summary: Some(summary),
        },
    };
    for member in &members {
        state.registry.send_to(*member, event.clone()).await;
    }

    queue_offline_notifications(state, &conversation, &message, &members).await;

    conn.send(ServerEvent::MessageSent {
        success: true,
        message: message.clone(),
    });
    Ok(message)
}

/// For every participant who is not a live member of the room snapshot,
/// durably queue exactly one notification. A participant who is connected
/// but viewing something else additionally gets the row pushed to their
/// connection right away.
async fn queue_offline_notifications(
    state: &AppState,
    conversation: &Conversation,
    message: &Message,
    room_snapshot: &[ConnectionId],
) {
    for participant in &conversation.participants {
        if participant.id == message.sender_id && participant.kind == message.sender_kind {
            continue;
        }

        let handle = state.registry.lookup(&participant.key()).await;
        let in_room = handle
            .as_ref()
            .map(|h| room_snapshot.contains(&h.id))
            .unwrap_or(false);
        if in_room {
            continue;
        }

        let notification = Notification::new_message(&participant.key(), conversation, message);
        let created = {
            let db = state.db.lock().await;
            db.insert_notification(&notification)
        };
        if let Err(e) = created {
            warn!(
                error = %e,
                recipient = %participant.key(),
                message = %message.id,
                "failed to queue offline notification"
            );
            continue;
        }
        debug!(
            recipient = %participant.key(),
            message = %message.id,
            "queued offline notification"
        );

        if let Some(handle) = handle {
            // Online but not in this room: best-effort live push.
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
                    debug!(error = %e, "failed to stamp pushed notification");
                }
            }
        }
    }
}

async fn typing(state: &AppState, conn: &ConnectionHandle, conversation_id: Uuid, is_typing: bool) {
    broadcast_except(
        state,
        conversation_id,
        conn.id,
        ServerEvent::UserTyping {
            conversation_id,
            user_id: conn.identity.id.clone(),
            user_kind: conn.identity.kind,
            user_name: conn.identity.name.clone(),
            is_typing,
        },
    )
    .await;
}

/// Bulk-mark messages read and tell the rest of the room.
async fn mark_read(
    state: &AppState,
    conn: &ConnectionHandle,
    conversation_id: Uuid,
    message_ids: Option<Vec<Uuid>>,
) -> Result<(), ServerError> {
    let marked = {
        let db = state.db.lock().await;
        db.mark_read(
            conversation_id,
            &conn.identity.id,
            conn.identity.kind,
            &conn.identity.name,
            message_ids.as_deref(),
            Utc::now(),
        )?
    };

    debug!(
        conversation = %conversation_id,
        user = %conn.identity.name,
        count = marked.len(),
        "messages marked read"
    );

    broadcast_except(
        state,
        conversation_id,
        conn.id,
        ServerEvent::MessagesRead {
            conversation_id,
            user_id: conn.identity.id.clone(),
            user_kind: conn.identity.kind,
            user_name: conn.identity.name.clone(),
            timestamp: Utc::now(),
        },
    )
    .await;

    conn.send(ServerEvent::MarkReadSuccess {
        success: true,
        conversation_id,
    });
    Ok(())
}

/// Send to every room member except `skip` (the acting connection).
async fn broadcast_except(
    state: &AppState,
    conversation_id: Uuid,
    skip: ConnectionId,
    event: ServerEvent,
) {
    for member in state.rooms.members(conversation_id).await {
        if member != skip {
            state.registry.send_to(member, event.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::{mpsc::UnboundedReceiver, Mutex};

    use palaver_shared::model::{ConversationKind, CreatorRef, Participant};
    use palaver_shared::UserKind;
    use palaver_store::Database;

    use crate::auth::{AuthError, AuthService, VerifyToken};
    use crate::config::ServerConfig;
    use crate::registry::ConnectionRegistry;
    use crate::rooms::RoomRegistry;

    struct RejectAll;

    #[async_trait::async_trait]
    impl VerifyToken for RejectAll {
        async fn verify(&self, _token: &str) -> Result<Identity, AuthError> {
            Err(AuthError::InvalidToken)
        }
    }

    fn test_state() -> AppState {
        AppState {
            db: Arc::new(Mutex::new(Database::open_in_memory().unwrap())),
            auth: Arc::new(AuthService::new(Arc::new(RejectAll), Duration::from_secs(300))),
            registry: Arc::new(ConnectionRegistry::new()),
            rooms: Arc::new(RoomRegistry::new()),
            config: Arc::new(ServerConfig::default()),
        }
    }

    fn identity(id: &str, kind: UserKind) -> Identity {
        Identity {
            id: id.to_string(),
            kind,
            name: format!("user {id}"),
            email: None,
            profile: None,
        }
    }

    fn open_connection(identity: Identity) -> (ConnectionHandle, UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(identity, tx), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn seed_direct(state: &AppState, a: &Identity, b: &Identity) -> Conversation {
        let conversation = Conversation::new(
            ConversationKind::DirectMixed,
            None,
            None,
            vec![
                Participant::from_identity(a, Utc::now()),
                Participant::from_identity(b, Utc::now()),
            ],
            CreatorRef {
                id: a.id.clone(),
                kind: a.kind,
                name: a.name.clone(),
            },
        );
        state
            .db
            .lock()
            .await
            .insert_conversation(&conversation)
            .unwrap();
        conversation
    }

    fn new_messages(events: &[ServerEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, ServerEvent::NewMessage { .. }))
            .count()
    }

    #[tokio::test]
    async fn fanout_reaches_every_room_member_including_sender() {
        let state = test_state();
        let alice = identity("1", UserKind::Admin);
        let bob = identity("2", UserKind::User);
        let conversation = seed_direct(&state, &alice, &bob).await;

        let (conn_a, mut rx_a) = open_connection(alice);
        let (conn_b, mut rx_b) = open_connection(bob.clone());
        on_connect(&state, &conn_a).await;
        on_connect(&state, &conn_b).await;
        join_conversations(&state, &conn_a).await.unwrap();
        join_conversations(&state, &conn_b).await.unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        send_message(
            &state,
            &conn_a,
            conversation.id,
            "hello both".to_string(),
            MessageKind::Text,
            None,
        )
        .await
        .unwrap();

        let a_events = drain(&mut rx_a);
        assert_eq!(new_messages(&a_events), 1);
        assert!(a_events
            .iter()
            .any(|e| matches!(e, ServerEvent::MessageSent { success: true, .. })));

        let b_events = drain(&mut rx_b);
        assert_eq!(new_messages(&b_events), 1);

        // Both were reachable in the room: no rows queued.
        let db = state.db.lock().await;
        assert!(db.unread_notifications(&bob.id, bob.kind, 50).unwrap().is_empty());
    }

    #[tokio::test]
    async fn offline_participant_gets_exactly_one_notification() {
        let state = test_state();
        let alice = identity("1", UserKind::Admin);
        let bob = identity("2", UserKind::User);
        let conversation = seed_direct(&state, &alice, &bob).await;

        let (conn_a, mut rx_a) = open_connection(alice.clone());
        on_connect(&state, &conn_a).await;
        join_conversations(&state, &conn_a).await.unwrap();
        drain(&mut rx_a);

        send_message(
            &state,
            &conn_a,
            conversation.id,
            "hi".to_string(),
            MessageKind::Text,
            None,
        )
        .await
        .unwrap();

        {
            let db = state.db.lock().await;
            let pending = db.unread_notifications(&bob.id, bob.kind, 50).unwrap();
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].payload.excerpt, "hi");
            assert_eq!(pending[0].payload.sender_name, alice.name);
            assert!(pending[0].delivered_at.is_none());
            // None for the sender.
            assert!(db.unread_notifications(&alice.id, alice.kind, 50).unwrap().is_empty());
        }

        // Reconnect: the queued row is pushed once and stamped delivered.
        let (conn_b, mut rx_b) = open_connection(bob.clone());
        on_connect(&state, &conn_b).await;

        let events = drain(&mut rx_b);
        let pushed = events
            .iter()
            .find_map(|e| match e {
                ServerEvent::PendingNotifications { notifications, count } => {
                    Some((notifications.clone(), *count))
                }
                _ => None,
            })
            .expect("pending notifications pushed on connect");
        assert_eq!(pushed.1, 1);
        assert_eq!(pushed.0[0].payload.excerpt, "hi");

        let db = state.db.lock().await;
        let row = &db.unread_notifications(&bob.id, bob.kind, 50).unwrap()[0];
        assert!(row.delivered_at.is_some());
        assert!(!row.is_read);
    }

    #[tokio::test]
    async fn connected_but_elsewhere_gets_live_push_not_broadcast() {
        let state = test_state();
        let alice = identity("1", UserKind::Admin);
        let bob = identity("2", UserKind::User);
        let conversation = seed_direct(&state, &alice, &bob).await;

        let (conn_a, mut rx_a) = open_connection(alice);
        let (conn_b, mut rx_b) = open_connection(bob.clone());
        on_connect(&state, &conn_a).await;
        on_connect(&state, &conn_b).await;
        join_conversations(&state, &conn_a).await.unwrap();
        // Bob never joins the room.
        drain(&mut rx_a);
        drain(&mut rx_b);

        send_message(
            &state,
            &conn_a,
            conversation.id,
            "psst".to_string(),
            MessageKind::Text,
            None,
        )
        .await
        .unwrap();

        let b_events = drain(&mut rx_b);
        assert_eq!(new_messages(&b_events), 0);
        assert!(b_events.iter().any(|e| matches!(
            e,
            ServerEvent::PendingNotifications { count: 1, .. }
        )));

        // The row exists and was stamped delivered by the live push.
        let db = state.db.lock().await;
        let rows = db.unread_notifications(&bob.id, bob.kind, 50).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].delivered_at.is_some());
    }

    #[tokio::test]
    async fn sender_self_heals_into_the_room() {
        let state = test_state();
        let alice = identity("1", UserKind::Admin);
        let bob = identity("2", UserKind::User);
        let conversation = seed_direct(&state, &alice, &bob).await;

        let (conn_a, mut rx_a) = open_connection(alice);
        on_connect(&state, &conn_a).await;
        drain(&mut rx_a);

        // Send without ever joining.
        send_message(
            &state,
            &conn_a,
            conversation.id,
            "first".to_string(),
            MessageKind::Text,
            None,
        )
        .await
        .unwrap();

        assert!(state.rooms.contains(conversation.id, conn_a.id).await);
        let events = drain(&mut rx_a);
        // The sender still saw its own message via the broadcast path.
        assert_eq!(new_messages(&events), 1);
    }

    #[tokio::test]
    async fn rapid_reconnect_never_flickers_offline() {
        let state = test_state();
        let alice = identity("1", UserKind::Admin);

        let (conn_old, _rx_old) = open_connection(alice.clone());
        on_connect(&state, &conn_old).await;

        // Tab refresh: a second connection lands before the first one's
        // disconnect is processed.
        let (conn_new, mut rx_new) = open_connection(alice.clone());
        on_connect(&state, &conn_new).await;
        drain(&mut rx_new);

        on_disconnect(&state, &conn_old).await;

        // The identity is still online on the newer connection.
        let handle = state.registry.lookup(&alice.key()).await.unwrap();
        assert_eq!(handle.id, conn_new.id);
        {
            let db = state.db.lock().await;
            let presence = db.get_presence(&alice.id, alice.kind).unwrap().unwrap();
            assert!(presence.is_online);
        }
        let offline_broadcasts = drain(&mut rx_new)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::UserStatus { is_online: false, .. }))
            .count();
        assert_eq!(offline_broadcasts, 0);

        // The owning connection's disconnect transitions for real.
        on_disconnect(&state, &conn_new).await;
        assert!(state.registry.lookup(&alice.key()).await.is_none());
        let db = state.db.lock().await;
        let presence = db.get_presence(&alice.id, alice.kind).unwrap().unwrap();
        assert!(!presence.is_online);
    }

    #[tokio::test]
    async fn disconnect_clears_room_membership() {
        let state = test_state();
        let alice = identity("1", UserKind::Admin);
        let bob = identity("2", UserKind::User);
        let conversation = seed_direct(&state, &alice, &bob).await;

        let (conn_a, _rx_a) = open_connection(alice);
        on_connect(&state, &conn_a).await;
        join_conversations(&state, &conn_a).await.unwrap();
        assert!(state.rooms.contains(conversation.id, conn_a.id).await);

        on_disconnect(&state, &conn_a).await;
        assert!(!state.rooms.contains(conversation.id, conn_a.id).await);
    }

    #[tokio::test]
    async fn empty_body_is_rejected_without_side_effects() {
        let state = test_state();
        let alice = identity("1", UserKind::Admin);
        let bob = identity("2", UserKind::User);
        let conversation = seed_direct(&state, &alice, &bob).await;

        let (conn_a, _rx_a) = open_connection(alice);
        on_connect(&state, &conn_a).await;

        let err = send_message(
            &state,
            &conn_a,
            conversation.id,
            "   ".to_string(),
            MessageKind::Text,
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServerError::Validation(_)));

        let db = state.db.lock().await;
        assert_eq!(db.message_count(conversation.id).unwrap(), 0);
        assert!(db.unread_notifications(&bob.id, bob.kind, 50).unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_participant_cannot_send() {
        let state = test_state();
        let alice = identity("1", UserKind::Admin);
        let bob = identity("2", UserKind::User);
        let mallory = identity("3", UserKind::User);
        let conversation = seed_direct(&state, &alice, &bob).await;

        let (conn_m, _rx_m) = open_connection(mallory);
        on_connect(&state, &conn_m).await;

        let err = send_message(
            &state,
            &conn_m,
            conversation.id,
            "let me in".to_string(),
            MessageKind::Text,
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServerError::Forbidden(_)));

        let db = state.db.lock().await;
        assert_eq!(db.message_count(conversation.id).unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_conversation_is_not_found() {
        let state = test_state();
        let alice = identity("1", UserKind::Admin);
        let (conn_a, _rx_a) = open_connection(alice);
        on_connect(&state, &conn_a).await;

        let err = send_message(
            &state,
            &conn_a,
            Uuid::new_v4(),
            "hello?".to_string(),
            MessageKind::Text,
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));

        let err = join_conversation(&state, &conn_a, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));
    }

    #[tokio::test]
    async fn mark_read_is_idempotent_and_room_scoped() {
        let state = test_state();
        let alice = identity("1", UserKind::Admin);
        let bob = identity("2", UserKind::User);
        let conversation = seed_direct(&state, &alice, &bob).await;

        let (conn_a, mut rx_a) = open_connection(alice.clone());
        on_connect(&state, &conn_a).await;
        join_conversations(&state, &conn_a).await.unwrap();

        let message = send_message(
            &state,
            &conn_a,
            conversation.id,
            "read me".to_string(),
            MessageKind::Text,
            None,
        )
        .await
        .unwrap();
        drain(&mut rx_a);

        let (conn_b, mut rx_b) = open_connection(bob.clone());
        on_connect(&state, &conn_b).await;
        join_conversations(&state, &conn_b).await.unwrap();
        drain(&mut rx_b);

        mark_read(&state, &conn_b, conversation.id, None).await.unwrap();
        mark_read(&state, &conn_b, conversation.id, None).await.unwrap();

        {
            let db = state.db.lock().await;
            let loaded = db.get_message(message.id).unwrap();
            assert_eq!(loaded.read_by.len(), 1);
            assert!(loaded.is_read_by(&bob.id, bob.kind));
        }

        // The reader got two acks, the peer got the room event, and the
        // reader never received its own read event back.
        let b_events = drain(&mut rx_b);
        assert_eq!(
            b_events
                .iter()
                .filter(|e| matches!(e, ServerEvent::MarkReadSuccess { .. }))
                .count(),
            2
        );
        assert!(!b_events
            .iter()
            .any(|e| matches!(e, ServerEvent::MessagesRead { .. })));

        let a_events = drain(&mut rx_a);
        assert!(a_events
            .iter()
            .any(|e| matches!(e, ServerEvent::MessagesRead { .. })));
    }

    #[tokio::test]
    async fn typing_events_skip_the_typist() {
        let state = test_state();
        let alice = identity("1", UserKind::Admin);
        let bob = identity("2", UserKind::User);
        let conversation = seed_direct(&state, &alice, &bob).await;

        let (conn_a, mut rx_a) = open_connection(alice);
        let (conn_b, mut rx_b) = open_connection(bob);
        on_connect(&state, &conn_a).await;
        on_connect(&state, &conn_b).await;
        join_conversations(&state, &conn_a).await.unwrap();
        join_conversations(&state, &conn_b).await.unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        typing(&state, &conn_a, conversation.id, true).await;

        assert!(drain(&mut rx_a).is_empty());
        let b_events = drain(&mut rx_b);
        assert!(matches!(
            b_events.as_slice(),
            [ServerEvent::UserTyping { is_typing: true, .. }]
        ));
    }

    #[tokio::test]
    async fn presence_broadcast_reaches_all_connections() {
        let state = test_state();
        let alice = identity("1", UserKind::Admin);
        let bob = identity("2", UserKind::User);

        let (conn_a, mut rx_a) = open_connection(alice);
        on_connect(&state, &conn_a).await;
        drain(&mut rx_a);

        let (conn_b, _rx_b) = open_connection(bob.clone());
        on_connect(&state, &conn_b).await;

        let a_events = drain(&mut rx_a);
        assert!(a_events.iter().any(|e| matches!(
            e,
            ServerEvent::UserStatus { is_online: true, user_id, .. } if user_id == &bob.id
        )));

        on_disconnect(&state, &conn_b).await;
        let a_events = drain(&mut rx_a);
        assert!(a_events.iter().any(|e| matches!(
            e,
            ServerEvent::UserStatus { is_online: false, last_seen: Some(_), user_id, .. }
                if user_id == &bob.id
        )));
    }

    #[tokio::test]
    async fn dispatch_reports_unparseable_events() {
        let state = test_state();
        let alice = identity("1", UserKind::Admin);
        let (conn_a, mut rx_a) = open_connection(alice);
        on_connect(&state, &conn_a).await;
        drain(&mut rx_a);

        dispatch(&state, &conn_a, "not json at all").await;
        dispatch(&state, &conn_a, r#"{"event":"send_message","data":{}}"#).await;

        let events = drain(&mut rx_a);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, ServerEvent::Error { .. }))
                .count(),
            2
        );
    }
}
